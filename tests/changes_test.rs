//! Changes-feed wire type tests.

use loveseat::{ChangesEvent, ChangesPage};
use serde_json::json;

#[derive(Debug, serde::Deserialize)]
struct Order {
    kind: String,
}

#[test]
fn event_with_embedded_doc_deserializes() {
    let raw = json!({
        "seq": "5-g1AAAA",
        "id": "orders:17",
        "changes": [{ "rev": "2-bb" }],
        "doc": {
            "_id": "orders:17",
            "_rev": "2-bb",
            "kind": "order",
        },
    });
    let event: ChangesEvent<Order> = serde_json::from_value(raw).unwrap();
    assert_eq!(event.seq, "5-g1AAAA");
    assert_eq!(event.id, "orders:17");
    assert_eq!(event.changes[0].rev, "2-bb");
    assert!(!event.deleted);
    let doc = event.doc.unwrap();
    assert_eq!(doc.id, "orders:17");
    assert_eq!(doc.payload.kind, "order");
}

#[test]
fn deletion_event_has_no_doc() {
    let raw = json!({
        "seq": "6-g1AAAB",
        "id": "orders:17",
        "changes": [{ "rev": "3-cc" }],
        "deleted": true,
    });
    let event: ChangesEvent<Order> = serde_json::from_value(raw).unwrap();
    assert!(event.deleted);
    assert!(event.doc.is_none());
}

#[test]
fn page_carries_terminal_fields() {
    let raw = json!({
        "results": [
            { "seq": "1-a", "id": "x", "changes": [{ "rev": "1-aa" }] },
            { "seq": "2-b", "id": "y", "changes": [{ "rev": "1-bb" }] },
        ],
        "last_seq": "2-b",
        "pending": 0,
    });
    let page: ChangesPage<Order> = serde_json::from_value(raw).unwrap();
    assert_eq!(page.results.len(), 2);
    assert_eq!(page.last_seq.as_deref(), Some("2-b"));
    assert_eq!(page.pending, Some(0));
    // Events arrive in server-assigned seq order; the client never reorders.
    assert_eq!(page.results[0].seq, "1-a");
    assert_eq!(page.results[1].seq, "2-b");
}

#[test]
fn page_without_terminal_fields_still_parses() {
    let raw = json!({ "results": [] });
    let page: ChangesPage<Order> = serde_json::from_value(raw).unwrap();
    assert!(page.results.is_empty());
    assert!(page.last_seq.is_none());
    assert!(page.pending.is_none());
}
