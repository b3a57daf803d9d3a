//! Changes-feed types: options, filters, events, and the continuous feed.
//!
//! The HTTP side lives in `client`; this module owns the wire vocabulary
//! and the incremental NDJSON parsing that continuous feeds depend on.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::document::Document;
use crate::error::Result;
use crate::expr::Selector;
use crate::naming::PropertyPolicy;
use crate::translate;

/// How a `_changes` request blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Return the whole payload immediately.
    Normal,
    /// Block until the first change or the timeout.
    LongPoll,
    /// Stream NDJSON until the client cancels.
    Continuous,
}

/// Options shared by all feed modes.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Resume token; `"now"` means the current moment.
    pub since: Option<String>,
    /// Embed the full document in each event.
    pub include_docs: bool,
    /// Maximum events before the feed terminates.
    pub limit: Option<u64>,
    pub descending: bool,
    /// Server keepalive interval; continuous feeds only.
    pub heartbeat: Option<Duration>,
    /// Long-poll maximum wait.
    pub timeout: Option<Duration>,
    /// Include conflicting revs.
    pub conflicts: bool,
    /// Include attachment bodies.
    pub attachments: bool,
    /// Include attachment encoding metadata.
    pub att_encoding_info: bool,
    /// Full revision history per event (`style=all_docs`).
    pub all_docs_style: bool,
}

impl ChangesOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, token: impl Into<String>) -> Self {
        self.since = Some(token.into());
        self
    }

    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn conflicts(mut self, conflicts: bool) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn attachments(mut self, attachments: bool) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn att_encoding_info(mut self, info: bool) -> Self {
        self.att_encoding_info = info;
        self
    }

    pub fn all_docs_style(mut self, all: bool) -> Self {
        self.all_docs_style = all;
        self
    }

    /// Wire query parameters for the given mode.
    pub(crate) fn to_params(&self, mode: FeedMode) -> Vec<(String, String)> {
        let mut params = Vec::new();
        match mode {
            FeedMode::Normal => {}
            FeedMode::LongPoll => params.push(("feed".into(), "longpoll".into())),
            FeedMode::Continuous => params.push(("feed".into(), "continuous".into())),
        }
        if let Some(since) = &self.since {
            params.push(("since".into(), since.clone()));
        }
        if self.include_docs {
            params.push(("include_docs".into(), "true".into()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        if self.descending {
            params.push(("descending".into(), "true".into()));
        }
        if mode == FeedMode::Continuous {
            if let Some(hb) = self.heartbeat {
                params.push(("heartbeat".into(), hb.as_millis().to_string()));
            }
        }
        if mode == FeedMode::LongPoll {
            if let Some(timeout) = self.timeout {
                params.push(("timeout".into(), timeout.as_millis().to_string()));
            }
        }
        if self.conflicts {
            params.push(("conflicts".into(), "true".into()));
        }
        if self.attachments {
            params.push(("attachments".into(), "true".into()));
        }
        if self.att_encoding_info {
            params.push(("att_encoding_info".into(), "true".into()));
        }
        if self.all_docs_style {
            params.push(("style".into(), "all_docs".into()));
        }
        params
    }
}

/// Server-side filter for a changes feed.
#[derive(Debug, Clone)]
pub enum ChangesFilter {
    /// Mango selector, translated like a query and POSTed as the body.
    Selector(Selector),
    /// Only the named documents.
    DocumentIds(Vec<String>),
    /// Documents visible to a map view, `"ddoc/viewname"`.
    View(String),
    /// Design documents only.
    Design,
    /// A named filter function, `"ddoc/filtername"`.
    Named(String),
}

impl ChangesFilter {
    /// Negotiate wire form: extra query parameters plus an optional POST
    /// body. A body forces the request method to POST.
    pub(crate) fn negotiate(
        &self,
        policy: &PropertyPolicy,
    ) -> Result<(Vec<(String, String)>, Option<Value>)> {
        match self {
            ChangesFilter::Selector(selector) => {
                let optimized = crate::optimize::optimize(selector.clone());
                let sel = translate::selector_value(&optimized, policy)?;
                Ok((
                    vec![("filter".into(), "_selector".into())],
                    Some(serde_json::json!({ "selector": sel })),
                ))
            }
            ChangesFilter::DocumentIds(ids) => Ok((
                vec![("filter".into(), "_doc_ids".into())],
                Some(serde_json::json!({ "doc_ids": ids })),
            )),
            ChangesFilter::View(view) => Ok((
                vec![
                    ("filter".into(), "_view".into()),
                    ("view".into(), view.clone()),
                ],
                None,
            )),
            ChangesFilter::Design => Ok((vec![("filter".into(), "_design".into())], None)),
            ChangesFilter::Named(name) => Ok((vec![("filter".into(), name.clone())], None)),
        }
    }
}

/// One revision entry in a change.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangedRev {
    pub rev: String,
}

/// One document-level change.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct ChangesEvent<T> {
    pub seq: String,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ChangedRev>,
    #[serde(default)]
    pub deleted: bool,
    /// Present when `include_docs` was requested.
    #[serde(default)]
    pub doc: Option<Document<T>>,
}

/// Payload of a normal or long-poll feed.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct ChangesPage<T> {
    pub results: Vec<ChangesEvent<T>>,
    #[serde(default)]
    pub last_seq: Option<String>,
    #[serde(default)]
    pub pending: Option<u64>,
}

/// Splits a byte stream into `\n`-terminated records across arbitrary
/// chunk boundaries.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// One parsed line of a continuous feed.
pub(crate) enum ContinuousLine<T> {
    /// Blank keepalive line.
    Heartbeat,
    Event(ChangesEvent<T>),
    /// Terminal line of a feed that ended server-side (e.g. `limit`).
    End {
        #[allow(dead_code)]
        last_seq: Option<String>,
    },
}

pub(crate) fn parse_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<ContinuousLine<T>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ContinuousLine::Heartbeat);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    if let Some(last_seq) = value.get("last_seq") {
        return Ok(ContinuousLine::End {
            last_seq: last_seq.as_str().map(|s| s.to_string()),
        });
    }
    let event: ChangesEvent<T> = serde_json::from_value(value)?;
    Ok(ContinuousLine::Event(event))
}

/// A cancellable continuous feed.
///
/// Events arrive through a single-slot hand-off: the reader task blocks
/// until the consumer takes the previous event, so the feed never buffers
/// beyond one record.
pub struct ChangesFeed<T> {
    rx: mpsc::Receiver<Result<ChangesEvent<T>>>,
    reader: JoinHandle<()>,
    cancelled: bool,
}

impl<T> ChangesFeed<T> {
    pub(crate) fn new(rx: mpsc::Receiver<Result<ChangesEvent<T>>>, reader: JoinHandle<()>) -> Self {
        Self {
            rx,
            reader,
            cancelled: false,
        }
    }

    /// The next event, or `None` after cancellation or a clean EOF.
    pub async fn next(&mut self) -> Option<Result<ChangesEvent<T>>> {
        if self.cancelled {
            return None;
        }
        self.rx.recv().await
    }

    /// Abort the feed. The underlying HTTP read is dropped, releasing the
    /// socket, and no further events are observable.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.reader.abort();
        self.rx.close();
    }
}

impl<T> Drop for ChangesFeed<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::field;

    #[test]
    fn params_for_each_mode() {
        let opts = ChangesOptions::new()
            .since("now")
            .include_docs(true)
            .limit(10)
            .heartbeat(Duration::from_secs(30))
            .timeout(Duration::from_secs(60));

        let normal = opts.to_params(FeedMode::Normal);
        assert!(!normal.iter().any(|(k, _)| k == "feed"));
        assert!(normal.contains(&("since".into(), "now".into())));
        assert!(normal.contains(&("include_docs".into(), "true".into())));
        // Heartbeat is continuous-only, timeout long-poll-only.
        assert!(!normal.iter().any(|(k, _)| k == "heartbeat"));
        assert!(!normal.iter().any(|(k, _)| k == "timeout"));

        let longpoll = opts.to_params(FeedMode::LongPoll);
        assert!(longpoll.contains(&("feed".into(), "longpoll".into())));
        assert!(longpoll.contains(&("timeout".into(), "60000".into())));

        let continuous = opts.to_params(FeedMode::Continuous);
        assert!(continuous.contains(&("feed".into(), "continuous".into())));
        assert!(continuous.contains(&("heartbeat".into(), "30000".into())));
    }

    #[test]
    fn style_and_flags_render() {
        let opts = ChangesOptions::new()
            .descending(true)
            .conflicts(true)
            .attachments(true)
            .att_encoding_info(true)
            .all_docs_style(true);
        let params = opts.to_params(FeedMode::Normal);
        assert!(params.contains(&("descending".into(), "true".into())));
        assert!(params.contains(&("conflicts".into(), "true".into())));
        assert!(params.contains(&("attachments".into(), "true".into())));
        assert!(params.contains(&("att_encoding_info".into(), "true".into())));
        assert!(params.contains(&("style".into(), "all_docs".into())));
    }

    #[test]
    fn selector_filter_negotiates_post_body() {
        let policy = PropertyPolicy::default();
        let filter = ChangesFilter::Selector(field("kind").eq("order"));
        let (params, body) = filter.negotiate(&policy).unwrap();
        assert_eq!(params, vec![("filter".to_string(), "_selector".to_string())]);
        assert_eq!(
            body.unwrap().to_string(),
            r#"{"selector":{"kind":{"$eq":"order"}}}"#
        );
    }

    #[test]
    fn doc_ids_filter_negotiates_post_body() {
        let policy = PropertyPolicy::default();
        let filter = ChangesFilter::DocumentIds(vec!["a".into(), "b".into()]);
        let (params, body) = filter.negotiate(&policy).unwrap();
        assert_eq!(params[0].1, "_doc_ids");
        assert_eq!(body.unwrap().to_string(), r#"{"doc_ids":["a","b"]}"#);
    }

    #[test]
    fn query_parameter_filters_have_no_body() {
        let policy = PropertyPolicy::default();

        let (params, body) = ChangesFilter::View("app/by-kind".into())
            .negotiate(&policy)
            .unwrap();
        assert!(body.is_none());
        assert!(params.contains(&("filter".into(), "_view".into())));
        assert!(params.contains(&("view".into(), "app/by-kind".into())));

        let (params, body) = ChangesFilter::Design.negotiate(&policy).unwrap();
        assert!(body.is_none());
        assert_eq!(params[0].1, "_design");

        let (params, body) = ChangesFilter::Named("app/mine".into())
            .negotiate(&policy)
            .unwrap();
        assert!(body.is_none());
        assert_eq!(params[0].1, "app/mine");
    }

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"{\"seq\":\"1\",").is_empty());
        let lines = buf.push(b"\"id\":\"a\"}\n\n{\"seq\":");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"seq":"1","id":"a"}"#);
        assert_eq!(lines[1], "");
        let lines = buf.push(b"\"2\",\"id\":\"b\"}\r\n");
        assert_eq!(lines, vec![r#"{"seq":"2","id":"b"}"#.to_string()]);
    }

    #[test]
    fn parse_line_classifies_records() {
        let hb = parse_line::<serde_json::Value>("").unwrap();
        assert!(matches!(hb, ContinuousLine::Heartbeat));

        let ev = parse_line::<serde_json::Value>(
            r#"{"seq":"3-x","id":"doc1","changes":[{"rev":"1-a"}]}"#,
        )
        .unwrap();
        match ev {
            ContinuousLine::Event(e) => {
                assert_eq!(e.id, "doc1");
                assert_eq!(e.changes[0].rev, "1-a");
                assert!(!e.deleted);
            }
            _ => panic!("expected event"),
        }

        let end = parse_line::<serde_json::Value>(r#"{"last_seq":"9-z","pending":0}"#).unwrap();
        assert!(matches!(end, ContinuousLine::End { .. }));
    }

    #[test]
    fn deleted_events_parse() {
        let ev = parse_line::<serde_json::Value>(
            r#"{"seq":"4-y","id":"gone","changes":[{"rev":"2-b"}],"deleted":true}"#,
        )
        .unwrap();
        match ev {
            ContinuousLine::Event(e) => assert!(e.deleted),
            _ => panic!("expected event"),
        }
    }
}
