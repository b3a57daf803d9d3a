//! Basic example demonstrating the loveseat CouchDB client.

use loveseat::{field, ChangesOptions, CouchClient, Credentials, Document};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Person {
    name: String,
    age: u32,
}

#[tokio::main]
async fn main() -> loveseat::Result<()> {
    // Connect to CouchDB
    let client = CouchClient::builder()
        .endpoint("http://localhost:5984")
        .credentials(Credentials::new("admin", "secret"))
        .build()?;
    let db = client.database("people");

    // Save a document
    let mut doc = Document::new(Person {
        name: "Luke".into(),
        age: 19,
    });
    db.save(&mut doc).await?;
    println!("Saved {} at rev {:?}", doc.id, doc.rev);

    // Query with the typed pipeline
    let adults = db
        .query()
        .filter(field("age").gte(18))
        .order_by("age")
        .then_by("name")
        .select(&["name", "age"])
        .take(25)
        .fetch::<Person>()
        .await?;
    for row in &adults.docs {
        println!("{} ({})", row.payload.name, row.payload.age);
    }

    // Fetch it back by id; a missing id is None, not an error
    let found: Option<Document<Person>> = db.get(&doc.id).await?;
    println!("Found: {:?}", found.map(|d| d.payload));

    // Watch changes from now on, then cancel after the first event
    let mut feed = db
        .changes_continuous::<Person>(&ChangesOptions::new().since("now").include_docs(true), None)
        .await?;
    if let Some(event) = feed.next().await {
        println!("Changed: {}", event?.id);
    }
    feed.cancel();

    Ok(())
}
