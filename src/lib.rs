//! loveseat: an async CouchDB client with a typed Mango query pipeline.
//!
//! Queries are captured as an expression tree, normalized, translated to
//! Mango JSON, and executed against `_find`; the changes feed is consumed
//! as a cancellable stream of typed events.
//!
//! # Example
//!
//! ```no_run
//! use loveseat::{field, ChangesOptions, CouchClient, Credentials, Document};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Person {
//!     name: String,
//!     age: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> loveseat::Result<()> {
//!     let client = CouchClient::builder()
//!         .endpoint("http://localhost:5984")
//!         .credentials(Credentials::new("admin", "secret"))
//!         .build()?;
//!     let db = client.database("people");
//!
//!     // Save a document.
//!     let mut doc = Document::new(Person { name: "Luke".into(), age: 19 });
//!     db.save(&mut doc).await?;
//!
//!     // Query with a typed pipeline.
//!     let adults = db
//!         .query()
//!         .filter(field("age").gte(18))
//!         .order_by("age")
//!         .take(25)
//!         .fetch::<Person>()
//!         .await?;
//!     println!("found {} adults", adults.docs.len());
//!
//!     // Stream changes until cancelled.
//!     let mut feed = db
//!         .changes_continuous::<Person>(&ChangesOptions::new().since("now"), None)
//!         .await?;
//!     while let Some(event) = feed.next().await {
//!         println!("changed: {}", event?.id);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod cache;
mod client;
mod compile;
mod document;
mod error;
mod optimize;
mod translate;

pub mod changes;
pub mod expr;
pub mod naming;
pub mod query;

pub use changes::{
    ChangedRev, ChangesEvent, ChangesFeed, ChangesFilter, ChangesOptions, ChangesPage, FeedMode,
};
pub use client::{
    CouchClient, CouchClientBuilder, CouchDatabase, Credentials, QueryContext,
};
pub use compile::CacheStats;
pub use document::{Attachment, AttachmentContent, AttachmentSet, AttachmentState, Document};
pub use error::{Error, Result};
pub use expr::{and, elem, field, not, or, CmpOp, FieldExpr, FieldPath, JsonKind, Segment, Selector};
pub use naming::{ArrayIndexing, CaseStyle, PropertyPolicy};
pub use query::{Direction, ExecutionStats, FindResult, IndexRef, PipelineOp, QueryBuilder};
pub use translate::MangoQuery;
