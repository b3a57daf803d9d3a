//! Typed query pipeline builder.
//!
//! A `QueryBuilder` captures the pipeline as IR; nothing touches the wire
//! until `fetch` hands the ops to the compiler. The same captured pipeline
//! always compiles to byte-identical Mango JSON.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::CouchDatabase;
use crate::document::Document;
use crate::error::Result;
use crate::expr::{FieldPath, Fnv128, Selector};

/// Sort direction of a collapsed sort spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// `use_index` argument: a design document, optionally with an index name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRef {
    DesignDoc(String),
    DesignDocAndName(String, String),
}

/// One captured pipeline operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOp {
    Where(Selector),
    OrderBy(FieldPath),
    ThenBy(FieldPath),
    OrderByDesc(FieldPath),
    ThenByDesc(FieldPath),
    Skip(u64),
    Take(u64),
    Select(Vec<FieldPath>),
    UseBookmark(String),
    UseIndex(IndexRef),
    WithReadQuorum(u32),
    UpdateIndex(bool),
    FromStable(bool),
}

impl PipelineOp {
    fn absorb(&self, h: &mut Fnv128) {
        match self {
            PipelineOp::Where(sel) => {
                h.write(&[0x20]);
                h.write(&sel.fingerprint().to_le_bytes());
            }
            PipelineOp::OrderBy(p)
            | PipelineOp::ThenBy(p)
            | PipelineOp::OrderByDesc(p)
            | PipelineOp::ThenByDesc(p) => {
                let tag = match self {
                    PipelineOp::OrderBy(_) => 0x21,
                    PipelineOp::ThenBy(_) => 0x22,
                    PipelineOp::OrderByDesc(_) => 0x23,
                    _ => 0x24,
                };
                h.write(&[tag]);
                absorb_path(h, p);
            }
            PipelineOp::Skip(n) => {
                h.write(&[0x25]);
                h.write(&n.to_le_bytes());
            }
            PipelineOp::Take(n) => {
                h.write(&[0x26]);
                h.write(&n.to_le_bytes());
            }
            PipelineOp::Select(paths) => {
                h.write(&[0x27]);
                for p in paths {
                    absorb_path(h, p);
                }
            }
            PipelineOp::UseBookmark(b) => {
                h.write(&[0x28]);
                h.write(b.as_bytes());
            }
            PipelineOp::UseIndex(IndexRef::DesignDoc(d)) => {
                h.write(&[0x29]);
                h.write(d.as_bytes());
            }
            PipelineOp::UseIndex(IndexRef::DesignDocAndName(d, n)) => {
                h.write(&[0x2a]);
                h.write(d.as_bytes());
                h.write(&[0xff]);
                h.write(n.as_bytes());
            }
            PipelineOp::WithReadQuorum(r) => {
                h.write(&[0x2b]);
                h.write(&r.to_le_bytes());
            }
            PipelineOp::UpdateIndex(b) => h.write(&[0x2c, *b as u8]),
            PipelineOp::FromStable(b) => h.write(&[0x2d, *b as u8]),
        }
    }
}

fn absorb_path(h: &mut Fnv128, path: &FieldPath) {
    use crate::expr::Segment;
    for segment in path.segments() {
        match segment {
            Segment::Member(name) => {
                h.write(name.as_bytes());
                h.write(&[0xff]);
            }
            Segment::Index(i) => {
                h.write(&[0xfe]);
                h.write(&i.to_le_bytes());
            }
        }
    }
    h.write(&[0xfc]);
}

/// Fingerprint of a whole pipeline, used as the compiler's cache key.
pub(crate) fn fingerprint_ops(ops: &[PipelineOp]) -> u128 {
    let mut h = Fnv128::new();
    for op in ops {
        op.absorb(&mut h);
    }
    h.finish()
}

/// One page of `_find` results, hydrated into typed documents.
#[derive(Debug)]
pub struct FindResult<T> {
    pub docs: Vec<Document<T>>,
    /// Continuation token for the next page; feed back via `use_bookmark`.
    pub bookmark: Option<String>,
    /// Server advice, e.g. "no matching index found".
    pub warning: Option<String>,
    pub execution_stats: Option<ExecutionStats>,
}

/// `execution_stats: true` payload from `_find`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExecutionStats {
    #[serde(default)]
    pub total_keys_examined: u64,
    #[serde(default)]
    pub total_docs_examined: u64,
    #[serde(default)]
    pub total_quorum_docs_examined: u64,
    #[serde(default)]
    pub results_returned: u64,
    #[serde(default)]
    pub execution_time_ms: f64,
}

/// Fluent query over one database.
///
/// # Example
/// ```no_run
/// # use loveseat::field;
/// # async fn run(db: loveseat::CouchDatabase) -> loveseat::Result<()> {
/// # #[derive(serde::Deserialize)] struct Person { name: String }
/// let page = db
///     .query()
///     .filter(field("age").gte(18).and(field("name").eq("Luke")))
///     .order_by("age")
///     .then_by("name")
///     .take(25)
///     .fetch::<Person>()
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct QueryBuilder<'a> {
    db: &'a CouchDatabase,
    ops: Vec<PipelineOp>,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(db: &'a CouchDatabase) -> Self {
        Self {
            db,
            ops: Vec::new(),
        }
    }

    /// Add a predicate. Multiple calls AND together.
    pub fn filter(mut self, selector: Selector) -> Self {
        self.ops.push(PipelineOp::Where(selector));
        self
    }

    /// Sort ascending by a field, replacing any earlier sort spec.
    pub fn order_by(mut self, dotted: &str) -> Self {
        self.ops.push(PipelineOp::OrderBy(FieldPath::parse(dotted)));
        self
    }

    /// Add a secondary ascending sort field.
    pub fn then_by(mut self, dotted: &str) -> Self {
        self.ops.push(PipelineOp::ThenBy(FieldPath::parse(dotted)));
        self
    }

    /// Sort descending by a field, replacing any earlier sort spec.
    pub fn order_by_desc(mut self, dotted: &str) -> Self {
        self.ops
            .push(PipelineOp::OrderByDesc(FieldPath::parse(dotted)));
        self
    }

    /// Add a secondary descending sort field.
    pub fn then_by_desc(mut self, dotted: &str) -> Self {
        self.ops
            .push(PipelineOp::ThenByDesc(FieldPath::parse(dotted)));
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.ops.push(PipelineOp::Skip(n));
        self
    }

    pub fn take(mut self, n: u64) -> Self {
        self.ops.push(PipelineOp::Take(n));
        self
    }

    /// Project only the named fields.
    pub fn select(mut self, dotted: &[&str]) -> Self {
        let paths = dotted.iter().map(|d| FieldPath::parse(d)).collect();
        self.ops.push(PipelineOp::Select(paths));
        self
    }

    /// Resume from a bookmark returned by an earlier page.
    pub fn use_bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.ops.push(PipelineOp::UseBookmark(bookmark.into()));
        self
    }

    pub fn use_index(mut self, index: IndexRef) -> Self {
        self.ops.push(PipelineOp::UseIndex(index));
        self
    }

    /// Read quorum (`r`).
    pub fn with_read_quorum(mut self, r: u32) -> Self {
        self.ops.push(PipelineOp::WithReadQuorum(r));
        self
    }

    /// Whether the index should be updated before the query runs.
    pub fn update_index(mut self, update: bool) -> Self {
        self.ops.push(PipelineOp::UpdateIndex(update));
        self
    }

    /// Only read from "stable" shard copies.
    pub fn from_stable(mut self, stable: bool) -> Self {
        self.ops.push(PipelineOp::FromStable(stable));
        self
    }

    /// Compile the pipeline without executing it.
    ///
    /// Exposed for diagnostics; `fetch` does this internally through the
    /// translation cache.
    pub fn to_mango(&self) -> Result<Value> {
        self.db.compile_to_value(&self.ops)
    }

    /// Execute the query and hydrate one page of typed rows.
    pub async fn fetch<T: DeserializeOwned>(self) -> Result<FindResult<T>> {
        self.db.run_find(&self.ops).await
    }
}
