//! Query compilation: optimize, translate, cache.
//!
//! Translation output depends only on the captured pipeline and the naming
//! policy, so compiled queries are cached by the pipeline's structural
//! fingerprint. Commutatively-equal predicates share a cache entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cache::LruCache;
use crate::error::Result;
use crate::naming::PropertyPolicy;
use crate::optimize;
use crate::query::{fingerprint_ops, PipelineOp};
use crate::translate::{self, MangoQuery};

/// Hit/miss counters for the translation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct QueryCompiler {
    policy: PropertyPolicy,
    // Held only for the lookup or insert itself.
    cache: Mutex<LruCache<u128, MangoQuery>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCompiler {
    pub fn new(policy: PropertyPolicy, cache_size: usize) -> Self {
        Self {
            policy,
            cache: Mutex::new(LruCache::new(cache_size)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &PropertyPolicy {
        &self.policy
    }

    /// Compile a pipeline to its Mango request body.
    ///
    /// Validation errors are returned and never cached; a pipeline that
    /// failed once fails identically on retry without poisoning an entry.
    pub fn compile(&self, ops: &[PipelineOp]) -> Result<MangoQuery> {
        let key = fingerprint_ops(ops);

        if let Some(query) = self.cache.lock().expect("compiler cache lock").get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(query.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let plan = optimize::plan(ops)?;
        let query = translate::translate(&plan, &self.policy)?;
        let fingerprint = format!("{:032x}", key);
        tracing::debug!(%fingerprint, "compiled mango query");

        self.cache
            .lock()
            .expect("compiler cache lock")
            .insert(key, query.clone());
        Ok(query)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.lock().expect("compiler cache lock").len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::field;
    use crate::query::PipelineOp;

    fn compiler() -> QueryCompiler {
        QueryCompiler::new(PropertyPolicy::default(), 8)
    }

    #[test]
    fn second_compile_hits_the_cache() {
        let c = compiler();
        let ops = vec![PipelineOp::Where(field("age").gte(18)), PipelineOp::Take(5)];

        let first = c.compile(&ops).unwrap();
        let second = c.compile(&ops).unwrap();
        assert_eq!(first.to_body(), second.to_body());

        let stats = c.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn commutative_predicates_share_an_entry() {
        let c = compiler();
        let a = vec![PipelineOp::Where(
            field("age").gte(18).and(field("name").eq("Luke")),
        )];
        let b = vec![PipelineOp::Where(
            field("name").eq("Luke").and(field("age").gte(18)),
        )];

        let first = c.compile(&a).unwrap();
        let second = c.compile(&b).unwrap();
        // Same fingerprint, same cached translation.
        assert_eq!(first.to_body(), second.to_body());
        assert_eq!(c.cache_stats().hits, 1);
        assert_eq!(c.cache_stats().entries, 1);
    }

    #[test]
    fn failed_compiles_are_not_cached() {
        let c = compiler();
        let ops = vec![PipelineOp::Select(vec![])];
        assert!(c.compile(&ops).is_err());
        assert!(c.compile(&ops).is_err());
        assert_eq!(c.cache_stats().entries, 0);
    }
}
