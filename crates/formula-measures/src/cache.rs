use crate::context::ContextFingerprint;
use crate::value::Value;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoized measure results for one query, keyed by (measure, context fingerprint).
///
/// A cache belongs to a single top-level evaluation and is dropped with it; keys are only
/// meaningful within that query.
#[derive(Debug, Default)]
pub struct EvaluationCache {
    entries: HashMap<(String, ContextFingerprint), Value>,
    hits: u64,
    misses: u64,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, measure: &str, context: &ContextFingerprint) -> Option<Value> {
        let found = self
            .entries
            .get(&(measure.to_string(), context.clone()))
            .cloned();
        match &found {
            Some(_) => {
                self.hits += 1;
                log::trace!("cache hit for [{measure}] under {context}");
            }
            None => self.misses += 1,
        }
        found
    }

    pub fn insert(&mut self, measure: &str, context: ContextFingerprint, value: Value) {
        self.entries.insert((measure.to_string(), context), value);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}
