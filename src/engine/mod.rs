//! Index engine seam.
//!
//! The cluster plumbing treats the inverted-index engine as an external
//! collaborator behind [`IndexEngine`] / [`ShardReader`]. The built-in
//! [`InvertedEngine`] reads shards laid out as directories of JSON
//! documents; anything that can rewrite queries to terms, report document
//! frequencies and score against *supplied* global frequencies can be
//! plugged in instead.

pub mod inverted;

pub use inverted::InvertedEngine;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{KattaError, KattaResult};
use crate::protocol::{
    DocumentFrequencyMap, FieldValue, Query, ScoredDoc, SortDescriptor, Term, TermFilter,
};

/// Field searched by bare query terms.
pub const DEFAULT_FIELD: &str = "text";

/// Result of searching one shard.
#[derive(Debug, Clone)]
pub struct ShardSearchResult {
    /// Ranked: by score descending, or by the sort descriptor when given
    pub docs: Vec<ScoredDoc>,
    pub total_hits: u64,
    /// True when the collection budget ran out and the counts are partial
    pub timed_out: bool,
}

pub trait ShardReader: Send + Sync {
    fn num_docs(&self) -> u64;

    /// Rewrite a query to the concrete terms it touches.
    fn rewrite(&self, query: &Query) -> KattaResult<Vec<Term>>;

    /// Per-term document frequencies for a query, plus this shard's
    /// document count.
    fn doc_freqs(&self, query: &Query) -> KattaResult<DocumentFrequencyMap>;

    /// Evaluate a filter to the set of matching doc ids. Results are
    /// stable for the lifetime of the reader and safe to cache.
    fn filter_docs(&self, filter: &TermFilter) -> HashSet<u32>;

    /// Score the query against the supplied global frequencies. Checks
    /// the deadline cooperatively and returns partial results instead of
    /// overrunning it.
    fn search(
        &self,
        query: &Query,
        freqs: &DocumentFrequencyMap,
        limit: usize,
        sort: Option<&SortDescriptor>,
        deadline: Instant,
        filter_docs: Option<&HashSet<u32>>,
    ) -> KattaResult<ShardSearchResult>;

    /// Stored fields of one document; `None` for an unknown doc id.
    fn details(
        &self,
        doc_id: u32,
        fields: Option<&[String]>,
    ) -> Option<HashMap<String, FieldValue>>;
}

#[async_trait]
pub trait IndexEngine: Send + Sync {
    /// Open a local shard directory for serving.
    async fn open_reader(
        &self,
        shard: &str,
        path: &Path,
        analyzer: &str,
    ) -> KattaResult<Arc<dyn ShardReader>>;
}

/// Tokenisation behaviour, selected by the index's analyzer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analyzer {
    /// Lowercase, split on any non-alphanumeric character
    Simple,
    /// Lowercase, split on whitespace only
    Whitespace,
}

impl Analyzer {
    pub fn from_id(id: &str) -> Self {
        match id {
            "whitespace" => Analyzer::Whitespace,
            "simple" => Analyzer::Simple,
            other => {
                tracing::debug!(analyzer = other, "Unknown analyzer id, using simple");
                Analyzer::Simple
            }
        }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        match self {
            Analyzer::Whitespace => text
                .split_whitespace()
                .map(|t| t.to_lowercase())
                .collect(),
            Analyzer::Simple => normalize_text(text)
                .split_whitespace()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect()
}

/// Parse a query into its unique terms. Syntax: whitespace-separated
/// terms, each optionally prefixed with `field:`; bare terms search
/// [`DEFAULT_FIELD`].
pub fn parse_query(query: &Query, analyzer: Analyzer) -> KattaResult<Vec<Term>> {
    let trimmed = query.text.trim();
    if trimmed.is_empty() {
        return Err(KattaError::MalformedQuery("empty query".to_string()));
    }
    let mut terms = Vec::new();
    let mut seen = HashSet::new();
    for raw in trimmed.split_whitespace() {
        let (field, text) = match raw.split_once(':') {
            Some((field, text)) => {
                if field.is_empty() || text.is_empty() {
                    return Err(KattaError::MalformedQuery(format!(
                        "incomplete term '{}'",
                        raw
                    )));
                }
                (field, text)
            }
            None => (DEFAULT_FIELD, raw),
        };
        let tokens = analyzer.tokenize(text);
        if tokens.is_empty() {
            return Err(KattaError::MalformedQuery(format!(
                "term '{}' tokenizes to nothing",
                raw
            )));
        }
        for token in tokens {
            let term = Term::new(field, &token);
            if seen.insert(term.clone()) {
                terms.push(term);
            }
        }
    }
    Ok(terms)
}

/// Inverse document frequency from the global statistics. Shards never
/// use their local counts here; that is what keeps scores comparable
/// across the cluster.
pub fn idf(freqs: &DocumentFrequencyMap, term: &Term) -> f32 {
    let df = freqs.frequency(term) as f64;
    let n = freqs.num_docs.max(1) as f64;
    (1.0 + (n / (df + 1.0)).ln()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_terms() {
        let terms = parse_query(&Query::new("Alice title:Wonder-Land"), Analyzer::Simple).unwrap();
        assert_eq!(
            terms,
            vec![
                Term::new("text", "alice"),
                Term::new("title", "wonder"),
                Term::new("title", "land"),
            ]
        );
    }

    #[test]
    fn test_parse_query_dedupes() {
        let terms = parse_query(&Query::new("alice alice text:alice"), Analyzer::Simple).unwrap();
        assert_eq!(terms.len(), 1);
    }

    #[test]
    fn test_parse_query_rejects_garbage() {
        assert!(matches!(
            parse_query(&Query::new("   "), Analyzer::Simple),
            Err(KattaError::MalformedQuery(_))
        ));
        assert!(matches!(
            parse_query(&Query::new(":alice"), Analyzer::Simple),
            Err(KattaError::MalformedQuery(_))
        ));
        assert!(matches!(
            parse_query(&Query::new("title:"), Analyzer::Simple),
            Err(KattaError::MalformedQuery(_))
        ));
        assert!(matches!(
            parse_query(&Query::new("!!!"), Analyzer::Simple),
            Err(KattaError::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_whitespace_analyzer_keeps_punctuation() {
        let tokens = Analyzer::Whitespace.tokenize("Foo-Bar baz");
        assert_eq!(tokens, vec!["foo-bar", "baz"]);
    }

    #[test]
    fn test_idf_uses_global_counts() {
        let mut freqs = DocumentFrequencyMap::default();
        freqs.num_docs = 100;
        freqs.add(Term::new("text", "rare"), 1);
        freqs.add(Term::new("text", "common"), 99);
        let rare = idf(&freqs, &Term::new("text", "rare"));
        let common = idf(&freqs, &Term::new("text", "common"));
        assert!(rare > common);
    }
}
