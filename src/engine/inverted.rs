//! Built-in inverted-index engine.
//!
//! A shard is a directory of `.json` files, one document each; doc ids
//! are assigned by file-name order, so every replica of a shard agrees
//! on them. The whole shard is held in memory: postings with term
//! frequencies plus the stored fields.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{idf, parse_query, Analyzer, IndexEngine, ShardReader, ShardSearchResult};
use crate::error::{KattaError, KattaResult};
use crate::protocol::{
    DocumentFrequencyMap, FieldValue, Query, ScoredDoc, SortDescriptor, SortOrder, Term,
    TermFilter,
};

/// How many scoring steps happen between deadline checks
const DEADLINE_CHECK_INTERVAL: usize = 1024;

pub struct InvertedEngine;

#[async_trait]
impl IndexEngine for InvertedEngine {
    async fn open_reader(
        &self,
        shard: &str,
        path: &Path,
        analyzer: &str,
    ) -> KattaResult<Arc<dyn ShardReader>> {
        let shard = shard.to_string();
        let path = path.to_path_buf();
        let analyzer = Analyzer::from_id(analyzer);
        let reader = tokio::task::spawn_blocking(move || InvertedReader::load(&shard, &path, analyzer))
            .await
            .map_err(|e| KattaError::InternalError(format!("open task failed: {}", e)))??;
        Ok(Arc::new(reader))
    }
}

#[derive(Debug)]
pub struct InvertedReader {
    shard: String,
    analyzer: Analyzer,
    num_docs: u64,
    /// term -> [(doc id, term frequency)], ascending by doc id
    postings: HashMap<Term, Vec<(u32, u32)>>,
    /// Stored fields per doc id
    stored: Vec<HashMap<String, FieldValue>>,
}

impl InvertedReader {
    pub fn load(shard: &str, path: &Path, analyzer: Analyzer) -> KattaResult<Self> {
        let mut files: Vec<_> = std::fs::read_dir(path)
            .map_err(|e| {
                KattaError::ShardOpenFailure(format!("{}: cannot read {}: {}", shard, path.display(), e))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut postings: HashMap<Term, Vec<(u32, u32)>> = HashMap::new();
        let mut stored = Vec::with_capacity(files.len());

        for (doc_id, file) in files.iter().enumerate() {
            let doc_id = doc_id as u32;
            let raw = std::fs::read_to_string(file).map_err(|e| {
                KattaError::ShardOpenFailure(format!("{}: cannot read {}: {}", shard, file.display(), e))
            })?;
            let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
                KattaError::ShardOpenFailure(format!("{}: invalid document {}: {}", shard, file.display(), e))
            })?;
            let object = value.as_object().ok_or_else(|| {
                KattaError::ShardOpenFailure(format!(
                    "{}: document {} is not an object",
                    shard,
                    file.display()
                ))
            })?;

            let mut fields = HashMap::new();
            let mut term_counts: HashMap<Term, u32> = HashMap::new();
            for (field, field_value) in object {
                index_value(&mut term_counts, analyzer, field, field_value);
                fields.insert(field.clone(), FieldValue::from(field_value));
            }
            for (term, count) in term_counts {
                postings.entry(term).or_default().push((doc_id, count));
            }
            stored.push(fields);
        }

        Ok(Self {
            shard: shard.to_string(),
            analyzer,
            num_docs: stored.len() as u64,
            postings,
            stored,
        })
    }

    fn sort_values_for(&self, doc_id: u32, sort: &SortDescriptor) -> Vec<FieldValue> {
        let fields = &self.stored[doc_id as usize];
        sort.fields
            .iter()
            .map(|f| fields.get(&f.field).cloned().unwrap_or(FieldValue::Null))
            .collect()
    }
}

fn index_value(
    counts: &mut HashMap<Term, u32>,
    analyzer: Analyzer,
    field: &str,
    value: &serde_json::Value,
) {
    match value {
        serde_json::Value::String(text) => {
            for token in analyzer.tokenize(text) {
                *counts.entry(Term::new(field, &token)).or_insert(0) += 1;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                index_value(counts, analyzer, field, item);
            }
        }
        // Non-text values are stored but not searchable
        _ => {}
    }
}

fn field_matches(value: &FieldValue, wanted: &str) -> bool {
    match value {
        FieldValue::Text(s) => s == wanted,
        FieldValue::Int(i) => i.to_string() == wanted,
        FieldValue::Float(f) => f.to_string() == wanted,
        FieldValue::Bool(b) => b.to_string() == wanted,
        FieldValue::List(items) => items.iter().any(|v| field_matches(v, wanted)),
        FieldValue::Null => false,
    }
}

/// Top-K candidate with (score desc, doc id asc) ordering; `Ord` treats
/// "greater" as "better".
#[derive(Clone, Copy, Debug)]
struct OrderedHit {
    score: f32,
    doc_id: u32,
}

impl PartialEq for OrderedHit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedHit {}

impl PartialOrd for OrderedHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedHit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.doc_id.cmp(&self.doc_id))
    }
}

impl ShardReader for InvertedReader {
    fn num_docs(&self) -> u64 {
        self.num_docs
    }

    fn rewrite(&self, query: &Query) -> KattaResult<Vec<Term>> {
        parse_query(query, self.analyzer)
    }

    fn doc_freqs(&self, query: &Query) -> KattaResult<DocumentFrequencyMap> {
        let mut freqs = DocumentFrequencyMap {
            frequencies: HashMap::new(),
            num_docs: self.num_docs,
        };
        for term in self.rewrite(query)? {
            let df = self.postings.get(&term).map(|p| p.len() as u32).unwrap_or(0);
            freqs.add(term, df);
        }
        Ok(freqs)
    }

    fn filter_docs(&self, filter: &TermFilter) -> HashSet<u32> {
        self.stored
            .iter()
            .enumerate()
            .filter(|(_, fields)| {
                fields
                    .get(&filter.field)
                    .is_some_and(|v| field_matches(v, &filter.value))
            })
            .map(|(doc_id, _)| doc_id as u32)
            .collect()
    }

    fn search(
        &self,
        query: &Query,
        freqs: &DocumentFrequencyMap,
        limit: usize,
        sort: Option<&SortDescriptor>,
        deadline: Instant,
        filter_docs: Option<&HashSet<u32>>,
    ) -> KattaResult<ShardSearchResult> {
        let terms = self.rewrite(query)?;

        let mut scores: HashMap<u32, f32> = HashMap::new();
        let mut steps = 0usize;
        let mut timed_out = false;

        // timed_out is set only when scoring is actually cut short, so a
        // shard that finishes right at the deadline still reports complete
        // counts
        'scoring: for term in &terms {
            if Instant::now() >= deadline {
                timed_out = true;
                break 'scoring;
            }
            let term_idf = idf(freqs, term);
            let weight = term_idf * term_idf;
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            for (doc_id, tf) in postings {
                steps += 1;
                if steps % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                    timed_out = true;
                    break 'scoring;
                }
                if let Some(allowed) = filter_docs {
                    if !allowed.contains(doc_id) {
                        continue;
                    }
                }
                *scores.entry(*doc_id).or_insert(0.0) += (*tf as f32).sqrt() * weight;
            }
        }

        let total_hits = scores.len() as u64;
        if timed_out {
            tracing::warn!(
                shard = %self.shard,
                collected = total_hits,
                "Shard search ran out of budget, returning partial results"
            );
        }

        let docs = match sort {
            None => {
                let mut heap = std::collections::BinaryHeap::with_capacity(limit + 1);
                for (&doc_id, &score) in &scores {
                    let candidate = std::cmp::Reverse(OrderedHit { score, doc_id });
                    if heap.len() < limit {
                        heap.push(candidate);
                    } else if let Some(worst) = heap.peek() {
                        if candidate < *worst {
                            heap.pop();
                            heap.push(candidate);
                        }
                    }
                }
                heap.into_sorted_vec()
                    .into_iter()
                    .map(|std::cmp::Reverse(hit)| ScoredDoc {
                        doc_id: hit.doc_id,
                        score: hit.score,
                        sort_values: None,
                    })
                    .collect()
            }
            Some(descriptor) => {
                let mut matches: Vec<(u32, f32, Vec<FieldValue>)> = scores
                    .iter()
                    .map(|(&doc_id, &score)| {
                        (doc_id, score, self.sort_values_for(doc_id, descriptor))
                    })
                    .collect();
                matches.sort_by(|a, b| {
                    for (i, field) in descriptor.fields.iter().enumerate() {
                        let mut ord = a.2[i].compare(&b.2[i]);
                        if field.order == SortOrder::Desc {
                            ord = ord.reverse();
                        }
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    a.0.cmp(&b.0)
                });
                matches
                    .into_iter()
                    .take(limit)
                    .map(|(doc_id, score, sort_values)| ScoredDoc {
                        doc_id,
                        score,
                        sort_values: Some(sort_values),
                    })
                    .collect()
            }
        };

        Ok(ShardSearchResult {
            docs,
            total_hits,
            timed_out,
        })
    }

    fn details(
        &self,
        doc_id: u32,
        fields: Option<&[String]>,
    ) -> Option<HashMap<String, FieldValue>> {
        let stored = self.stored.get(doc_id as usize)?;
        match fields {
            None => Some(stored.clone()),
            Some(wanted) => Some(
                stored
                    .iter()
                    .filter(|(name, _)| wanted.iter().any(|w| w == *name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
        }
    }
}
