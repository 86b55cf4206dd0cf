//! Wire model for the search RPCs between the query client and nodes.
//!
//! Uses a compact binary serde codec; payloads travel as
//! `application/octet-stream` bodies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{KattaError, KattaResult};

/// Maximum RPC message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encode an RPC message.
pub fn to_wire<T: Serialize>(value: &T) -> KattaResult<Vec<u8>> {
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(KattaError::WireError(format!(
            "message of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decode an RPC message.
pub fn from_wire<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> KattaResult<T> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(KattaError::WireError(format!(
            "message of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    Ok(bincode::deserialize(bytes)?)
}

/// A (field, term) pair. Document frequencies are kept per term so scores
/// stay comparable across shards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new(field: &str, text: &str) -> Self {
        Self {
            field: field.to_string(),
            text: text.to_string(),
        }
    }
}

/// Exact-match restriction applied before scoring. Filter doc-sets are
/// cacheable per shard, keyed by [`TermFilter::cache_key`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TermFilter {
    pub field: String,
    pub value: String,
}

impl TermFilter {
    pub fn cache_key(&self) -> String {
        format!("{}={}", self.field, self.value)
    }
}

/// A search query. The text is opaque to the cluster plumbing; nodes hand
/// it to the index engine for rewriting and scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub filter: Option<TermFilter>,
}

impl Query {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            filter: None,
        }
    }

    pub fn with_filter(text: &str, filter: TermFilter) -> Self {
        Self {
            text: text.to_string(),
            filter: Some(filter),
        }
    }
}

/// Per-term document frequencies plus the total document count, summed
/// across every shard participating in a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentFrequencyMap {
    pub frequencies: HashMap<Term, u32>,
    pub num_docs: u64,
}

impl DocumentFrequencyMap {
    pub fn add(&mut self, term: Term, frequency: u32) {
        *self.frequencies.entry(term).or_insert(0) += frequency;
    }

    /// Sum another shard's (or node's) frequencies into this map.
    pub fn merge(&mut self, other: &DocumentFrequencyMap) {
        for (term, frequency) in &other.frequencies {
            *self.frequencies.entry(term.clone()).or_insert(0) += frequency;
        }
        self.num_docs += other.num_docs;
    }

    pub fn frequency(&self, term: &Term) -> u32 {
        self.frequencies.get(term).copied().unwrap_or(0)
    }
}

/// Scalar document field value; also used as a sort key.
///
/// This is a closed enum rather than raw JSON because the binary codec
/// cannot carry self-describing values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
}

/// Sort keys are field values.
pub type SortValue = FieldValue;

impl FieldValue {
    /// Total order: null < bool < numbers (int and float compared
    /// numerically) < text < list.
    pub fn compare(&self, other: &FieldValue) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Text(a), Text(b)) => a.cmp(b),
            (List(a), List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) | FieldValue::Float(_) => 2,
            FieldValue::Text(_) => 3,
            FieldValue::List(_) => 4,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Value::from(*f),
            FieldValue::Text(s) => serde_json::Value::from(s.clone()),
            FieldValue::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
        }
    }
}

impl From<&serde_json::Value> for FieldValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => FieldValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                FieldValue::List(items.iter().map(FieldValue::from).collect())
            }
            // Nested objects are not sortable; keep their JSON text
            serde_json::Value::Object(_) => FieldValue::Text(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub fields: Vec<SortField>,
}

/// One scored document within a shard's result list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDoc {
    pub doc_id: u32,
    pub score: f32,
    pub sort_values: Option<Vec<SortValue>>,
}

/// Result of one node's `search` call: per-shard result lists plus the
/// total hit count across its shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hits {
    pub total_hits: u64,
    /// Name of the node that produced these results
    pub node: String,
    pub shard_hits: HashMap<String, Vec<ScoredDoc>>,
    /// Shards that exceeded their collection budget and returned partials
    #[serde(default)]
    pub timed_out: Vec<String>,
}

impl Hits {
    pub fn empty(node: &str) -> Self {
        Self {
            total_hits: 0,
            node: node.to_string(),
            shard_hits: HashMap::new(),
            timed_out: Vec::new(),
        }
    }
}

/// A globally merged hit as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub node: String,
    pub shard: String,
    pub doc_id: u32,
    pub score: f32,
    pub sort_values: Option<Vec<SortValue>>,
}

// ==================== RPC messages ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocFreqsRequest {
    pub query: Query,
    pub shards: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocFreqsResponse {
    pub freqs: DocumentFrequencyMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    pub freqs: DocumentFrequencyMap,
    pub shards: Vec<String>,
    pub timeout_ms: u64,
    pub limit: usize,
    pub sort: Option<SortDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Hits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailsRequest {
    /// Document ids grouped per shard
    pub doc_ids: HashMap<String, Vec<u32>>,
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailsResponse {
    /// shard -> doc id -> stored fields
    pub docs: HashMap<String, HashMap<u32, HashMap<String, FieldValue>>>,
}
