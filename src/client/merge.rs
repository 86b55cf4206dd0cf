//! Merging per-shard top-K lists into the global result.
//!
//! Score mode keeps a bounded queue of `limit` entries and scans each
//! shard list positionally, abandoning a shard as soon as its next score
//! cannot beat the worst kept entry. Sort mode is a k-way merge over the
//! already-sorted per-shard lists. Identical keys tie-break by
//! (node, shard, doc id) so results are stable across replica choices.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::protocol::{Hit, Hits, SortDescriptor, SortOrder};

/// A hit with full ordering; `Ord` treats "greater" as "ranks higher".
#[derive(Debug, Clone)]
struct RankedHit(Hit);

impl RankedHit {
    fn cmp_rank(&self, other: &Self) -> Ordering {
        self.0
            .score
            .partial_cmp(&other.0.score)
            .unwrap_or(Ordering::Equal)
            // Lower (node, shard, doc id) ranks first on score ties
            .then_with(|| other.0.node.cmp(&self.0.node))
            .then_with(|| other.0.shard.cmp(&self.0.shard))
            .then_with(|| other.0.doc_id.cmp(&self.0.doc_id))
    }
}

impl PartialEq for RankedHit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_rank(other) == Ordering::Equal
    }
}

impl Eq for RankedHit {}

impl PartialOrd for RankedHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp_rank(other))
    }
}

impl Ord for RankedHit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_rank(other)
    }
}

/// Merge score-ordered shard lists into the global top `limit`.
pub fn merge_by_score(responses: &[Hits], limit: usize) -> Vec<Hit> {
    let mut heap: BinaryHeap<std::cmp::Reverse<RankedHit>> =
        BinaryHeap::with_capacity(limit + 1);
    for response in responses {
        for (shard, docs) in &response.shard_hits {
            for doc in docs {
                if heap.len() == limit {
                    let worst = match heap.peek() {
                        Some(std::cmp::Reverse(w)) => w,
                        None => break,
                    };
                    // Lists are score-descending: once strictly below the
                    // bar, the rest of this shard cannot qualify
                    if doc.score < worst.0.score {
                        break;
                    }
                }
                let hit = RankedHit(Hit {
                    node: response.node.clone(),
                    shard: shard.clone(),
                    doc_id: doc.doc_id,
                    score: doc.score,
                    sort_values: doc.sort_values.clone(),
                });
                if heap.len() < limit {
                    heap.push(std::cmp::Reverse(hit));
                } else if let Some(std::cmp::Reverse(worst)) = heap.peek() {
                    if hit > *worst {
                        heap.pop();
                        heap.push(std::cmp::Reverse(hit));
                    }
                }
            }
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|std::cmp::Reverse(ranked)| ranked.0)
        .collect()
}

fn cmp_by_sort(a: &Hit, b: &Hit, sort: &SortDescriptor) -> Ordering {
    let empty = Vec::new();
    let a_values = a.sort_values.as_ref().unwrap_or(&empty);
    let b_values = b.sort_values.as_ref().unwrap_or(&empty);
    for (i, field) in sort.fields.iter().enumerate() {
        let a_value = a_values.get(i);
        let b_value = b_values.get(i);
        let mut ord = match (a_value, b_value) {
            (Some(x), Some(y)) => x.compare(y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if field.order == SortOrder::Desc {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.node
        .cmp(&b.node)
        .then_with(|| a.shard.cmp(&b.shard))
        .then_with(|| a.doc_id.cmp(&b.doc_id))
}

/// K-way merge of per-shard lists already ordered by the sort key.
pub fn merge_by_sort(responses: &[Hits], sort: &SortDescriptor, limit: usize) -> Vec<Hit> {
    let mut lists: Vec<Vec<Hit>> = Vec::new();
    for response in responses {
        for (shard, docs) in &response.shard_hits {
            lists.push(
                docs.iter()
                    .map(|doc| Hit {
                        node: response.node.clone(),
                        shard: shard.clone(),
                        doc_id: doc.doc_id,
                        score: doc.score,
                        sort_values: doc.sort_values.clone(),
                    })
                    .collect(),
            );
        }
    }

    let mut cursors = vec![0usize; lists.len()];
    let mut merged = Vec::with_capacity(limit.min(64));
    while merged.len() < limit {
        let mut best: Option<usize> = None;
        for (i, list) in lists.iter().enumerate() {
            let Some(candidate) = list.get(cursors[i]) else {
                continue;
            };
            best = match best {
                None => Some(i),
                Some(current)
                    if cmp_by_sort(candidate, &lists[current][cursors[current]], sort)
                        == Ordering::Less =>
                {
                    Some(i)
                }
                Some(current) => Some(current),
            };
        }
        let Some(list_idx) = best else {
            break;
        };
        merged.push(lists[list_idx][cursors[list_idx]].clone());
        cursors[list_idx] += 1;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FieldValue, ScoredDoc, SortField};
    use std::collections::HashMap;

    fn hits(node: &str, shard_docs: &[(&str, Vec<(u32, f32)>)]) -> Hits {
        let mut shard_hits = HashMap::new();
        for (shard, docs) in shard_docs {
            shard_hits.insert(
                shard.to_string(),
                docs.iter()
                    .map(|(doc_id, score)| ScoredDoc {
                        doc_id: *doc_id,
                        score: *score,
                        sort_values: None,
                    })
                    .collect(),
            );
        }
        Hits {
            total_hits: 0,
            node: node.to_string(),
            shard_hits,
            timed_out: Vec::new(),
        }
    }

    #[test]
    fn test_merge_by_score_is_global_top_k() {
        let responses = vec![
            hits("n1", &[("a", vec![(0, 9.0), (1, 3.0), (2, 1.0)])]),
            hits("n2", &[("b", vec![(0, 8.0), (1, 7.0)])]),
        ];
        let merged = merge_by_score(&responses, 3);
        let scores: Vec<f32> = merged.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![9.0, 8.0, 7.0]);

        // Equals the top-K of the flat union
        let all = merge_by_score(&responses, 100);
        assert_eq!(all.len(), 5);
        assert_eq!(&all[..3], &merged[..]);
    }

    #[test]
    fn test_merge_by_score_tie_breaks_deterministically() {
        let responses = vec![
            hits("n2", &[("b", vec![(5, 2.0)])]),
            hits("n1", &[("a", vec![(7, 2.0)])]),
        ];
        let merged = merge_by_score(&responses, 2);
        assert_eq!(merged[0].node, "n1");
        assert_eq!(merged[1].node, "n2");
    }

    #[test]
    fn test_merge_by_score_respects_limit_zero() {
        let responses = vec![hits("n1", &[("a", vec![(0, 1.0)])])];
        assert!(merge_by_score(&responses, 0).is_empty());
    }

    fn sorted_hits(node: &str, shard: &str, years: &[(u32, i64)]) -> Hits {
        let mut shard_hits = HashMap::new();
        shard_hits.insert(
            shard.to_string(),
            years
                .iter()
                .map(|(doc_id, year)| ScoredDoc {
                    doc_id: *doc_id,
                    score: 1.0,
                    sort_values: Some(vec![FieldValue::Int(*year)]),
                })
                .collect(),
        );
        Hits {
            total_hits: 0,
            node: node.to_string(),
            shard_hits,
            timed_out: Vec::new(),
        }
    }

    #[test]
    fn test_merge_by_sort_interleaves_sorted_lists() {
        let sort = SortDescriptor {
            fields: vec![SortField {
                field: "year".into(),
                order: SortOrder::Desc,
            }],
        };
        // Each list already descending by year
        let responses = vec![
            sorted_hits("n1", "a", &[(0, 2001), (1, 1995)]),
            sorted_hits("n2", "b", &[(0, 1999), (1, 1998)]),
        ];
        let merged = merge_by_sort(&responses, &sort, 10);
        let years: Vec<i64> = merged
            .iter()
            .map(|h| match h.sort_values.as_ref().unwrap()[0] {
                FieldValue::Int(y) => y,
                _ => panic!("expected int"),
            })
            .collect();
        assert_eq!(years, vec![2001, 1999, 1998, 1995]);
    }

    #[test]
    fn test_merge_by_sort_drains_when_limit_exceeds_hits() {
        let sort = SortDescriptor {
            fields: vec![SortField {
                field: "year".into(),
                order: SortOrder::Asc,
            }],
        };
        let responses = vec![sorted_hits("n1", "a", &[(0, 1990), (1, 2000)])];
        let merged = merge_by_sort(&responses, &sort, 99);
        assert_eq!(merged.len(), 2);
    }
}
