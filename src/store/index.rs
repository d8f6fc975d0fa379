// Approximate nearest-neighbor index: a graph of per-record nearest neighbors
// searched with a greedy best-first beam.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::time::Instant;

use tracing::debug;

use super::Record;
use super::similarity::cosine_similarity;

/// Number of neighbors kept per record
pub const DEFAULT_GRAPH_DEGREE: usize = 16;
/// Maximum number of entry points seeded into every traversal
const MAX_ENTRY_POINTS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    seq: u64,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // Higher score wins; on equal scores the earlier insertion wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone)]
pub struct NeighborGraph {
    neighbors: HashMap<u64, Vec<u64>>,
    entry_points: Vec<u64>,
}

impl NeighborGraph {
    /// Build the graph by exhaustive pairwise comparison.
    pub fn build(records: &BTreeMap<u64, Record>, degree: usize) -> Self {
        let started = Instant::now();
        let seqs: Vec<u64> = records.keys().copied().collect();
        let mut neighbors = HashMap::with_capacity(seqs.len());

        for (seq, record) in records {
            let mut nearest: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(degree + 1);
            for (other_seq, other) in records {
                if other_seq == seq {
                    continue;
                }
                nearest.push(Reverse(Scored {
                    score: cosine_similarity(&record.vector, &other.vector),
                    seq: *other_seq,
                }));
                if nearest.len() > degree {
                    nearest.pop();
                }
            }
            let mut list: Vec<Scored> = nearest.into_iter().map(|Reverse(s)| s).collect();
            list.sort_by(|a, b| b.cmp(a));
            neighbors.insert(*seq, list.into_iter().map(|s| s.seq).collect());
        }

        let stride = (seqs.len() / MAX_ENTRY_POINTS).max(1);
        let entry_points = seqs
            .iter()
            .step_by(stride)
            .take(MAX_ENTRY_POINTS)
            .copied()
            .collect();

        debug!(
            "Built neighbor graph over {} records in {:?}",
            seqs.len(),
            started.elapsed()
        );

        Self {
            neighbors,
            entry_points,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Beam search keeping the best `ef` nodes.
    ///
    /// Returns `None` when `deadline` passes mid-traversal; the caller is
    /// expected to fall back to exact search.
    pub fn search(
        &self,
        records: &BTreeMap<u64, Record>,
        query: &[f32],
        ef: usize,
        deadline: Option<Instant>,
    ) -> Option<Vec<(u64, f32)>> {
        let ef = ef.max(1);
        let mut visited: HashSet<u64> = HashSet::new();
        let mut frontier: BinaryHeap<Scored> = BinaryHeap::new();
        let mut best: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for seq in &self.entry_points {
            if !visited.insert(*seq) {
                continue;
            }
            if let Some(record) = records.get(seq) {
                let scored = Scored {
                    score: cosine_similarity(query, &record.vector),
                    seq: *seq,
                };
                frontier.push(scored);
                best.push(Reverse(scored));
                if best.len() > ef {
                    best.pop();
                }
            }
        }

        while let Some(current) = frontier.pop() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("Neighbor graph traversal passed its deadline");
                return None;
            }

            let worst = best.peek().map(|Reverse(s)| s.score);
            if best.len() >= ef && worst.is_some_and(|w| current.score < w) {
                break;
            }

            let Some(adjacent) = self.neighbors.get(&current.seq) else {
                continue;
            };

            for seq in adjacent {
                if !visited.insert(*seq) {
                    continue;
                }
                let Some(record) = records.get(seq) else {
                    continue;
                };
                let scored = Scored {
                    score: cosine_similarity(query, &record.vector),
                    seq: *seq,
                };
                let worst = best.peek().map(|Reverse(s)| *s);
                if best.len() < ef || worst.is_some_and(|w| scored > w) {
                    frontier.push(scored);
                    best.push(Reverse(scored));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        Some(best.into_iter().map(|Reverse(s)| (s.seq, s.score)).collect())
    }
}
