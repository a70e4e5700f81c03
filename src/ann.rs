//! In-memory approximate nearest neighbor index over token vectors.
//!
//! One [`TokenIndex`] per collection, built on rust-cv/hnsw, which supports
//! incremental insertion without rebuilds. Every entry is a single token
//! vector tagged with the page and file it came from; the coarse stage of a
//! search asks for the nearest entries per query token and returns the
//! distinct owning pages.
//!
//! HNSW has no true deletion, so removed files are tombstoned and filtered
//! from results. The graph is rebuilt from the vector table when a
//! collection's persisted version moves, which reclaims tombstoned space.

use std::collections::HashSet;

use hnsw::{Hnsw, Params, Searcher};
use space::{Metric, Neighbor};

use crate::error::{Error, Result};

/// Floor for the HNSW ef_search parameter. ef_search trades recall for
/// speed; scaling with the requested width while keeping a floor of 50
/// holds recall steady for small widths.
const MIN_EF_SEARCH: usize = 50;

/// Inner-product distance for unit-normalized token vectors.
///
/// The embedding model emits unit vectors, so `1 - <a, b>` lies in `[0, 2]`
/// and scales cleanly onto `u32` the way the HNSW crate wants distances.
struct InnerProduct;

impl Metric<Box<[f32]>> for InnerProduct {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum();
        let distance = (1.0 - dot).clamp(0.0, 2.0);
        (distance * (u32::MAX as f32 / 2.0)) as u32
    }
}

/// Provenance of one indexed token vector.
#[derive(Debug, Clone)]
struct Owner {
    page_id: String,
    file_id: String,
}

/// ANN index over the token vectors of one collection.
///
/// Embeddings are stored as `Box<[f32]>`: stable heap allocations the HNSW
/// graph can own without lifetime juggling. `M = 16` bidirectional links per
/// node and `M0 = 32` at layer 0 follow the HNSW paper's recommendation.
pub struct TokenIndex {
    index: Hnsw<InnerProduct, Box<[f32]>, rand::rngs::StdRng, 16, 32>,
    /// Mutated during both insert and search.
    searcher: Searcher<u32>,
    /// Owner of each HNSW slot, parallel to insertion order.
    owners: Vec<Owner>,
    dim: usize,
    /// HNSW slots whose file has been deleted. Filtered from results.
    tombstones: HashSet<usize>,
}

impl TokenIndex {
    pub fn new(dim: usize, ef_construction: usize) -> Self {
        Self {
            index: Hnsw::new_params(InnerProduct, Params::new().ef_construction(ef_construction)),
            searcher: Searcher::default(),
            owners: Vec::new(),
            dim,
            tombstones: HashSet::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of live (non-tombstoned) token vectors.
    pub fn len(&self) -> usize {
        self.owners.len() - self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert one token vector owned by `page_id` within `file_id`.
    pub fn insert(&mut self, page_id: &str, file_id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        self.owners.push(Owner {
            page_id: page_id.to_string(),
            file_id: file_id.to_string(),
        });
        self.index
            .insert(vector.into_boxed_slice(), &mut self.searcher);
        Ok(())
    }

    /// Coarse candidate retrieval: the nearest `width` token vectors per
    /// query token, collapsed to distinct page ids in first-seen order.
    pub fn coarse_candidates(
        &mut self,
        query_vectors: &[Vec<f32>],
        width: usize,
    ) -> Result<Vec<String>> {
        let mut pages = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        if width == 0 || self.owners.is_empty() {
            return Ok(pages);
        }

        // Ask for extra slots so tombstoned entries cannot starve the pool.
        let want = (width + self.tombstones.len()).min(self.owners.len());
        let ef_search = std::cmp::max(want * 2, MIN_EF_SEARCH);

        for query in query_vectors {
            if query.len() != self.dim {
                return Err(Error::DimensionMismatch {
                    expected: self.dim,
                    got: query.len(),
                });
            }

            let mut neighbors = vec![
                Neighbor {
                    index: !0,
                    distance: !0
                };
                want
            ];
            let query_box = query.clone().into_boxed_slice();
            self.index
                .nearest(&query_box, ef_search, &mut self.searcher, &mut neighbors);

            let mut live = 0;
            for neighbor in neighbors {
                if neighbor.index == !0 || self.tombstones.contains(&neighbor.index) {
                    continue;
                }
                live += 1;
                let owner = &self.owners[neighbor.index];
                if !seen.contains(owner.page_id.as_str()) {
                    seen.insert(owner.page_id.clone());
                    pages.push(owner.page_id.clone());
                }
                if live >= width {
                    break;
                }
            }
        }

        Ok(pages)
    }

    /// Tombstone every vector belonging to the given files. Returns how
    /// many slots were newly tombstoned.
    pub fn tombstone_files(&mut self, file_ids: &HashSet<String>) -> usize {
        let mut marked = 0;
        for (idx, owner) in self.owners.iter().enumerate() {
            if file_ids.contains(&owner.file_id) && self.tombstones.insert(idx) {
                marked += 1;
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_coarse_candidates_find_nearest_page() {
        let mut index = TokenIndex::new(4, 100);
        index.insert("p1", "f1", unit(4, 0)).unwrap();
        index.insert("p1", "f1", unit(4, 1)).unwrap();
        index.insert("p2", "f2", unit(4, 2)).unwrap();

        let pool = index.coarse_candidates(&[unit(4, 2)], 1).unwrap();
        assert_eq!(pool, vec!["p2"]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_pool_is_distinct_across_query_tokens() {
        let mut index = TokenIndex::new(4, 100);
        index.insert("p1", "f1", unit(4, 0)).unwrap();
        index.insert("p1", "f1", unit(4, 1)).unwrap();

        // Both query tokens hit p1; the pool lists it once.
        let pool = index
            .coarse_candidates(&[unit(4, 0), unit(4, 1)], 2)
            .unwrap();
        assert_eq!(pool, vec!["p1"]);
    }

    #[test]
    fn test_tombstoned_file_is_invisible() {
        let mut index = TokenIndex::new(4, 100);
        index.insert("p1", "f1", unit(4, 0)).unwrap();
        index.insert("p2", "f2", unit(4, 0)).unwrap();

        let mut gone = HashSet::new();
        gone.insert("f1".to_string());
        assert_eq!(index.tombstone_files(&gone), 1);
        assert_eq!(index.len(), 1);

        let pool = index.coarse_candidates(&[unit(4, 0)], 2).unwrap();
        assert_eq!(pool, vec!["p2"]);
    }

    #[test]
    fn test_empty_index_returns_empty_pool() {
        let mut index = TokenIndex::new(4, 100);
        let pool = index.coarse_candidates(&[unit(4, 0)], 5).unwrap();
        assert!(pool.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = TokenIndex::new(4, 100);
        let err = index.insert("p1", "f1", vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 4, got: 2 }));

        index.insert("p1", "f1", unit(4, 0)).unwrap();
        assert!(index.coarse_candidates(&[vec![1.0]], 1).is_err());
    }
}
