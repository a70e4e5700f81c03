//! Two-stage late-interaction search.
//!
//! Stage one fans every query token out to the collection's ANN graph and
//! collects the distinct pages owning the nearest token vectors. Stage two
//! re-scores each candidate page exactly with [`maxsim`] over its full token
//! matrix, bounded by a worker pool, then sorts by score with page id as the
//! tiebreaker.
//!
//! The whole operation runs under a deadline: the coarse stage is cut off
//! outright, and rerank tasks that have not started when the deadline passes
//! are skipped, returning whatever scored in time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::collections::CollectionManager;
use crate::config::SearchConfig;
use crate::error::Result;
use crate::models::SearchResult;
use crate::rerank::maxsim;

pub struct SearchEngine {
    collections: Arc<CollectionManager>,
    coarse_width: usize,
    rerank_workers: usize,
    deadline: Duration,
}

impl SearchEngine {
    pub fn new(collections: Arc<CollectionManager>, config: &SearchConfig) -> Self {
        Self {
            collections,
            coarse_width: config.coarse_width,
            rerank_workers: config.rerank_workers,
            deadline: Duration::from_millis(config.deadline_ms),
        }
    }

    /// Rank the pages of one collection against a multi-vector query.
    ///
    /// A missing collection and an empty query both produce an empty result
    /// rather than an error; retrieval callers degrade, they don't fail.
    pub async fn search(
        &self,
        collection: &str,
        query_vectors: &[Vec<f32>],
        top_k: usize,
    ) -> Result<Vec<SearchResult>> {
        let started = Instant::now();
        let deadline = started + self.deadline;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let coarse = tokio::time::timeout(
            remaining,
            self.collections
                .coarse_candidates(collection, query_vectors, self.coarse_width),
        )
        .await;
        let pool = match coarse {
            Err(_elapsed) => {
                warn!(collection, "search deadline hit during coarse stage");
                return Ok(Vec::new());
            }
            Ok(Err(e)) if e.is_not_found() => return Ok(Vec::new()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(pool)) => pool,
        };
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.rerank_workers));
        let query = Arc::new(query_vectors.to_vec());
        let mut tasks: JoinSet<Result<Option<SearchResult>>> = JoinSet::new();

        for page_id in pool {
            let semaphore = semaphore.clone();
            let collections = self.collections.clone();
            let collection = collection.to_string();
            let query = query.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Ok(None);
                };
                if Instant::now() >= deadline {
                    return Ok(None);
                }

                let (vectors, meta) = collections.page_vectors(&collection, &page_id).await?;
                if vectors.is_empty() {
                    // Vectors vanished between the coarse stage and now;
                    // keep the hit visible with a zero score.
                    return Ok(Some(SearchResult {
                        page_id,
                        file_id: None,
                        page_number: None,
                        score: 0.0,
                    }));
                }
                let score = maxsim(&query, &vectors);
                let (file_id, page_number) = match meta {
                    Some((file_id, page_number)) => (Some(file_id), Some(page_number)),
                    None => (None, None),
                };
                Ok(Some(SearchResult {
                    page_id,
                    file_id,
                    page_number,
                    score,
                }))
            });
        }

        let mut results = Vec::new();
        let mut skipped = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined? {
                Ok(Some(result)) => results.push(result),
                Ok(None) => skipped += 1,
                Err(e) => return Err(e),
            }
        }
        if skipped > 0 {
            warn!(collection, skipped, "rerank tasks skipped at deadline");
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.page_id.cmp(&b.page_id))
        });
        results.truncate(top_k);

        debug!(
            collection,
            hits = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search complete"
        );
        Ok(results)
    }
}
