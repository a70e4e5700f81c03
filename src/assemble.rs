//! Context assembly for the chat layer.
//!
//! Runs one query against several knowledge bases, merges and filters the
//! hits, and resolves each surviving hit to provenance plus time-bounded
//! URLs. A knowledge base that fails to search degrades to a warning; the
//! caller still gets whatever the healthy ones returned.

use tracing::{debug, warn};

use crate::collections::collection_name_for;
use crate::embedding::embed_query;
use crate::error::Result;
use crate::models::{ContextSource, SearchResult};
use crate::runtime::Services;

/// Retrieve the best pages for `query` across a conversation's knowledge
/// bases: an optional transient (per-conversation) one plus the persistent
/// ones. A knowledge base named twice is searched once.
///
/// `top_k` is clamped to `1..=max_top_k`. Hits scoring below the configured
/// floor are dropped. Unknown or deleted knowledge bases are skipped, and a
/// query that cannot be embedded yields no context rather than an error; the
/// chat layer never sees raw transport failures.
pub async fn assemble_context(
    services: &Services,
    query: &str,
    transient_kb: Option<&str>,
    kb_ids: &[String],
    top_k: usize,
) -> Result<Vec<ContextSource>> {
    let top_k = top_k.clamp(1, services.config.search.max_top_k);
    let min_score = services.config.search.min_score;

    let mut referenced: Vec<&str> = Vec::new();
    for kb_id in transient_kb
        .into_iter()
        .chain(kb_ids.iter().map(String::as_str))
    {
        if !referenced.contains(&kb_id) {
            referenced.push(kb_id);
        }
    }

    let query_vectors = match embed_query(services.embedder.as_ref(), query).await {
        Ok(vectors) => vectors,
        Err(e) => {
            warn!(error = %e, "query embedding failed, returning no context");
            return Ok(Vec::new());
        }
    };

    let mut hits: Vec<(String, SearchResult)> = Vec::new();
    for kb_id in referenced {
        if services.metadata.get_kb(kb_id).await?.is_none() {
            debug!(kb = %kb_id, "skipping unknown knowledge base");
            continue;
        }
        let collection = collection_name_for(kb_id);
        match services.search.search(&collection, &query_vectors, top_k).await {
            Ok(results) => {
                hits.extend(results.into_iter().map(|r| (kb_id.to_string(), r)));
            }
            Err(e) => {
                warn!(kb = %kb_id, error = %e, "search failed, skipping knowledge base");
            }
        }
    }

    hits.retain(|(_, r)| r.score >= min_score);
    hits.sort_by(|a, b| {
        b.1.score
            .partial_cmp(&a.1.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.page_id.cmp(&b.1.page_id))
    });
    hits.truncate(top_k);

    let ttl = services.config.blob.presign_ttl_secs;
    let mut sources = Vec::with_capacity(hits.len());
    for (kb_id, hit) in hits {
        let Some(info) = services.metadata.page_info(&hit.page_id).await? else {
            warn!(page = %hit.page_id, "hit lost its metadata, skipping");
            continue;
        };
        let image_url = match services.blob.presign_get(&info.image_key, ttl).await {
            Ok(url) => url,
            Err(e) => {
                warn!(page = %hit.page_id, error = %e, "presign failed, skipping hit");
                continue;
            }
        };
        let file_url = match services.blob.presign_get(&info.file_blob_key, ttl).await {
            Ok(url) => url,
            Err(e) => {
                warn!(page = %hit.page_id, error = %e, "presign failed, skipping hit");
                continue;
            }
        };
        sources.push(ContextSource {
            score: hit.score,
            knowledge_base_id: kb_id,
            filename: info.original_name,
            image_url,
            file_url,
        });
    }
    Ok(sources)
}
