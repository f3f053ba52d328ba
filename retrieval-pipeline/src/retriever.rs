use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            document::Document,
            document_chunk::{ChunkSearchFilters, DocumentChunk},
        },
    },
    utils::{
        config::{AggregationMethod, AppConfig, DistanceMetric},
        embedding::CachedEmbedder,
    },
};
use tracing::{debug, warn};

use crate::{
    scoring::{aggregate_scores, chunk_weight, combine_with_text_similarity},
    text_similarity::similarity_ratio,
};

/// Tuning for one retrieval pass.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// When set, only documents the sender has forwarded records for are
    /// considered.
    pub sender_id: Option<String>,
    /// Final number of documents returned.
    pub limit: usize,
    /// Per-chunk over-fetch factor; the per-chunk search width is
    /// `ceil(limit * soft_limit_multiplier)` so aggregation has enough
    /// material before truncation.
    pub soft_limit_multiplier: f32,
    pub metric: DistanceMetric,
    pub aggregation: AggregationMethod,
    /// Prunes on the aggregated document score, in the metric's sense.
    pub score_threshold: Option<f32>,
    pub exclude_document_ids: Vec<String>,
    /// k' used by the `top_k_mean` aggregation.
    pub top_k: usize,
}

impl RetrievalParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sender_id: None,
            limit: config.retriever_limit,
            soft_limit_multiplier: config.retriever_soft_limit_multiplier,
            metric: config.retriever_distance_metric,
            aggregation: config.retriever_aggregation_method,
            score_threshold: config.retriever_score_threshold,
            exclude_document_ids: Vec::new(),
            top_k: config.retriever_top_k,
        }
    }

    fn soft_limit(&self) -> usize {
        let multiplier = self.soft_limit_multiplier.max(1.0);
        ((self.limit as f32) * multiplier).ceil() as usize
    }
}

/// A prior document together with its aggregated similarity score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// Two-level similarity retrieval: nearest chunks per source chunk, textual
/// re-rank, then per-document aggregation.
pub struct Retriever {
    db: Arc<SurrealDbClient>,
    embedder: Arc<CachedEmbedder>,
}

impl Retriever {
    pub fn new(db: Arc<SurrealDbClient>, embedder: Arc<CachedEmbedder>) -> Self {
        Self { db, embedder }
    }

    /// Retrieves documents similar to an existing document, using its stored
    /// chunks as the query set. The source document itself is never part of
    /// the result.
    pub async fn by_document(
        &self,
        document_id: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<ScoredDocument>, AppError> {
        debug!(
            %document_id,
            sender_id = ?params.sender_id,
            limit = params.limit,
            metric = ?params.metric,
            aggregation = ?params.aggregation,
            "Retriever query by document"
        );

        let chunks = DocumentChunk::list_by_document(document_id, &self.db).await?;
        let sources: Vec<(String, Vec<f32>)> = chunks
            .into_iter()
            .map(|chunk| (chunk.content, chunk.embedding))
            .collect();

        let mut exclude = params.exclude_document_ids.clone();
        if !exclude.iter().any(|id| id == document_id) {
            exclude.push(document_id.to_string());
        }

        self.retrieve(&sources, params, exclude).await
    }

    /// Retrieves documents similar to a free-text query. The query embedding
    /// goes through the TTL cache, so repeated queries stay cheap.
    pub async fn by_query(
        &self,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<ScoredDocument>, AppError> {
        debug!(
            query_size = query.len(),
            sender_id = ?params.sender_id,
            limit = params.limit,
            "Retriever query by text"
        );

        let embedding = self.embedder.embed(query).await?;
        let sources = [(query.to_string(), embedding)];

        self.retrieve(&sources, params, params.exclude_document_ids.clone())
            .await
    }

    async fn retrieve(
        &self,
        sources: &[(String, Vec<f32>)],
        params: &RetrievalParams,
        exclude_document_ids: Vec<String>,
    ) -> Result<Vec<ScoredDocument>, AppError> {
        let filters = ChunkSearchFilters {
            sender_id: params.sender_id.clone(),
            is_valid: None,
            is_hidden: None,
            exclude_document_ids,
        };
        let soft_limit = params.soft_limit();

        let mut relevant: Vec<(DocumentChunk, f32)> = Vec::new();
        for (source_content, source_embedding) in sources {
            let candidates = DocumentChunk::search(
                source_embedding.clone(),
                soft_limit,
                params.metric,
                &filters,
                None,
                &self.db,
            )
            .await?;

            for candidate in candidates {
                // Textual re-rank; oversized pairs keep the raw score.
                let combined = match similarity_ratio(source_content, &candidate.chunk.content) {
                    Some(ratio) => combine_with_text_similarity(
                        candidate.raw_score,
                        ratio,
                        params.metric,
                    ),
                    None => candidate.raw_score,
                };
                relevant.push((candidate.chunk, combined));
            }
        }

        debug!(chunks_count = relevant.len(), "Found relevant chunks");

        let mut doc_scores: HashMap<String, Vec<(f32, f32)>> = HashMap::new();
        for (chunk, score) in &relevant {
            let weight = chunk_weight(chunk);
            doc_scores
                .entry(chunk.document_id.clone())
                .or_default()
                .push((*score, weight));
        }

        let mut scored: Vec<(String, f32)> = Vec::new();
        for (document_id, pairs) in doc_scores {
            let aggregated =
                aggregate_scores(&pairs, params.aggregation, params.metric, params.top_k);

            let keep = match params.score_threshold {
                None => true,
                Some(threshold) if params.metric.higher_is_better() => aggregated >= threshold,
                Some(threshold) => aggregated <= threshold,
            };
            if keep {
                scored.push((document_id, aggregated));
            }
        }

        // Deterministic ordering: metric direction first, document id as the
        // tie breaker.
        if params.metric.higher_is_better() {
            scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
                Ordering::Equal => a.0.cmp(&b.0),
                other => other,
            });
        } else {
            scored.sort_by(|a, b| match a.1.total_cmp(&b.1) {
                Ordering::Equal => a.0.cmp(&b.0),
                other => other,
            });
        }
        scored.truncate(params.limit);

        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let documents = Document::get_by_ids(&ids, &self.db).await?;
        let mut by_id: HashMap<String, Document> = documents
            .into_iter()
            .map(|document| (document.id.clone(), document))
            .collect();

        let results: Vec<ScoredDocument> = scored
            .into_iter()
            .filter_map(|(id, score)| {
                by_id
                    .remove(&id)
                    .map(|document| ScoredDocument { document, score })
            })
            .collect();

        if results.is_empty() {
            warn!("No documents retrieved");
        } else {
            debug!(documents_count = results.len(), "Returning documents");
        }

        Ok(results)
    }
}
