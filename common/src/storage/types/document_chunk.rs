use std::collections::HashMap;

use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::{config::DistanceMetric, hash::create_sha256_hash},
};

stored_object!(DocumentChunk, "document_chunk", {
    document_id: String,
    parent_id: Option<String>,
    content: String,
    embedding: Vec<f32>,
    content_hash: String
});

/// Search result including the metric value. The score is the raw metric:
/// a distance for `cosine`/`l2`, a dot product for `inner`. Callers must not
/// re-interpret the ordering.
#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ChunkSearchResult {
    pub chunk: DocumentChunk,
    pub raw_score: f32,
}

/// Restricts a vector search to documents with a matching forwarded record
/// and/or away from explicitly excluded documents.
#[derive(Debug, Clone, Default)]
pub struct ChunkSearchFilters {
    pub sender_id: Option<String>,
    pub is_valid: Option<bool>,
    pub is_hidden: Option<bool>,
    pub exclude_document_ids: Vec<String>,
}

impl DocumentChunk {
    pub fn new(
        document_id: String,
        parent_id: Option<String>,
        content: String,
        embedding: Vec<f32>,
    ) -> Self {
        let content_hash = create_sha256_hash(&content);
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            document_id,
            parent_id,
            content,
            embedding,
            content_hash,
        }
    }

    /// Returns the chunks of a document in head-to-tail order by walking the
    /// `parent_id` chain. Fails when the document has no head chunk.
    pub async fn list_by_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let chunks: Vec<Self> = db
            .query("SELECT * FROM type::table($table) WHERE document_id = $document_id")
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .take(0)?;

        let head = chunks
            .iter()
            .find(|chunk| chunk.parent_id.is_none())
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No head chunk found for document {document_id}"
                ))
            })?;

        let by_parent: HashMap<&str, &Self> = chunks
            .iter()
            .filter_map(|chunk| {
                chunk
                    .parent_id
                    .as_deref()
                    .map(|parent_id| (parent_id, chunk))
            })
            .collect();

        let mut ordered = vec![head];
        // The chain cannot be longer than the chunk count, which also guards
        // against a corrupted cyclic chain.
        while ordered.len() < chunks.len() {
            let current_id = match ordered.last() {
                Some(chunk) => chunk.id.as_str(),
                None => break,
            };
            match by_parent.get(current_id) {
                Some(next) => ordered.push((*next).clone()),
                None => break,
            }
        }

        Ok(ordered)
    }

    /// Removes every chunk of a document. A document exclusively owns its
    /// chunks, so this is the cascade half of a document deletion.
    pub async fn delete_by_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query("DELETE type::table($table) WHERE document_id = $document_id")
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?;

        Ok(())
    }

    /// Nearest-neighbour search over all stored chunks.
    ///
    /// The score expression follows the metric: cosine distance and euclidean
    /// distance order ascending, dot product orders descending. An optional
    /// `score_threshold` prunes at the chunk level in the metric's sense.
    pub async fn search(
        query_embedding: Vec<f32>,
        limit: usize,
        metric: DistanceMetric,
        filters: &ChunkSearchFilters,
        score_threshold: Option<f32>,
        db: &SurrealDbClient,
    ) -> Result<Vec<ChunkSearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            #[serde(deserialize_with = "deserialize_datetime")]
            created_at: DateTime<Utc>,
            document_id: String,
            parent_id: Option<String>,
            content: String,
            embedding: Vec<f32>,
            content_hash: String,
            raw_score: f32,
        }

        let score_expr = match metric {
            DistanceMetric::Cosine => "1 - vector::similarity::cosine(embedding, $query)",
            DistanceMetric::L2 => "vector::distance::euclidean(embedding, $query)",
            DistanceMetric::Inner => "vector::dot(embedding, $query)",
        };
        let order_direction = if metric.higher_is_better() {
            "DESC"
        } else {
            "ASC"
        };

        let mut conditions: Vec<String> = Vec::new();

        if filters.sender_id.is_some() || filters.is_valid.is_some() || filters.is_hidden.is_some()
        {
            let mut forwarded_conditions: Vec<&str> = Vec::new();
            if filters.sender_id.is_some() {
                forwarded_conditions.push("sender_id = $sender_id");
            }
            if filters.is_valid.is_some() {
                forwarded_conditions.push("is_valid = $is_valid");
            }
            if filters.is_hidden.is_some() {
                forwarded_conditions.push("is_hidden = $is_hidden");
            }
            conditions.push(format!(
                "document_id IN (SELECT VALUE document_id FROM forwarded WHERE {})",
                forwarded_conditions.join(" AND ")
            ));
        }

        if !filters.exclude_document_ids.is_empty() {
            conditions.push("document_id NOT IN $exclude_document_ids".to_string());
        }

        if score_threshold.is_some() {
            let comparison = if metric.higher_is_better() { ">=" } else { "<=" };
            conditions.push(format!("{score_expr} {comparison} $score_threshold"));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT *, {score_expr} AS raw_score FROM {table} {where_clause} \
             ORDER BY raw_score {order_direction} LIMIT {limit}",
            table = Self::table_name(),
        );

        let mut query = db.query(sql).bind(("query", query_embedding));
        if let Some(sender_id) = filters.sender_id.clone() {
            query = query.bind(("sender_id", sender_id));
        }
        if let Some(is_valid) = filters.is_valid {
            query = query.bind(("is_valid", is_valid));
        }
        if let Some(is_hidden) = filters.is_hidden {
            query = query.bind(("is_hidden", is_hidden));
        }
        if !filters.exclude_document_ids.is_empty() {
            query = query.bind(("exclude_document_ids", filters.exclude_document_ids.clone()));
        }
        if let Some(threshold) = score_threshold {
            query = query.bind(("score_threshold", threshold));
        }

        let mut response = query.await.map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ChunkSearchResult {
                chunk: DocumentChunk {
                    id: row.id,
                    created_at: row.created_at,
                    document_id: row.document_id,
                    parent_id: row.parent_id,
                    content: row.content,
                    embedding: row.embedding,
                    content_hash: row.content_hash,
                },
                raw_score: row.raw_score,
            })
            .collect())
    }
}
