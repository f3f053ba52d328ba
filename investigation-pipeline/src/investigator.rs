use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            agent::Agent,
            forwarded::Forwarded,
            route::{Route, RouteStatus},
        },
    },
    utils::config::AppConfig,
};
use retrieval_pipeline::{RetrievalParams, Retriever};
use tracing::{debug, error, info, warn};

use crate::evaluator::{CandidateEvaluator, PotentialRecipient};

/// Fallback prediction score when no candidate threshold is configured.
const DEFAULT_FALLBACK_SCORE: f32 = 0.99;

/// Appends the unscoped second pass after the sender-scoped first pass,
/// dampening the second-pass scores so unscoped near-duplicates never
/// outweigh documents with actual sender history.
fn merge_passes(
    first_pass: Vec<retrieval_pipeline::ScoredDocument>,
    second_pass: Vec<retrieval_pipeline::ScoredDocument>,
    dampening: f32,
) -> Vec<retrieval_pipeline::ScoredDocument> {
    let mut merged = first_pass;
    merged.extend(second_pass.into_iter().map(|mut similar| {
        similar.score *= dampening;
        similar
    }));
    merged
}

/// Orchestrates a single investigation end-to-end: route state transitions,
/// the two retrieval passes, candidate evaluation and prediction writes.
pub struct Investigator {
    db: Arc<SurrealDbClient>,
    retriever: Arc<Retriever>,
    evaluator: CandidateEvaluator,
    config: AppConfig,
}

impl Investigator {
    pub fn new(db: Arc<SurrealDbClient>, retriever: Arc<Retriever>, config: AppConfig) -> Self {
        let evaluator = CandidateEvaluator::new(Arc::clone(&db));
        Self {
            db,
            retriever,
            evaluator,
            config,
        }
    }

    /// Runs the investigation for one route.
    ///
    /// Only `pending` routes are investigated; `failed` and `timeout` routes
    /// re-enter `pending` first when `allow_recovery` is set. An advisory
    /// lock keyed by the route id serializes retries of the same route
    /// across processes.
    pub async fn investigate(
        &self,
        route_id: &str,
        allow_recovery: bool,
    ) -> Result<Route, AppError> {
        let route = Route::get(route_id, &self.db).await?;
        let sender_id = route.sender_id.clone().ok_or_else(|| {
            AppError::BusinessLogic(
                "It is impossible to conduct an investigation without information about the sender."
                    .to_string(),
            )
        })?;

        let lock_key = format!("route:{route_id}");
        self.db
            .lock_advisory(
                &lock_key,
                Duration::from_secs(self.config.investigation_timeout),
            )
            .await?;

        let result = self.run(route, &sender_id, allow_recovery).await;

        if let Err(err) = self.db.unlock_advisory(&lock_key).await {
            warn!(%route_id, error = %err, "Failed to release route advisory lock");
        }

        result
    }

    async fn run(
        &self,
        route: Route,
        sender_id: &str,
        allow_recovery: bool,
    ) -> Result<Route, AppError> {
        let route_id = route.id.clone();

        if route.status != RouteStatus::Pending {
            if allow_recovery
                && matches!(route.status, RouteStatus::Failed | RouteStatus::Timeout)
            {
                info!(%route_id, from = route.status.as_str(), "Recovering route for re-investigation");
                Route::transition(&route_id, route.status, RouteStatus::Pending, &self.db)
                    .await?;
            } else {
                return Err(AppError::OperationNotAllowed(format!(
                    "Route investigation completed with status {}",
                    route.status.as_str()
                )));
            }
        }

        // Atomic claim; a concurrent investigator loses here and writes
        // nothing.
        let route =
            Route::transition(&route_id, RouteStatus::Pending, RouteStatus::InProgress, &self.db)
                .await?;

        match self.conduct(&route, sender_id).await {
            Ok(completed) => Ok(completed),
            Err(err) => {
                if let Err(transition_err) = Route::transition(
                    &route_id,
                    RouteStatus::InProgress,
                    RouteStatus::Failed,
                    &self.db,
                )
                .await
                {
                    warn!(%route_id, error = %transition_err, "Could not mark route as failed");
                }
                error!(%route_id, error = %err, "Failed to conduct investigation");
                Err(err)
            }
        }
    }

    async fn conduct(&self, route: &Route, sender_id: &str) -> Result<Route, AppError> {
        // ----- Retrieve similar documents -----

        let mut first_params = RetrievalParams::from_config(&self.config);
        first_params.sender_id = Some(sender_id.to_string());
        let first_pass = self
            .retriever
            .by_document(&route.document_id, &first_params)
            .await?;

        // Second pass widens to unscoped near-duplicates, excluding what the
        // first pass already found; its scores are dampened before merging.
        let mut second_params = RetrievalParams::from_config(&self.config);
        second_params.exclude_document_ids = first_pass
            .iter()
            .map(|similar| similar.document.id.clone())
            .collect();
        let second_pass = self
            .retriever
            .by_document(&route.document_id, &second_params)
            .await?;

        if first_pass.is_empty() && !second_pass.is_empty() {
            return self.fallback_to_default_recipients(route, sender_id).await;
        }

        let similar_documents =
            merge_passes(first_pass, second_pass, self.config.second_pass_dampening);

        if similar_documents.is_empty() {
            return Err(AppError::BusinessLogic(
                "No similar documents could be found.".to_string(),
            ));
        }

        // ----- Identify potential recipients -----

        let mut potential_recipients: HashMap<String, PotentialRecipient> = HashMap::new();
        for similar in &similar_documents {
            let recipients =
                match Agent::recipients_for_sender(sender_id, &similar.document.id, &self.db)
                    .await
                {
                    Ok(recipients) => recipients,
                    Err(err) => {
                        warn!(
                            similar_document_id = %similar.document.id,
                            %sender_id,
                            error = %err,
                            "No potential recipients found for similar document"
                        );
                        continue;
                    }
                };

            for recipient in recipients {
                if recipient.id == sender_id {
                    continue;
                }
                let entry = potential_recipients
                    .entry(recipient.id.clone())
                    .or_insert_with(|| PotentialRecipient::new(recipient.id.clone()));
                entry.record_similarity(&similar.document.id, similar.score);
            }
        }

        // ----- Score potential recipients -----

        let threshold = self.config.candidate_score_threshold.unwrap_or(0.0);
        self.evaluator
            .evaluate(
                sender_id,
                &mut potential_recipients,
                &similar_documents,
                threshold,
            )
            .await?;

        // ----- Build forwarded -----

        let mut predictions = Vec::new();
        for recipient in potential_recipients.values() {
            if recipient.is_eligible {
                predictions.push(Forwarded::new(
                    route.document_id.clone(),
                    Some(sender_id.to_string()),
                    recipient.agent_id.clone(),
                    Some(route.id.clone()),
                    None,
                    Some(recipient.score),
                )?);
            }
        }

        debug!(
            route_id = %route.id,
            candidates = potential_recipients.len(),
            predictions = predictions.len(),
            "Writing predicted forwardeds"
        );

        Forwarded::add_many(predictions, &self.db).await?;

        self.complete(&route.id).await
    }

    /// No sender-scoped history but unscoped look-alikes exist: route to the
    /// default recipients instead of predicting from evidence.
    async fn fallback_to_default_recipients(
        &self,
        route: &Route,
        sender_id: &str,
    ) -> Result<Route, AppError> {
        let defaults = Agent::default_recipients(&self.db).await?;
        if defaults.is_empty() {
            return Err(AppError::NotFound(
                "No default recipients were found.".to_string(),
            ));
        }

        let score = self
            .config
            .candidate_score_threshold
            .unwrap_or(DEFAULT_FALLBACK_SCORE);

        let mut predictions = Vec::new();
        for agent in defaults {
            if agent.id == sender_id {
                continue;
            }
            predictions.push(Forwarded::new(
                route.document_id.clone(),
                Some(sender_id.to_string()),
                agent.id,
                Some(route.id.clone()),
                None,
                Some(score),
            )?);
        }

        info!(
            route_id = %route.id,
            recipients = predictions.len(),
            "Falling back to default recipients"
        );

        Forwarded::add_many(predictions, &self.db).await?;

        self.complete(&route.id).await
    }

    /// Completes the route, treating a lost status precondition as a
    /// cancellation by the watchdog: the route keeps its terminal status and
    /// nothing else is written.
    async fn complete(&self, route_id: &str) -> Result<Route, AppError> {
        match Route::transition(
            route_id,
            RouteStatus::InProgress,
            RouteStatus::Completed,
            &self.db,
        )
        .await
        {
            Ok(route) => Ok(route),
            Err(AppError::OperationNotAllowed(reason)) => {
                let current = Route::get(route_id, &self.db).await?;
                if matches!(current.status, RouteStatus::Timeout | RouteStatus::Cancelled) {
                    warn!(
                        %route_id,
                        status = current.status.as_str(),
                        "Investigation was cancelled mid-flight"
                    );
                    Ok(current)
                } else {
                    Err(AppError::OperationNotAllowed(reason))
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::document::Document;
    use common::storage::types::document_chunk::DocumentChunk;
    use common::utils::config::{AggregationMethod, DistanceMetric};
    use common::utils::embedding::{testing::StaticEmbedder, CachedEmbedder, EmbeddingBackend};
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    fn test_config() -> AppConfig {
        AppConfig {
            openai_api_key: "test-key".to_string(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "test".to_string(),
            surrealdb_database: "test".to_string(),
            amqp_addr: "amqp://localhost".to_string(),
            openai_base_url: "http://localhost".to_string(),
            embedding_model: "test-model".to_string(),
            embedding_dimensions: 3,
            investigation_timeout: 300,
            investigation_parallelism: 2,
            retriever_limit: 20,
            retriever_soft_limit_multiplier: 3.0,
            retriever_score_threshold: None,
            retriever_distance_metric: DistanceMetric::Cosine,
            retriever_aggregation_method: AggregationMethod::Mean,
            retriever_top_k: 3,
            candidate_score_threshold: Some(0.2),
            second_pass_dampening: 0.55,
            cache_ttl: 900,
            watchdog_period: 60,
        }
    }

    async fn memory_db() -> Arc<SurrealDbClient> {
        Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        )
    }

    fn investigator(db: &Arc<SurrealDbClient>) -> Investigator {
        let backend =
            Arc::new(StaticEmbedder::new(StdHashMap::new())) as Arc<dyn EmbeddingBackend>;
        let embedder = Arc::new(CachedEmbedder::new(backend, Duration::from_secs(60)));
        let retriever = Arc::new(Retriever::new(Arc::clone(db), embedder));
        Investigator::new(Arc::clone(db), retriever, test_config())
    }

    async fn store_document(
        db: &SurrealDbClient,
        name: &str,
        chunks: &[(&str, Vec<f32>)],
    ) -> Document {
        let document = Document::new(name.to_string(), None, None);
        db.store_item(document.clone()).await.expect("store doc");

        let mut parent_id: Option<String> = None;
        for (content, embedding) in chunks {
            let chunk = DocumentChunk::new(
                document.id.clone(),
                parent_id.clone(),
                (*content).to_string(),
                embedding.clone(),
            );
            parent_id = Some(chunk.id.clone());
            db.store_item(chunk).await.expect("store chunk");
        }

        document
    }

    async fn store_agent(db: &SurrealDbClient, name: &str, is_default: bool) -> Agent {
        let agent = Agent::new(name.to_string(), None, is_default);
        db.store_item(agent.clone()).await.expect("store agent");
        agent
    }

    async fn store_forwarded(
        db: &SurrealDbClient,
        document_id: &str,
        sender_id: &str,
        recipient_id: &str,
        is_valid: Option<bool>,
    ) {
        let mut record = Forwarded::new(
            document_id.to_string(),
            Some(sender_id.to_string()),
            recipient_id.to_string(),
            None,
            None,
            None,
        )
        .expect("forwarded");
        record.is_valid = is_valid;
        db.store_item(record).await.expect("store forwarded");
    }

    fn scored_doc(id: &str, score: f32) -> retrieval_pipeline::ScoredDocument {
        let mut document = Document::new("doc".to_string(), None, None);
        document.id = id.to_string();
        retrieval_pipeline::ScoredDocument { document, score }
    }

    #[test]
    fn test_second_pass_scores_are_dampened_on_merge() {
        let first = vec![scored_doc("first-1", 0.10), scored_doc("first-2", 0.20)];
        let second = vec![scored_doc("second-1", 0.40)];

        let merged = merge_passes(first, second, 0.55);

        assert_eq!(merged.len(), 3);
        // First-pass scores pass through untouched, in order.
        assert_eq!(merged[0].document.id, "first-1");
        assert!((merged[0].score - 0.10).abs() < 1e-6);
        assert!((merged[1].score - 0.20).abs() < 1e-6);
        // Second-pass scores carry the dampening factor.
        assert_eq!(merged[2].document.id, "second-1");
        assert!((merged[2].score - 0.40 * 0.55).abs() < 1e-6);
    }

    /// Sender with prior history on a near-duplicate document: both known
    /// recipients come back as predictions and the route completes.
    #[tokio::test]
    async fn test_happy_path_predicts_known_recipients() {
        let db = memory_db().await;
        let sender = store_agent(&db, "sender", false).await;
        let r1 = store_agent(&db, "recipient-1", false).await;
        let r2 = store_agent(&db, "recipient-2", false).await;

        let source = store_document(&db, "d1", &[("quarterly report", vec![1.0, 0.0, 0.0])]).await;
        let near_dup =
            store_document(&db, "d2", &[("quarterly report", vec![0.99, 0.01, 0.0])]).await;

        store_forwarded(&db, &near_dup.id, &sender.id, &r1.id, Some(true)).await;
        store_forwarded(&db, &near_dup.id, &sender.id, &r2.id, Some(true)).await;

        let route = Route::new(source.id.clone(), Some(sender.id.clone()));
        db.store_item(route.clone()).await.expect("store route");

        let completed = investigator(&db)
            .investigate(&route.id, false)
            .await
            .expect("investigate");

        assert_eq!(completed.status, RouteStatus::Completed);
        assert!(completed.completed_at.is_some());

        let predictions = Forwarded::list_by_route(&route.id, &db)
            .await
            .expect("predictions");
        let mut recipients: Vec<_> = predictions
            .iter()
            .map(|f| f.recipient_id.clone())
            .collect();
        recipients.sort();
        let mut expected = vec![r1.id.clone(), r2.id.clone()];
        expected.sort();
        assert_eq!(recipients, expected);
        assert!(predictions.iter().all(|f| f.is_valid.is_none()));
        assert!(predictions
            .iter()
            .all(|f| f.score.is_some_and(|s| (0.0..=1.0).contains(&s))));
    }

    /// Sender without history: unscoped near-duplicates exist, so the route
    /// falls back to one prediction per default recipient.
    #[tokio::test]
    async fn test_fallback_to_default_recipients() {
        let db = memory_db().await;
        let sender = store_agent(&db, "sender", false).await;
        let fallback_1 = store_agent(&db, "fallback-1", true).await;
        let fallback_2 = store_agent(&db, "fallback-2", true).await;

        let source = store_document(&db, "d1", &[("contract", vec![1.0, 0.0, 0.0])]).await;
        store_document(&db, "d2", &[("contract", vec![0.98, 0.02, 0.0])]).await;

        let route = Route::new(source.id.clone(), Some(sender.id.clone()));
        db.store_item(route.clone()).await.expect("store route");

        let completed = investigator(&db)
            .investigate(&route.id, false)
            .await
            .expect("investigate");
        assert_eq!(completed.status, RouteStatus::Completed);

        let predictions = Forwarded::list_by_route(&route.id, &db)
            .await
            .expect("predictions");
        let mut recipients: Vec<_> = predictions
            .iter()
            .map(|f| f.recipient_id.clone())
            .collect();
        recipients.sort();
        let mut expected = vec![fallback_1.id.clone(), fallback_2.id.clone()];
        expected.sort();
        assert_eq!(recipients, expected);
        // Configured candidate threshold doubles as the fallback score.
        assert!(predictions
            .iter()
            .all(|f| f.score.is_some_and(|s| (s - 0.2).abs() < 1e-6)));
        assert!(predictions.iter().all(|f| f.is_valid.is_none()));
    }

    #[tokio::test]
    async fn test_route_without_sender_is_rejected() {
        let db = memory_db().await;
        let source = store_document(&db, "d1", &[("text", vec![1.0, 0.0, 0.0])]).await;

        let route = Route::new(source.id.clone(), None);
        db.store_item(route.clone()).await.expect("store route");

        let result = investigator(&db).investigate(&route.id, false).await;
        assert!(matches!(result, Err(AppError::BusinessLogic(_))));

        let untouched = Route::get(&route.id, &db).await.expect("route");
        assert_eq!(untouched.status, RouteStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let db = memory_db().await;
        let result = investigator(&db).investigate("missing", false).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    /// No similar documents at all: the investigation fails and the route
    /// ends up `failed`.
    #[tokio::test]
    async fn test_no_similar_documents_fails_the_route() {
        let db = memory_db().await;
        let sender = store_agent(&db, "sender", false).await;
        let source = store_document(&db, "lonely", &[("text", vec![1.0, 0.0, 0.0])]).await;

        let route = Route::new(source.id.clone(), Some(sender.id.clone()));
        db.store_item(route.clone()).await.expect("store route");

        let result = investigator(&db).investigate(&route.id, false).await;
        assert!(matches!(result, Err(AppError::BusinessLogic(_))));

        let failed = Route::get(&route.id, &db).await.expect("route");
        assert_eq!(failed.status, RouteStatus::Failed);
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_route_requires_recovery() {
        let db = memory_db().await;
        let sender = store_agent(&db, "sender", false).await;
        let source = store_document(&db, "d1", &[("text", vec![1.0, 0.0, 0.0])]).await;

        let mut route = Route::new(source.id.clone(), Some(sender.id.clone()));
        route.status = RouteStatus::Completed;
        route.completed_at = Some(chrono::Utc::now());
        db.store_item(route.clone()).await.expect("store route");

        let result = investigator(&db).investigate(&route.id, false).await;
        assert!(matches!(result, Err(AppError::OperationNotAllowed(_))));

        let result = investigator(&db).investigate(&route.id, true).await;
        assert!(
            matches!(result, Err(AppError::OperationNotAllowed(_))),
            "completed routes are not recoverable"
        );
    }

    /// Two investigators race for the same pending route: exactly one runs,
    /// the loser writes nothing.
    #[tokio::test]
    async fn test_concurrent_investigation_has_one_winner() {
        let db = memory_db().await;
        let sender = store_agent(&db, "sender", false).await;
        let r1 = store_agent(&db, "recipient-1", false).await;

        let source = store_document(&db, "d1", &[("report", vec![1.0, 0.0, 0.0])]).await;
        let near_dup = store_document(&db, "d2", &[("report", vec![0.99, 0.01, 0.0])]).await;
        store_forwarded(&db, &near_dup.id, &sender.id, &r1.id, Some(true)).await;

        let route = Route::new(source.id.clone(), Some(sender.id.clone()));
        db.store_item(route.clone()).await.expect("store route");

        let first = Arc::new(investigator(&db));
        let second = Arc::new(investigator(&db));

        let first_task = {
            let investigator = Arc::clone(&first);
            let route_id = route.id.clone();
            tokio::spawn(async move { investigator.investigate(&route_id, false).await })
        };
        let second_task = {
            let investigator = Arc::clone(&second);
            let route_id = route.id.clone();
            tokio::spawn(async move { investigator.investigate(&route_id, false).await })
        };

        let outcomes = [
            first_task.await.expect("join"),
            second_task.await.expect("join"),
        ];
        let winners = outcomes.iter().filter(|o| o.is_ok()).count();
        let losers = outcomes
            .iter()
            .filter(|o| matches!(o, Err(AppError::OperationNotAllowed(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 1);

        // Exactly one set of predictions was written.
        let predictions = Forwarded::list_by_route(&route.id, &db)
            .await
            .expect("predictions");
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].recipient_id, r1.id);
    }

    /// Replaying a failed route with recovery yields the same predictions as
    /// a clean run over the same data.
    #[tokio::test]
    async fn test_recovery_replay_is_idempotent() {
        let db = memory_db().await;
        let sender = store_agent(&db, "sender", false).await;
        let r1 = store_agent(&db, "recipient-1", false).await;
        let r2 = store_agent(&db, "recipient-2", false).await;

        let source = store_document(&db, "d1", &[("report", vec![1.0, 0.0, 0.0])]).await;
        let near_dup = store_document(&db, "d2", &[("report", vec![0.99, 0.01, 0.0])]).await;
        store_forwarded(&db, &near_dup.id, &sender.id, &r1.id, Some(true)).await;
        store_forwarded(&db, &near_dup.id, &sender.id, &r2.id, Some(true)).await;

        let route = Route::new(source.id.clone(), Some(sender.id.clone()));
        db.store_item(route.clone()).await.expect("store route");

        let worker = investigator(&db);
        worker
            .investigate(&route.id, false)
            .await
            .expect("first run");
        let first_run: Vec<(String, Option<f32>)> = {
            let mut predictions = Forwarded::list_by_route(&route.id, &db)
                .await
                .expect("predictions")
                .into_iter()
                .map(|f| (f.recipient_id, f.score))
                .collect::<Vec<_>>();
            predictions.sort_by(|a, b| a.0.cmp(&b.0));
            predictions
        };
        let first_ids: Vec<String> = Forwarded::list_by_route(&route.id, &db)
            .await
            .expect("predictions")
            .into_iter()
            .map(|f| f.id)
            .collect();

        // Force the route into a failed state, as if the completion write
        // had blown up, then replay with recovery.
        db.client
            .query("UPDATE type::thing('route', $id) SET status = 'failed', completed_at = time::now()")
            .bind(("id", route.id.clone()))
            .await
            .expect("force failed");

        worker
            .investigate(&route.id, true)
            .await
            .expect("recovery run");

        let mut replay: Vec<(String, Option<f32>)> = Forwarded::list_by_route(&route.id, &db)
            .await
            .expect("predictions")
            .into_iter()
            .filter(|f| !first_ids.contains(&f.id))
            .map(|f| (f.recipient_id, f.score))
            .collect();
        replay.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(first_run, replay);

        let final_route = Route::get(&route.id, &db).await.expect("route");
        assert_eq!(final_route.status, RouteStatus::Completed);
    }
}
