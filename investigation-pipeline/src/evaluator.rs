use std::{collections::HashMap, sync::Arc};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::forwarded::Forwarded},
};
use retrieval_pipeline::ScoredDocument;
use tracing::debug;

/// Where a candidate's similarity evidence came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarDocumentSource {
    pub document_id: String,
    pub score: Option<f32>,
}

/// A recipient under consideration for one investigation.
#[derive(Debug, Clone)]
pub struct PotentialRecipient {
    pub agent_id: String,
    pub similar_docs: Vec<SimilarDocumentSource>,
    pub score: f32,
    pub is_eligible: bool,
}

impl PotentialRecipient {
    pub fn new(agent_id: String) -> Self {
        Self {
            agent_id,
            similar_docs: Vec::new(),
            score: 0.0,
            is_eligible: false,
        }
    }

    /// Records a similarity source, keeping at most one entry per document.
    pub fn record_similarity(&mut self, document_id: &str, score: f32) {
        if !self
            .similar_docs
            .iter()
            .any(|source| source.document_id == document_id)
        {
            self.similar_docs.push(SimilarDocumentSource {
                document_id: document_id.to_string(),
                score: Some(score),
            });
        }
    }
}

/// Scores potential recipients with three normalized signals and marks
/// everyone above the threshold as eligible.
pub struct CandidateEvaluator {
    db: Arc<SurrealDbClient>,
}

impl CandidateEvaluator {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Sets `score` and `is_eligible` on every candidate. The final score is
    /// the arithmetic mean of the frequency, collaborative and historical
    /// signals, each normalized to `[0, 1]`. A signal that is zero for every
    /// candidate contributes zero uniformly.
    pub async fn evaluate(
        &self,
        sender_id: &str,
        potential_recipients: &mut HashMap<String, PotentialRecipient>,
        similar_documents: &[ScoredDocument],
        eligible_threshold: f32,
    ) -> Result<(), AppError> {
        if potential_recipients.is_empty() {
            return Ok(());
        }

        let frequency_scores = Self::frequency_score(potential_recipients);
        let collaborative_scores = self
            .collaborative_score(sender_id, potential_recipients)
            .await?;
        let historical_scores = self
            .historical_score(potential_recipients, similar_documents)
            .await?;

        for (agent_id, recipient) in potential_recipients.iter_mut() {
            let mut total = frequency_scores.get(agent_id).copied().unwrap_or(0.0);
            total += collaborative_scores.get(agent_id).copied().unwrap_or(0.0);
            total += historical_scores.get(agent_id).copied().unwrap_or(0.0);
            recipient.score = total / 3.0;
            recipient.is_eligible = recipient.score > eligible_threshold;

            debug!(
                %agent_id,
                score = recipient.score,
                is_eligible = recipient.is_eligible,
                "Aggregated weighted assessment of a potential candidate"
            );
        }

        Ok(())
    }

    /// How often the candidate appeared among the similar documents, using
    /// the similarity score of each source (or 1 when a source carries no
    /// score).
    fn frequency_score(
        potential_recipients: &HashMap<String, PotentialRecipient>,
    ) -> HashMap<String, f32> {
        let mut raw: HashMap<String, f32> = HashMap::new();
        for (agent_id, recipient) in potential_recipients {
            let mut score = 0.0;
            for source in &recipient.similar_docs {
                score += source.score.unwrap_or(1.0);
            }
            raw.insert(agent_id.clone(), score);
        }

        let max_score = raw.values().copied().fold(0.0_f32, f32::max);
        if max_score == 0.0 {
            return raw.keys().map(|agent_id| (agent_id.clone(), 0.0)).collect();
        }

        raw.into_iter()
            .map(|(agent_id, score)| (agent_id, score / max_score))
            .collect()
    }

    /// How often the sender's accepted, visible forwardeds already went to
    /// each candidate, normalized by the sender's most-used recipient
    /// overall (candidate or not).
    async fn collaborative_score(
        &self,
        sender_id: &str,
        potential_recipients: &HashMap<String, PotentialRecipient>,
    ) -> Result<HashMap<String, f32>, AppError> {
        let stats = Forwarded::recipient_stats_for_sender(sender_id, &self.db).await?;

        let max_count = stats.values().copied().max().unwrap_or(0);
        if max_count == 0 {
            return Ok(potential_recipients
                .keys()
                .map(|agent_id| (agent_id.clone(), 0.0))
                .collect());
        }

        Ok(potential_recipients
            .keys()
            .map(|agent_id| {
                let count = stats.get(agent_id).copied().unwrap_or(0);
                (agent_id.clone(), count as f32 / max_count as f32)
            })
            .collect())
    }

    /// Forwarding-chain evidence: walking each similar document's forwardeds
    /// in creation order, every candidate that shows up as the *next* hop
    /// collects that document's weight.
    async fn historical_score(
        &self,
        potential_recipients: &HashMap<String, PotentialRecipient>,
        similar_documents: &[ScoredDocument],
    ) -> Result<HashMap<String, f32>, AppError> {
        let mut counts: HashMap<String, f32> = HashMap::new();

        for similar in similar_documents {
            if !similar.score.is_finite() {
                continue;
            }
            // A document that aggregated to exactly zero still counts as
            // evidence, with unit weight.
            let weight = if similar.score == 0.0 {
                1.0
            } else {
                similar.score
            };

            let forwards =
                Forwarded::list_by_document(&similar.document.id, None, &self.db).await?;
            for pair in forwards.windows(2) {
                let next_recipient = pair[1].recipient_id.as_str();
                if potential_recipients.contains_key(next_recipient) {
                    *counts.entry(next_recipient.to_string()).or_insert(0.0) += weight;
                }
            }
        }

        let max_count = counts.values().copied().fold(0.0_f32, f32::max);
        if max_count == 0.0 {
            return Ok(potential_recipients
                .keys()
                .map(|agent_id| (agent_id.clone(), 0.0))
                .collect());
        }

        Ok(potential_recipients
            .keys()
            .map(|agent_id| {
                let count = counts.get(agent_id).copied().unwrap_or(0.0);
                (agent_id.clone(), count / max_count)
            })
            .collect())
    }
}
