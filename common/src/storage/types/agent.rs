use uuid::Uuid;

use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object,
    utils::embedding::CachedEmbedder,
};

stored_object!(Agent, "agent", {
    name: String,
    description: Option<String>,
    embedding: Option<Vec<f32>>,
    is_active: bool,
    is_default_recipient: bool
});

impl Agent {
    pub fn new(name: String, description: Option<String>, is_default_recipient: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            name,
            description,
            embedding: None,
            is_active: true,
            is_default_recipient,
        }
    }

    /// Registers an agent, embedding its description when one is given so the
    /// agent itself can participate in semantic matching later on.
    pub async fn register(
        name: String,
        description: Option<String>,
        is_default_recipient: bool,
        embedder: &CachedEmbedder,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let mut agent = Self::new(name, description, is_default_recipient);

        if let Some(description) = agent.description.as_deref() {
            agent.embedding = Some(embedder.embed(description).await?);
        }

        db.store_item(agent.clone()).await?;

        Ok(agent)
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item::<Self>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Agent with id={id} not found")))
    }

    /// Active agents that act as the fallback recipient set.
    pub async fn default_recipients(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let agents: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE is_active = true AND is_default_recipient = true",
            )
            .bind(("table", Self::table_name()))
            .await?
            .take(0)?;

        Ok(agents)
    }

    /// Distinct active recipients the sender has already forwarded the given
    /// document to, counting only accepted, visible forwards. Fails with
    /// `NotFound` when there are none, mirroring how callers treat an empty
    /// recipient set.
    pub async fn recipients_for_sender(
        sender_id: &str,
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT VALUE recipient_id FROM forwarded
                 WHERE sender_id = $sender_id AND document_id = $document_id
                   AND is_valid = true AND is_hidden = false",
            )
            .bind(("sender_id", sender_id.to_string()))
            .bind(("document_id", document_id.to_string()))
            .await?;

        let mut recipient_ids: Vec<String> = response.take(0)?;
        recipient_ids.sort();
        recipient_ids.dedup();

        let mut recipients = Vec::with_capacity(recipient_ids.len());
        for recipient_id in recipient_ids {
            if let Some(agent) = db.get_item::<Self>(&recipient_id).await? {
                if agent.is_active {
                    recipients.push(agent);
                }
            }
        }

        if recipients.is_empty() {
            return Err(AppError::NotFound(
                "No recipients were found for sender.".to_string(),
            ));
        }

        Ok(recipients)
    }
}
