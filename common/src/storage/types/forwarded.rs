use std::collections::HashMap;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Forwarded, "forwarded", {
    document_id: String,
    sender_id: Option<String>,
    recipient_id: String,
    route_id: Option<String>,
    purpose: Option<String>,
    is_valid: Option<bool>,
    is_hidden: bool,
    score: Option<f32>
});

impl Forwarded {
    /// Creates a forwarded record. `is_valid` starts as `None`, meaning the
    /// decision is still awaiting manual acceptance or rejection.
    pub fn new(
        document_id: String,
        sender_id: Option<String>,
        recipient_id: String,
        route_id: Option<String>,
        purpose: Option<String>,
        score: Option<f32>,
    ) -> Result<Self, AppError> {
        if sender_id.as_deref() == Some(recipient_id.as_str()) {
            return Err(AppError::Validation(
                "A document cannot be forwarded from an agent to itself".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            document_id,
            sender_id,
            recipient_id,
            route_id,
            purpose,
            is_valid: None,
            is_hidden: false,
            score,
        })
    }

    /// Persists a batch of forwarded records in a single transaction.
    pub async fn add_many(records: Vec<Self>, db: &SurrealDbClient) -> Result<(), AppError> {
        if records.is_empty() {
            return Ok(());
        }

        const STORE_FORWARDED_MUTATION: &str = r#"
            BEGIN TRANSACTION;
            FOR $record IN $records {
                CREATE type::thing('forwarded', $record.id) CONTENT $record;
            };
            COMMIT TRANSACTION;
        "#;

        let response = db
            .client
            .query(STORE_FORWARDED_MUTATION)
            .bind(("records", records))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_by_document(
        document_id: &str,
        sender_id: Option<&str>,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let mut sql =
            "SELECT * FROM type::table($table) WHERE document_id = $document_id".to_string();
        if sender_id.is_some() {
            sql.push_str(" AND sender_id = $sender_id");
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = db
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()));
        if let Some(sender_id) = sender_id {
            query = query.bind(("sender_id", sender_id.to_string()));
        }

        let records: Vec<Self> = query.await?.take(0)?;
        Ok(records)
    }

    pub async fn list_by_route(route_id: &str, db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let records: Vec<Self> = db
            .query("SELECT * FROM type::table($table) WHERE route_id = $route_id")
            .bind(("table", Self::table_name()))
            .bind(("route_id", route_id.to_string()))
            .await?
            .take(0)?;
        Ok(records)
    }

    /// Records the manual decision on a prediction: accepted (`true`),
    /// rejected (`false`) or back to pending (`None`).
    pub async fn set_validity(
        id: &str,
        is_valid: Option<bool>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .query("UPDATE type::thing('forwarded', $id) SET is_valid = $is_valid RETURN AFTER")
            .bind(("id", id.to_string()))
            .bind(("is_valid", is_valid))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("Forwarded with id={id} not found")))
    }

    /// Accepted, visible forwarded counts per recipient for a sender. Feeds
    /// the collaborative signal of the candidate evaluator.
    pub async fn recipient_stats_for_sender(
        sender_id: &str,
        db: &SurrealDbClient,
    ) -> Result<HashMap<String, u64>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            recipient_id: String,
            total: u64,
        }

        let rows: Vec<Row> = db
            .query(
                "SELECT recipient_id, count() AS total FROM type::table($table)
                 WHERE sender_id = $sender_id AND is_valid = true AND is_hidden = false
                 GROUP BY recipient_id",
            )
            .bind(("table", Self::table_name()))
            .bind(("sender_id", sender_id.to_string()))
            .await?
            .take(0)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.recipient_id, row.total))
            .collect())
    }
}
