use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Document, "document", {
    name: String,
    storage_ref: Option<String>,
    content_type: Option<String>
});

impl Document {
    pub fn new(name: String, storage_ref: Option<String>, content_type: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            name,
            storage_ref,
            content_type,
        }
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item::<Self>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Document with id={id} not found")))
    }

    /// Deletes a document together with its chunks.
    pub async fn delete(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        super::document_chunk::DocumentChunk::delete_by_document(id, db).await?;
        db.delete_item::<Self>(id).await?;
        Ok(())
    }

    /// Hydrates documents in caller order, silently skipping ids that no
    /// longer resolve.
    pub async fn get_by_ids(ids: &[String], db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(document) = db.get_item::<Self>(id).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }
}
