use std::{ops::Deref, sync::Arc, time::Duration};

use crate::error::AppError;

use super::types::StoredObject;
use chrono::Utc;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    /// Connect and select the namespace/database pair.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Defines every index the engine relies on. The vector index carries the
    /// embedding dimension, so this must run before any chunk is stored and
    /// again whenever the dimension changes.
    pub async fn ensure_initialized(&self, embedding_dimension: usize) -> Result<(), AppError> {
        self.build_indexes(embedding_dimension).await?;
        Ok(())
    }

    pub async fn build_indexes(&self, embedding_dimension: usize) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_embedding_document_chunk ON document_chunk FIELDS embedding HNSW DIMENSION {embedding_dimension} DIST COSINE TYPE F32 EFC 100 M 8"
            ))
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_document ON document_chunk FIELDS document_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_route_status ON route FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_route_started ON route FIELDS started_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_forwarded_document ON forwarded FIELDS document_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_forwarded_sender ON forwarded FIELDS sender_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_forwarded_route ON forwarded FIELDS route_id")
            .await?;

        Ok(())
    }

    /// Acquire a process-spanning advisory lock on `key`.
    ///
    /// The lock is a single record with an expiry, taken inside a transaction
    /// so two holders cannot race past each other. A live lock surfaces as
    /// `OperationNotAllowed`; expired locks are overwritten.
    pub async fn lock_advisory(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let expires_at: surrealdb::sql::Datetime =
            (Utc::now() + chrono::Duration::seconds(ttl.as_secs().min(i64::MAX as u64) as i64))
                .into();

        let response = self
            .client
            .query("BEGIN TRANSACTION;")
            .query("LET $held = (SELECT * FROM type::thing('advisory_lock', $key) WHERE expires_at > time::now());")
            .query("IF array::len($held) > 0 { THROW 'advisory lock held' };")
            .query("UPSERT type::thing('advisory_lock', $key) SET expires_at = $expires_at;")
            .query("COMMIT TRANSACTION;")
            .bind(("key", key.to_string()))
            .bind(("expires_at", expires_at))
            .await
            .map_err(AppError::Database)?;

        match response.check() {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("advisory lock held") => Err(
                AppError::OperationNotAllowed(format!("advisory lock on {key} is held")),
            ),
            Err(err) => Err(AppError::Database(err)),
        }
    }

    /// Release an advisory lock. Releasing a lock that is not held is a no-op.
    pub async fn unlock_advisory(&self, key: &str) -> Result<(), AppError> {
        self.client
            .query("DELETE type::thing('advisory_lock', $key);")
            .bind(("key", key.to_string()))
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve all objects from a certain table, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * `Result` - Vec<T> or Error
    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to delete
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
