use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::forwarded::Forwarded;

/// Lifecycle of an investigation. Serialized names are the wire/storage
/// values and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RouteStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            RouteStatus::Completed
                | RouteStatus::Failed
                | RouteStatus::Timeout
                | RouteStatus::Cancelled
        )
    }

    /// The allowed transition table. Recovery transitions
    /// (`failed|timeout -> pending`) are listed here; whether recovery is
    /// permitted for a given caller is decided at the call site.
    pub const fn can_transition(self, to: RouteStatus) -> bool {
        matches!(
            (self, to),
            (RouteStatus::Pending, RouteStatus::InProgress)
                | (RouteStatus::Pending, RouteStatus::Cancelled)
                | (RouteStatus::InProgress, RouteStatus::Completed)
                | (RouteStatus::InProgress, RouteStatus::Failed)
                | (RouteStatus::InProgress, RouteStatus::Timeout)
                | (RouteStatus::InProgress, RouteStatus::Cancelled)
                | (RouteStatus::Failed, RouteStatus::Pending)
                | (RouteStatus::Timeout, RouteStatus::Pending)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RouteStatus::Pending => "pending",
            RouteStatus::InProgress => "in_progress",
            RouteStatus::Completed => "completed",
            RouteStatus::Failed => "failed",
            RouteStatus::Timeout => "timeout",
            RouteStatus::Cancelled => "cancelled",
        }
    }
}

stored_object!(Route, "route", {
    document_id: String,
    sender_id: Option<String>,
    status: RouteStatus,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    completed_at: Option<DateTime<Utc>>
});

impl Route {
    pub fn new(document_id: String, sender_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            document_id,
            sender_id,
            status: RouteStatus::Pending,
            started_at: None,
            completed_at: None,
        }
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item::<Self>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Route with id={id} not found")))
    }

    /// Atomically moves a route from `from` to `to`.
    ///
    /// The update carries the status precondition so two concurrent callers
    /// cannot both win the same transition. A precondition miss surfaces as
    /// `OperationNotAllowed` with the status actually observed.
    ///
    /// Timestamp side effects:
    /// - `-> in_progress` sets `started_at`, clears `completed_at`
    /// - `-> pending` (recovery) clears both
    /// - any terminal state sets `completed_at`
    pub async fn transition(
        id: &str,
        from: RouteStatus,
        to: RouteStatus,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        if !from.can_transition(to) {
            return Err(AppError::OperationNotAllowed(format!(
                "Route transition {} -> {} is not allowed",
                from.as_str(),
                to.as_str()
            )));
        }

        let set_clause = match to {
            RouteStatus::InProgress => {
                "status = $to, started_at = time::now(), completed_at = NONE"
            }
            RouteStatus::Pending => "status = $to, started_at = NONE, completed_at = NONE",
            RouteStatus::Completed
            | RouteStatus::Failed
            | RouteStatus::Timeout
            | RouteStatus::Cancelled => "status = $to, completed_at = time::now()",
        };

        let sql = format!(
            "UPDATE type::thing('route', $id) SET {set_clause} WHERE status = $from RETURN AFTER"
        );

        let updated: Option<Self> = db
            .query(sql)
            .bind(("id", id.to_string()))
            .bind(("from", from))
            .bind(("to", to))
            .await?
            .take(0)?;

        match updated {
            Some(route) => Ok(route),
            None => {
                let current = Self::get(id, db).await?;
                Err(AppError::OperationNotAllowed(format!(
                    "Route {} is {}, expected {}",
                    id,
                    current.status.as_str(),
                    from.as_str()
                )))
            }
        }
    }

    /// Routes that have been in progress longer than the watchdog deadline.
    pub async fn list_stale(
        cutoff: DateTime<Utc>,
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        let routes: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = 'in_progress'
                   AND started_at != NONE
                   AND started_at < $cutoff",
            )
            .bind(("table", Self::table_name()))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .await?
            .take(0)?;

        Ok(routes)
    }

    /// A route together with its predicted forwardeds.
    pub async fn fetch(
        id: &str,
        db: &SurrealDbClient,
    ) -> Result<(Self, Vec<Forwarded>), AppError> {
        let route = Self::get(id, db).await?;
        let forwards = Forwarded::list_by_route(id, db).await?;
        Ok((route, forwards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    async fn stored_route(db: &SurrealDbClient) -> Route {
        let route = Route::new(Uuid::new_v4().to_string(), Some("sender".to_string()));
        db.store_item(route.clone()).await.expect("store route");
        route
    }

    #[test]
    fn test_transition_table() {
        use RouteStatus::*;

        assert!(Pending.can_transition(InProgress));
        assert!(Pending.can_transition(Cancelled));
        assert!(InProgress.can_transition(Completed));
        assert!(InProgress.can_transition(Failed));
        assert!(InProgress.can_transition(Timeout));
        assert!(InProgress.can_transition(Cancelled));
        assert!(Failed.can_transition(Pending));
        assert!(Timeout.can_transition(Pending));

        // Terminal states stay terminal.
        for terminal in [Completed, Cancelled] {
            for target in [Pending, InProgress, Completed, Failed, Timeout, Cancelled] {
                assert!(!terminal.can_transition(target));
            }
        }
        assert!(!Pending.can_transition(Completed));
        assert!(!Pending.can_transition(Failed));
        assert!(!Failed.can_transition(InProgress));
    }

    #[test]
    fn test_status_wire_values() {
        let serialized = serde_json::to_string(&RouteStatus::InProgress).expect("serialize");
        assert_eq!(serialized, "\"in_progress\"");
        for status in [
            RouteStatus::Pending,
            RouteStatus::InProgress,
            RouteStatus::Completed,
            RouteStatus::Failed,
            RouteStatus::Timeout,
            RouteStatus::Cancelled,
        ] {
            let as_json = serde_json::to_string(&status).expect("serialize");
            assert_eq!(as_json, format!("\"{}\"", status.as_str()));
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let db = memory_db().await;
        let route = stored_route(&db).await;

        let loaded = Route::get(&route.id, &db).await.expect("load");
        assert_eq!(loaded, route);
    }

    #[tokio::test]
    async fn test_in_progress_sets_started_at() {
        let db = memory_db().await;
        let route = stored_route(&db).await;

        let updated =
            Route::transition(&route.id, RouteStatus::Pending, RouteStatus::InProgress, &db)
                .await
                .expect("transition");

        assert_eq!(updated.status, RouteStatus::InProgress);
        assert!(updated.started_at.is_some());
        assert!(updated.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_terminal_states_set_completed_at() {
        let db = memory_db().await;

        for terminal in [
            RouteStatus::Completed,
            RouteStatus::Failed,
            RouteStatus::Timeout,
            RouteStatus::Cancelled,
        ] {
            let route = stored_route(&db).await;
            Route::transition(&route.id, RouteStatus::Pending, RouteStatus::InProgress, &db)
                .await
                .expect("start");
            let updated = Route::transition(&route.id, RouteStatus::InProgress, terminal, &db)
                .await
                .expect("finish");

            assert_eq!(updated.status, terminal);
            assert!(
                updated.completed_at.is_some(),
                "terminal {} should set completed_at",
                terminal.as_str()
            );
        }
    }

    #[tokio::test]
    async fn test_recovery_clears_timestamps() {
        let db = memory_db().await;
        let route = stored_route(&db).await;

        Route::transition(&route.id, RouteStatus::Pending, RouteStatus::InProgress, &db)
            .await
            .expect("start");
        Route::transition(&route.id, RouteStatus::InProgress, RouteStatus::Failed, &db)
            .await
            .expect("fail");
        let recovered =
            Route::transition(&route.id, RouteStatus::Failed, RouteStatus::Pending, &db)
                .await
                .expect("recover");

        assert_eq!(recovered.status, RouteStatus::Pending);
        assert!(recovered.started_at.is_none());
        assert!(recovered.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let db = memory_db().await;
        let route = stored_route(&db).await;

        let result =
            Route::transition(&route.id, RouteStatus::Pending, RouteStatus::Completed, &db).await;
        assert!(matches!(result, Err(AppError::OperationNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_precondition_mismatch_is_rejected() {
        let db = memory_db().await;
        let route = stored_route(&db).await;

        Route::transition(&route.id, RouteStatus::Pending, RouteStatus::InProgress, &db)
            .await
            .expect("start");
        Route::transition(&route.id, RouteStatus::InProgress, RouteStatus::Completed, &db)
            .await
            .expect("complete");

        // The row is completed, so the pending precondition must fail.
        let result =
            Route::transition(&route.id, RouteStatus::Pending, RouteStatus::InProgress, &db).await;
        assert!(matches!(result, Err(AppError::OperationNotAllowed(_))));
    }

    #[tokio::test]
    async fn test_missing_route_is_not_found() {
        let db = memory_db().await;

        let result =
            Route::transition("missing", RouteStatus::Pending, RouteStatus::InProgress, &db).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_start_has_exactly_one_winner() {
        let db = Arc::new(memory_db().await);
        let route = stored_route(&db).await;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let db = Arc::clone(&db);
            let route_id = route.id.clone();
            handles.push(tokio::spawn(async move {
                Route::transition(
                    &route_id,
                    RouteStatus::Pending,
                    RouteStatus::InProgress,
                    &db,
                )
                .await
            }));
        }

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(route) => {
                    assert_eq!(route.status, RouteStatus::InProgress);
                    winners += 1;
                }
                Err(AppError::OperationNotAllowed(_)) => losers += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(losers, 1);
    }

    #[tokio::test]
    async fn test_fetch_returns_route_with_predictions() {
        let db = memory_db().await;
        let route = stored_route(&db).await;

        let prediction = Forwarded::new(
            route.document_id.clone(),
            route.sender_id.clone(),
            "recipient".to_string(),
            Some(route.id.clone()),
            None,
            Some(0.7),
        )
        .expect("forwarded");
        db.store_item(prediction.clone()).await.expect("store");

        let (loaded, forwards) = Route::fetch(&route.id, &db).await.expect("fetch");
        assert_eq!(loaded.id, route.id);
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].id, prediction.id);
    }
}
