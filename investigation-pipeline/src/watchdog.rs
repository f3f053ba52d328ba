use std::{sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::route::{Route, RouteStatus},
    },
    utils::config::AppConfig,
};
use tracing::{error, info, warn};

/// Periodic sweep that times out investigations stuck in progress.
///
/// The sweep reuses the atomic status transition, so it is safe against an
/// investigator finishing (or a retry recovering the route) concurrently:
/// whoever wins the precondition wins the route.
pub struct StaleWatchdog {
    db: Arc<SurrealDbClient>,
    investigation_timeout: Duration,
    period: Duration,
}

impl StaleWatchdog {
    pub fn new(db: Arc<SurrealDbClient>, config: &AppConfig) -> Self {
        Self {
            db,
            investigation_timeout: Duration::from_secs(config.investigation_timeout),
            period: Duration::from_secs(config.watchdog_period),
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.period);
        // The immediate first tick would sweep before anything can be stale.
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(0) => {}
                Ok(timed_out) => {
                    info!(timed_out, "Stale investigations moved to timeout");
                }
                Err(err) => error!(error = %err, "Stale investigation sweep failed"),
            }
        }
    }

    /// Times out every route that has been in progress longer than the
    /// deadline. Returns how many routes this sweep transitioned.
    pub async fn sweep(&self) -> Result<usize, AppError> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(
                self.investigation_timeout.as_secs().min(i64::MAX as u64) as i64,
            );

        let stale = Route::list_stale(cutoff, &self.db).await?;

        let mut timed_out = 0;
        for route in stale {
            match Route::transition(
                &route.id,
                RouteStatus::InProgress,
                RouteStatus::Timeout,
                &self.db,
            )
            .await
            {
                Ok(_) => {
                    warn!(route_id = %route.id, "Investigation exceeded its deadline");
                    timed_out += 1;
                }
                // Lost the race against the investigator; nothing to do.
                Err(AppError::OperationNotAllowed(_)) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(timed_out)
    }
}
