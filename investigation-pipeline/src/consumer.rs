use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    messaging::{
        attempts_from, request_id_from, RabbitMqClient, FAILED_DOCUMENT_QUEUE,
        INVESTIGATION_QUEUE,
    },
};
use futures::StreamExt;
use lapin::{message::Delivery, options::BasicAckOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::investigator::Investigator;

/// Total processing attempts per message, the first delivery included.
pub const MAX_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF_BASE_MS: u64 = 500;

/// Wire schema of the investigation work queue. Anything that does not
/// decode into this is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvestigationMessage {
    pub route_id: uuid::Uuid,
    #[serde(default)]
    pub allow_recovery: bool,
}

/// What to do with a delivery after one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Retry,
    DeadLetter,
}

/// Classifies an investigation failure. Transient faults retry until the
/// attempt cap; everything else is unrecoverable for this message.
fn disposition_for(err: &AppError, attempts_made: u32) -> Disposition {
    if err.is_transient() && attempts_made < MAX_ATTEMPTS {
        Disposition::Retry
    } else {
        Disposition::DeadLetter
    }
}

/// Exponential backoff for the n-th attempt (1-based).
fn backoff_delay(attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(6);
    Duration::from_millis(RETRY_BACKOFF_BASE_MS << exponent)
}

/// A handler owns one queue. The registry maps queue names to handlers at
/// startup; handlers are plain async functions of a delivery.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    fn queue(&self) -> &'static str;
    async fn handle(&self, delivery: Delivery) -> Result<(), AppError>;
}

/// Runs one consumer task per registered queue handler.
pub struct ConsumerRegistry {
    mq: Arc<RabbitMqClient>,
    handlers: Vec<Arc<dyn QueueHandler>>,
}

impl ConsumerRegistry {
    pub fn new(mq: Arc<RabbitMqClient>) -> Self {
        Self {
            mq,
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn QueueHandler>) {
        self.handlers.push(handler);
    }

    pub async fn run(self) -> Result<(), AppError> {
        let mut tasks = Vec::new();

        for handler in self.handlers {
            let queue = handler.queue();
            let mut consumer = self
                .mq
                .consumer(queue, &format!("{queue}-consumer"))
                .await?;
            info!(%queue, "Consumer started");

            tasks.push(tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            if let Err(err) = handler.handle(delivery).await {
                                error!(%queue, error = %err, "Failed to handle delivery");
                            }
                        }
                        Err(err) => {
                            error!(%queue, error = %err, "Error consuming message");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }));
        }

        for task in tasks {
            task.await?;
        }

        Ok(())
    }
}

/// Consumes the investigation work queue under a global parallelism bound.
///
/// Transient failures are republished with an incremented attempt header and
/// `allow_recovery = true` (a plain requeue could not mutate the body), then
/// the original is acked. Fatal failures forward the untouched body to the
/// dead-letter queue.
pub struct InvestigationConsumer {
    mq: Arc<RabbitMqClient>,
    investigator: Arc<Investigator>,
    semaphore: Arc<Semaphore>,
}

impl InvestigationConsumer {
    pub fn new(
        mq: Arc<RabbitMqClient>,
        investigator: Arc<Investigator>,
        investigation_parallelism: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            mq,
            investigator,
            semaphore: Arc::new(Semaphore::new(investigation_parallelism.max(1))),
        })
    }

    async fn process_delivery(
        mq: Arc<RabbitMqClient>,
        investigator: Arc<Investigator>,
        delivery: Delivery,
        permit: OwnedSemaphorePermit,
    ) {
        let headers = delivery.properties.headers().as_ref();
        let request_id = request_id_from(headers);
        let attempts_made = attempts_from(headers) + 1;
        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(ToString::to_string);

        let disposition = match serde_json::from_slice::<InvestigationMessage>(&delivery.data) {
            Err(err) => {
                error!(error = %err, "Undecodable investigation message");
                Disposition::DeadLetter
            }
            Ok(message) => {
                let route_id = message.route_id.to_string();
                let allow_recovery = message.allow_recovery || attempts_made > 1;

                match investigator.investigate(&route_id, allow_recovery).await {
                    Ok(route) => {
                        info!(
                            %route_id,
                            status = route.status.as_str(),
                            request_id = ?request_id,
                            "Investigation finished"
                        );
                        Disposition::Ack
                    }
                    Err(err) => {
                        let disposition = disposition_for(&err, attempts_made);
                        warn!(
                            %route_id,
                            error = %err,
                            attempt = attempts_made,
                            ?disposition,
                            "Investigation attempt failed"
                        );
                        disposition
                    }
                }
            }
        };

        // Capacity frees up before any retry backoff sleeps.
        drop(permit);

        match disposition {
            Disposition::Ack => Self::ack(&delivery).await,
            Disposition::Retry => {
                tokio::time::sleep(backoff_delay(attempts_made)).await;

                let retry = match serde_json::from_slice::<InvestigationMessage>(&delivery.data) {
                    Ok(message) => InvestigationMessage {
                        route_id: message.route_id,
                        allow_recovery: true,
                    },
                    Err(_) => return,
                };
                let payload = match serde_json::to_vec(&retry) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(error = %err, "Could not encode retry message");
                        return;
                    }
                };

                if let Err(err) = mq
                    .publish_raw(
                        INVESTIGATION_QUEUE,
                        payload,
                        correlation_id,
                        request_id,
                        Some(attempts_made),
                    )
                    .await
                {
                    error!(error = %err, "Could not republish for retry");
                    return;
                }
                Self::ack(&delivery).await;
            }
            Disposition::DeadLetter => {
                if let Err(err) = mq
                    .publish_raw(
                        FAILED_DOCUMENT_QUEUE,
                        delivery.data.clone(),
                        correlation_id,
                        request_id,
                        None,
                    )
                    .await
                {
                    error!(error = %err, "Could not publish to dead-letter queue");
                    return;
                }
                Self::ack(&delivery).await;
            }
        }
    }

    async fn ack(delivery: &Delivery) {
        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %err, "Failed to ack delivery");
        }
    }
}

#[async_trait]
impl QueueHandler for InvestigationConsumer {
    fn queue(&self) -> &'static str {
        INVESTIGATION_QUEUE
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), AppError> {
        // Backpressure: wait for capacity before taking on the message, then
        // process concurrently.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|err| AppError::InternalError(err.to_string()))?;

        let mq = Arc::clone(&self.mq);
        let investigator = Arc::clone(&self.investigator);
        tokio::spawn(Self::process_delivery(mq, investigator, delivery, permit));

        Ok(())
    }
}
