use crate::client::{best_effort_cancel, SiteToSiteClient};
use crate::config::QueuedClientConfig;
use crate::error::{FlowError, Result};
use crate::packet_queue::{PacketQueue, QueueBatch, QueueLimits};
use crate::transaction::{stream_packets, Transaction, TransactionResult};
use std::time::{Duration, Instant};

/// Per-invocation result callbacks supplied by the caller. Each drain or
/// direct send notifies its sink exactly once.
pub trait ResultSink: Send + Sync {
    fn on_transaction_result(
        &self,
        result: Option<TransactionResult>,
        error: Option<&FlowError>,
    ) {
        let _ = (result, error);
    }

    fn on_queued_operation_result(&self, error: Option<&FlowError>) {
        let _ = error;
    }
}

/// Moves queued packets onto the wire, one batched transaction at a time,
/// until the queue is empty or the drain deadline passes. The external
/// scheduler invokes `drain`.
pub struct DrainWorker {
    client: SiteToSiteClient,
    queue: PacketQueue,
    config: QueuedClientConfig,
}

impl DrainWorker {
    pub fn new(config: QueuedClientConfig) -> Result<Self> {
        let client = SiteToSiteClient::new(config.client.clone())?;
        let queue = PacketQueue::open(&config.database_path, QueueLimits::from(&config))?;
        Ok(Self {
            client,
            queue,
            config,
        })
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// Drain the queue, reporting the outcome through the sink exactly once.
    pub async fn drain(&self, sink: &dyn ResultSink) {
        match self.drain_inner().await {
            Ok(()) => sink.on_queued_operation_result(None),
            Err(e) => {
                tracing::error!("Drain failed: {}", e);
                sink.on_queued_operation_result(Some(&e));
            }
        }
    }

    async fn drain_inner(&self) -> Result<()> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.max_transaction_time_millis);

        loop {
            // The deadline is only checked between batches; an in-flight
            // batch always runs to completion.
            if Instant::now() >= deadline {
                tracing::warn!("Drain deadline reached with packets still queued");
                return Ok(());
            }

            let batch = self.queue.next_batch(
                self.config.client.preferred_batch_count,
                self.config.client.preferred_batch_size_bytes,
                self.config.max_age_millis,
            )?;
            if batch.is_empty() {
                return Ok(());
            }

            let mut transaction = match self.client.create_transaction().await {
                Ok(transaction) => transaction,
                Err(e) => {
                    self.rollback(&batch);
                    return Err(e);
                }
            };

            match deliver(&mut transaction, &batch).await {
                Ok(result) => {
                    if let Err(e) = self.queue.commit(&batch) {
                        self.rollback(&batch);
                        return Err(e);
                    }
                    tracing::info!(
                        "Drained batch of {} packets ({} confirmed by server)",
                        batch.len(),
                        result.flow_files_sent
                    );
                }
                Err(e) => {
                    best_effort_cancel(&mut transaction).await;
                    self.rollback(&batch);
                    return Err(e);
                }
            }
        }
    }

    fn rollback(&self, batch: &QueueBatch) {
        if let Err(e) = self.queue.rollback(batch) {
            tracing::error!("Failed to roll back batch checkout: {}", e);
        }
    }
}

async fn deliver(
    transaction: &mut Transaction,
    batch: &QueueBatch,
) -> Result<TransactionResult> {
    stream_packets(transaction, batch.packets()).await?;
    transaction.confirm().await?;
    transaction.complete().await
}
