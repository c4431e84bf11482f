use crate::config::ClientConfig;
use crate::drain::ResultSink;
use crate::error::{FlowError, Result};
use crate::packet::DataPacket;
use crate::peer::PeerConnectionManager;
use crate::transaction::{stream_packets, Transaction, TransactionResult};
use std::sync::Arc;

/// Client facade over one or more remote clusters.
///
/// Clusters are tried in configuration order; within a cluster a
/// transaction-creation attempt that fails with a connection error gets one
/// retry against the next peer in load-rank order.
pub struct SiteToSiteClient {
    config: ClientConfig,
    managers: Vec<Arc<PeerConnectionManager>>,
}

impl SiteToSiteClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.remote_clusters.is_empty() {
            return Err(FlowError::Config(
                "no remote clusters configured".to_string(),
            ));
        }

        let managers = config
            .remote_clusters
            .iter()
            .map(|cluster| {
                PeerConnectionManager::new(cluster.clone(), &config).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { config, managers })
    }

    /// Open a transaction on the first cluster that accepts one.
    pub async fn create_transaction(&self) -> Result<Transaction> {
        let mut last_error = None;

        for manager in &self.managers {
            manager.refresh_peers_if_stale().await;

            match Transaction::begin(manager.clone(), &self.config).await {
                Ok(transaction) => return Ok(transaction),
                Err(FlowError::Transport(reason)) => {
                    tracing::warn!(
                        "Transaction creation failed on {}: {}",
                        manager.current_peer_url().await,
                        reason
                    );
                    manager.advance_peer().await;
                    match Transaction::begin(manager.clone(), &self.config).await {
                        Ok(transaction) => return Ok(transaction),
                        Err(e) => last_error = Some(e),
                    }
                }
                // Protocol violations will not improve on another peer.
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| FlowError::Config("no remote clusters configured".to_string())))
    }

    /// Direct send path: one transaction for the supplied packets, with the
    /// outcome reported through the sink exactly once. Packets whose data
    /// cannot be read are skipped.
    pub async fn send(&self, packets: &[DataPacket], sink: &dyn ResultSink) {
        match self.send_inner(packets).await {
            Ok(result) => sink.on_transaction_result(Some(result), None),
            Err(e) => {
                tracing::error!("Direct send failed: {}", e);
                sink.on_transaction_result(None, Some(&e));
            }
        }
    }

    async fn send_inner(&self, packets: &[DataPacket]) -> Result<TransactionResult> {
        let mut transaction = self.create_transaction().await?;

        let streamed = stream_packets(&mut transaction, packets.iter()).await;
        if let Err(e) = streamed {
            best_effort_cancel(&mut transaction).await;
            return Err(e);
        }
        if let Err(e) = transaction.confirm().await {
            best_effort_cancel(&mut transaction).await;
            return Err(e);
        }
        transaction.complete().await
    }
}

pub(crate) async fn best_effort_cancel(transaction: &mut Transaction) {
    if let Err(e) = transaction.cancel().await {
        tracing::warn!("Best-effort transaction cancel failed: {}", e);
    }
}
