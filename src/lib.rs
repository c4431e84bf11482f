//! Edgeflow - Site-to-Site client library for streaming data from edge
//! devices to a remote NiFi-style cluster using:
//! - the S2S HTTP transport with CRC-confirmed transactions
//! - a durable SQLite-backed packet queue drained in batches
//! - load-biased peer selection over the cluster's reported flow-file counts

pub mod client;
pub mod config;
pub mod drain;
pub mod error;
pub mod packet;
pub mod packet_queue;
pub mod peer;
pub mod protocol;
pub mod transaction;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use client::SiteToSiteClient;
pub use config::{ClientConfig, ClusterConfig, Credentials, ProxyConfig, QueuedClientConfig};
pub use drain::{DrainWorker, ResultSink};
pub use error::{FlowError, Result};
pub use packet::DataPacket;
pub use packet_queue::{PacketQueue, QueueBatch, QueueLimits};
pub use peer::{Peer, PeerConnectionManager};
pub use protocol::ResponseCode;
pub use transaction::{Transaction, TransactionResult, TransactionState};
