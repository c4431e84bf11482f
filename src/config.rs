use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One remote cluster: seed URLs plus optional proxy and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub port_identifier: String,
    pub remote_clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default = "default_idle_connection_expiration_millis")]
    pub idle_connection_expiration_millis: u64,
    #[serde(default = "default_preferred_batch_count")]
    pub preferred_batch_count: u32,
    #[serde(default)]
    pub preferred_batch_size_bytes: u64,
    #[serde(default)]
    pub preferred_batch_duration_millis: u64,
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
    #[serde(default = "default_peer_update_interval_millis")]
    pub peer_update_interval_millis: u64,
}

/// Client config plus the durable-queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedClientConfig {
    #[serde(flatten)]
    pub client: ClientConfig,
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default)]
    pub max_age_millis: u64,
    #[serde(default = "default_max_transaction_time_millis")]
    pub max_transaction_time_millis: u64,
    pub database_path: PathBuf,
}

fn default_idle_connection_expiration_millis() -> u64 {
    30_000
}

fn default_preferred_batch_count() -> u32 {
    100
}

fn default_timeout_millis() -> u64 {
    30_000
}

fn default_peer_update_interval_millis() -> u64 {
    1_800_000
}

fn default_max_rows() -> u64 {
    10_000
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_transaction_time_millis() -> u64 {
    600_000
}

impl ClientConfig {
    pub fn new(port_identifier: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            port_identifier: port_identifier.into(),
            remote_clusters: vec![ClusterConfig {
                urls,
                proxy: None,
                credentials: None,
            }],
            use_compression: false,
            idle_connection_expiration_millis: default_idle_connection_expiration_millis(),
            preferred_batch_count: default_preferred_batch_count(),
            preferred_batch_size_bytes: 0,
            preferred_batch_duration_millis: 0,
            timeout_millis: default_timeout_millis(),
            peer_update_interval_millis: default_peer_update_interval_millis(),
        }
    }

    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        load_settings(path)
    }
}

impl QueuedClientConfig {
    pub fn new(client: ClientConfig, database_path: impl Into<PathBuf>) -> Self {
        Self {
            client,
            max_rows: default_max_rows(),
            max_size_bytes: default_max_size_bytes(),
            max_age_millis: 0,
            max_transaction_time_millis: default_max_transaction_time_millis(),
            database_path: database_path.into(),
        }
    }

    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        load_settings(path)
    }
}

fn load_settings<T: serde::de::DeserializeOwned>(path: &str) -> crate::error::Result<T> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("EDGEFLOW"))
        .build()
        .map_err(|e| crate::error::FlowError::Config(e.to_string()))?;

    settings
        .try_deserialize()
        .map_err(|e| crate::error::FlowError::Config(e.to_string()))
}
