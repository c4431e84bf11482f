use crate::config::{ClientConfig, ClusterConfig};
use crate::error::{FlowError, Result};
use crate::protocol;
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// One reachable node of the remote cluster, load-weighted by its reported
/// flow-file count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub url: String,
    pub flow_file_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerEntry {
    hostname: String,
    port: u16,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    flow_file_count: u64,
}

impl PeerEntry {
    fn into_peer(self) -> Peer {
        let scheme = if self.secure { "https" } else { "http" };
        Peer {
            url: format!("{}://{}:{}/nifi-api", scheme, self.hostname, self.port),
            flow_file_count: self.flow_file_count,
        }
    }
}

struct PeerState {
    peers: Vec<Peer>,
    cursor: usize,
    last_refresh: Option<Instant>,
}

/// Maintains the peer list for one remote cluster and opens authenticated
/// HTTP requests against the currently selected peer.
pub struct PeerConnectionManager {
    client: Client,
    cluster: ClusterConfig,
    handshake: HashMap<String, String>,
    peer_update_interval: Duration,
    state: RwLock<PeerState>,
}

impl PeerConnectionManager {
    pub fn new(cluster: ClusterConfig, config: &ClientConfig) -> Result<Self> {
        if cluster.urls.is_empty() {
            return Err(FlowError::Config(
                "remote cluster has no seed urls".to_string(),
            ));
        }

        let timeout = Duration::from_millis(config.timeout_millis);
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout);

        if let Some(proxy_config) = &cluster.proxy {
            let mut proxy = reqwest::Proxy::all(&proxy_config.url)?;
            if let (Some(username), Some(password)) =
                (&proxy_config.username, &proxy_config.password)
            {
                proxy = proxy.basic_auth(username, password);
            }
            builder = builder.proxy(proxy);
        }

        // Seed urls stand in as the peer list until the first successful
        // refresh.
        let peers = rank_peers(
            cluster
                .urls
                .iter()
                .map(|url| Peer {
                    url: url.trim_end_matches('/').to_string(),
                    flow_file_count: 0,
                })
                .collect(),
        );

        Ok(Self {
            client: builder.build()?,
            cluster,
            handshake: protocol::handshake_properties(config),
            peer_update_interval: Duration::from_millis(config.peer_update_interval_millis),
            state: RwLock::new(PeerState {
                peers,
                cursor: 0,
                last_refresh: None,
            }),
        })
    }

    /// Handshake properties sent as headers on every transaction request.
    pub fn handshake(&self) -> &HashMap<String, String> {
        &self.handshake
    }

    pub async fn current_peer_url(&self) -> String {
        let state = self.state.read().await;
        state.peers[state.cursor % state.peers.len()].url.clone()
    }

    /// Move on to the next peer in load-rank order after a connection
    /// failure.
    pub async fn advance_peer(&self) {
        let mut state = self.state.write().await;
        state.cursor = (state.cursor + 1) % state.peers.len();
    }

    /// Build a request for `path` against the current peer, with credentials
    /// applied. `path` is appended to the peer base url.
    pub async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let base = self.current_peer_url().await;
        self.request_at(method, &base, path)
    }

    /// Build a request against a specific peer base url. Used by transaction
    /// code that must keep talking to the peer the transaction was created
    /// on.
    pub fn request_at(&self, method: Method, base: &str, path: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{}", base, path));
        if let Some(credentials) = &self.cluster.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }
        builder
    }

    /// Fetch `/site-to-site/peers` from the current peer and replace the
    /// peer list, ranked ascending by flow-file count.
    pub async fn refresh_peers(&self) -> Result<()> {
        let response = self
            .request(Method::GET, "/site-to-site/peers")
            .await
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FlowError::Transport(format!(
                "peer list fetch failed with status {}",
                response.status()
            )));
        }

        let entries: Vec<PeerEntry> = response.json().await?;
        let mut state = self.state.write().await;
        state.last_refresh = Some(Instant::now());

        if entries.is_empty() {
            tracing::warn!("Peer list refresh returned no peers, keeping current list");
            return Ok(());
        }

        state.peers = rank_peers(entries.into_iter().map(PeerEntry::into_peer).collect());
        state.cursor = 0;
        tracing::debug!("Refreshed peer list: {} peers", state.peers.len());
        Ok(())
    }

    /// Refresh the peer list when it has never been fetched or has gone
    /// stale. Failures are logged; the current list keeps serving.
    pub async fn refresh_peers_if_stale(&self) {
        let stale = {
            let state = self.state.read().await;
            match state.last_refresh {
                None => true,
                Some(at) => at.elapsed() > self.peer_update_interval,
            }
        };

        if stale {
            if let Err(e) = self.refresh_peers().await {
                tracing::warn!("Peer list refresh failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn peers(&self) -> Vec<Peer> {
        self.state.read().await.peers.clone()
    }
}

/// Ascending by flow-file count, ties broken by url.
fn rank_peers(mut peers: Vec<Peer>) -> Vec<Peer> {
    peers.sort_by(|a, b| {
        a.flow_file_count
            .cmp(&b.flow_file_count)
            .then_with(|| a.url.cmp(&b.url))
    });
    peers
}
