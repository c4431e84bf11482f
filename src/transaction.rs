use crate::config::ClientConfig;
use crate::error::{FlowError, Result};
use crate::packet::DataPacket;
use crate::peer::PeerConnectionManager;
use crate::protocol::{self, ResponseCode};
use crate::wire::PacketWriter;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain";

/// Summary returned by the cluster when a transaction ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
    #[serde(default)]
    pub response_code: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub flow_files_sent: u64,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Sending,
    Confirmed,
    Committed,
    Canceled,
    Failed,
}

/// One in-flight Site-to-Site transaction against a single peer.
///
/// Packet frames stream through an open flow-files request body while a
/// background task extends the server-side TTL. Both the heartbeat task and
/// the streaming connection are released on every exit path.
pub struct Transaction {
    manager: Arc<PeerConnectionManager>,
    peer_base: String,
    transaction_url: String,
    writer: Option<PacketWriter>,
    frame_tx: Option<mpsc::Sender<Bytes>>,
    send_task: Option<JoinHandle<reqwest::Result<Response>>>,
    ttl_task: Option<JoinHandle<()>>,
    state: TransactionState,
    ended: bool,
}

impl Transaction {
    /// Create a transaction on the current peer and open the flow-files
    /// stream for it.
    pub(crate) async fn begin(
        manager: Arc<PeerConnectionManager>,
        config: &ClientConfig,
    ) -> Result<Transaction> {
        let peer_base = manager.current_peer_url().await;
        let create_path = format!(
            "/data-transfer/input-ports/{}/transactions",
            config.port_identifier
        );

        let mut request = manager.request_at(Method::POST, &peer_base, &create_path);
        for (key, value) in manager.handshake() {
            request = request.header(key, value);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(FlowError::Protocol(format!(
                "responseCode={}",
                response.status().as_u16()
            )));
        }

        let headers = response.headers();
        let intent = headers
            .get(protocol::LOCATION_URI_INTENT_HEADER)
            .and_then(|value| value.to_str().ok());
        if intent != Some(protocol::LOCATION_URI_INTENT_TRANSACTION_URL) {
            return Err(FlowError::Protocol(format!(
                "expected header {} == {}",
                protocol::LOCATION_URI_INTENT_HEADER,
                protocol::LOCATION_URI_INTENT_TRANSACTION_URL
            )));
        }

        let ttl_value = headers
            .get(protocol::SERVER_TRANSACTION_TTL_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                FlowError::Protocol(format!(
                    "expected {} header",
                    protocol::SERVER_TRANSACTION_TTL_HEADER
                ))
            })?;
        let ttl_seconds: u64 = ttl_value
            .parse()
            .ok()
            .filter(|seconds| *seconds > 0)
            .ok_or_else(|| {
                FlowError::Protocol(format!(
                    "unable to parse {} as positive seconds: {}",
                    protocol::SERVER_TRANSACTION_TTL_HEADER,
                    ttl_value
                ))
            })?;

        let location = headers
            .get(protocol::LOCATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                FlowError::Protocol(format!(
                    "expected header {} to contain transaction url",
                    protocol::LOCATION_HEADER
                ))
            })?;
        let location_path = reqwest::Url::parse(location)
            .map_err(|e| FlowError::Protocol(format!("invalid transaction url {}: {}", location, e)))?
            .path()
            .to_string();
        // Only the first occurrence is stripped, matching the server's own
        // prefixing.
        let transaction_url = location_path.replacen("/nifi-api", "", 1);

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(8);
        let stream = futures::stream::unfold(frame_rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<Bytes, std::io::Error>(chunk), rx))
        });

        let mut flow_files_request = manager
            .request_at(
                Method::POST,
                &peer_base,
                &format!("{}/flow-files", transaction_url),
            )
            .header(CONTENT_TYPE, APPLICATION_OCTET_STREAM)
            .header(ACCEPT, TEXT_PLAIN);
        for (key, value) in manager.handshake() {
            flow_files_request = flow_files_request.header(key, value);
        }
        let flow_files_request = flow_files_request.body(reqwest::Body::wrap_stream(stream));
        let send_task = tokio::spawn(async move { flow_files_request.send().await });

        let ttl_task = spawn_ttl_extender(
            manager.clone(),
            peer_base.clone(),
            transaction_url.clone(),
            // ttl/2 truncated to whole seconds; a 1s floor keeps ttl=1 from
            // degenerating into a zero-period loop.
            Duration::from_secs((ttl_seconds / 2).max(1)),
        );

        tracing::info!(
            "Opened transaction {} with ttl {}s",
            transaction_url,
            ttl_seconds
        );

        Ok(Transaction {
            writer: Some(PacketWriter::new(config.use_compression)),
            manager,
            peer_base,
            transaction_url,
            frame_tx: Some(frame_tx),
            send_task: Some(send_task),
            ttl_task: Some(ttl_task),
            state: TransactionState::Open,
            ended: false,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Stream one packet into the open flow-files body.
    pub async fn send(&mut self, packet: &DataPacket) -> Result<()> {
        if !matches!(
            self.state,
            TransactionState::Open | TransactionState::Sending
        ) {
            return Err(FlowError::Protocol(format!(
                "transaction in state {:?} cannot send",
                self.state
            )));
        }

        let data = packet.read_data().await?;
        let writer = self.writer.as_mut().ok_or_else(|| {
            FlowError::Protocol("flow-files stream already closed".to_string())
        })?;

        if let Err(e) = writer.write_packet(&packet.attributes(), &data) {
            return Err(self.abort_with(e).await);
        }
        let chunk = writer.take_output();
        if !chunk.is_empty() {
            self.send_frame(chunk).await?;
        }

        self.state = TransactionState::Sending;
        Ok(())
    }

    /// Close the frame stream and verify the server-computed CRC against the
    /// locally calculated one. On mismatch the transaction is ended with
    /// `BAD_CHECKSUM` before failing.
    pub async fn confirm(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            TransactionState::Open | TransactionState::Sending
        ) {
            return Err(FlowError::Protocol(format!(
                "transaction in state {:?} cannot confirm",
                self.state
            )));
        }

        let writer = self.writer.take().ok_or_else(|| {
            FlowError::Protocol("flow-files stream already closed".to_string())
        })?;
        let (tail, calculated) = match writer.finish() {
            Ok(parts) => parts,
            Err(e) => return Err(self.abort_with(e).await),
        };
        if !tail.is_empty() {
            self.send_frame(tail).await?;
        }
        // Dropping the sender ends the request body.
        self.frame_tx = None;

        let send_task = self.send_task.take().ok_or_else(|| {
            FlowError::Protocol("flow-files stream already closed".to_string())
        })?;
        let response = match send_task.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.abort_with(e.into()).await),
            Err(e) => {
                return Err(self
                    .abort_with(FlowError::Transport(format!(
                        "flow-files send task failed: {}",
                        e
                    )))
                    .await)
            }
        };

        let status = response.status().as_u16();
        if status != 200 && status != 202 {
            return Err(self
                .abort_with(FlowError::Transport(format!(
                    "flow-files returned status {}",
                    status
                )))
                .await);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Err(self.abort_with(e.into()).await),
        };
        let reported: u64 = match body.trim().parse() {
            Ok(crc) => crc,
            Err(_) => {
                return Err(self
                    .abort_with(FlowError::Protocol(format!(
                        "unable to parse server CRC: {:?}",
                        body
                    )))
                    .await)
            }
        };

        if reported != calculated {
            if let Err(e) = self.end_transaction(ResponseCode::BadChecksum).await {
                tracing::warn!("Failed to report bad checksum: {}", e);
            }
            self.state = TransactionState::Failed;
            return Err(FlowError::ChecksumMismatch {
                calculated,
                reported,
            });
        }

        self.state = TransactionState::Confirmed;
        Ok(())
    }

    /// Complete a confirmed transaction.
    pub async fn complete(&mut self) -> Result<TransactionResult> {
        if self.state != TransactionState::Confirmed {
            return Err(FlowError::Protocol(format!(
                "transaction in state {:?} cannot complete",
                self.state
            )));
        }

        match self.end_transaction(ResponseCode::ConfirmTransaction).await {
            Ok(result) => {
                self.state = TransactionState::Committed;
                tracing::info!(
                    "Committed transaction {}: {} flow files, {} bytes",
                    self.transaction_url,
                    result.flow_files_sent,
                    result.bytes_sent
                );
                Ok(result)
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    /// Cancel the transaction, telling the server to discard anything
    /// already received.
    pub async fn cancel(&mut self) -> Result<TransactionResult> {
        if matches!(
            self.state,
            TransactionState::Committed | TransactionState::Canceled
        ) {
            return Err(FlowError::Protocol(format!(
                "transaction in state {:?} cannot cancel",
                self.state
            )));
        }

        match self.end_transaction(ResponseCode::CancelTransaction).await {
            Ok(result) => {
                self.state = TransactionState::Canceled;
                Ok(result)
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    async fn send_frame(&mut self, chunk: Vec<u8>) -> Result<()> {
        let sender = match &self.frame_tx {
            Some(sender) => sender.clone(),
            None => {
                return Err(FlowError::Protocol(
                    "flow-files stream already closed".to_string(),
                ))
            }
        };
        if sender.send(Bytes::from(chunk)).await.is_err() {
            return Err(self
                .abort_with(FlowError::Transport(
                    "flow-files connection closed while sending".to_string(),
                ))
                .await);
        }
        Ok(())
    }

    /// Stop the heartbeat, drop the streaming connection and issue the
    /// end-transaction DELETE carrying `code`.
    async fn end_transaction(&mut self, code: ResponseCode) -> Result<TransactionResult> {
        if self.ended {
            return Err(FlowError::Protocol(
                "transaction already ended".to_string(),
            ));
        }
        self.stop_heartbeat().await?;
        self.release_streams();

        let mut request = self
            .manager
            .request_at(Method::DELETE, &self.peer_base, &self.transaction_url)
            .query(&[("responseCode", code.code().to_string())])
            .header(CONTENT_TYPE, APPLICATION_OCTET_STREAM);
        for (key, value) in self.manager.handshake() {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FlowError::Transport(format!(
                "end transaction returned status {}",
                response.status().as_u16()
            )));
        }

        self.ended = true;
        response
            .json()
            .await
            .map_err(|e| FlowError::Protocol(format!("unable to parse transaction result: {}", e)))
    }

    /// Mark the transaction failed and release every resource, returning the
    /// causing error for the caller to propagate.
    async fn abort_with(&mut self, err: FlowError) -> FlowError {
        self.state = TransactionState::Failed;
        self.release_streams();
        if let Err(stop_err) = self.stop_heartbeat().await {
            tracing::warn!("Failed to stop ttl extender: {}", stop_err);
        }
        err
    }

    /// Cancel the heartbeat task and wait for it to wind down. Only the
    /// cancellation signal itself is tolerated.
    async fn stop_heartbeat(&mut self) -> Result<()> {
        if let Some(task) = self.ttl_task.take() {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(FlowError::Transport(format!(
                        "ttl extender task failed: {}",
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    fn release_streams(&mut self) {
        self.frame_tx = None;
        if let Some(task) = self.send_task.take() {
            task.abort();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(task) = self.ttl_task.take() {
            task.abort();
        }
        if let Some(task) = self.send_task.take() {
            task.abort();
        }
    }
}

/// Periodic TTL extension against the transaction url. The task closes over
/// the connection manager, peer and url only, so it can never prolong the
/// transaction's own lifetime; it runs until aborted.
fn spawn_ttl_extender(
    manager: Arc<PeerConnectionManager>,
    peer_base: String,
    transaction_url: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let mut request = manager.request_at(Method::PUT, &peer_base, &transaction_url);
            for (key, value) in manager.handshake() {
                request = request.header(key, value);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Extended ttl for transaction {}", transaction_url);
                }
                Ok(response) => {
                    tracing::error!(
                        "Extending ttl failed for transaction {} (responseCode {})",
                        transaction_url,
                        response.status().as_u16()
                    );
                }
                Err(e) => {
                    tracing::error!("Error extending transaction ttl: {}", e);
                }
            }
        }
    })
}

/// Stream a sequence of packets into `transaction`, skipping packets whose
/// data cannot be read. Returns the number of packets actually sent.
pub(crate) async fn stream_packets<'a, I>(transaction: &mut Transaction, packets: I) -> Result<u64>
where
    I: IntoIterator<Item = &'a DataPacket>,
{
    let mut sent = 0;
    for packet in packets {
        match transaction.send(packet).await {
            Ok(()) => sent += 1,
            Err(FlowError::DataFetch(reason)) => {
                tracing::warn!("Skipping packet with unreadable data: {}", reason);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}
