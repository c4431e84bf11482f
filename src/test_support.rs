//! In-process mock of a NiFi Site-to-Site cluster, shared by the module
//! tests.

use crate::protocol;
use crate::wire::tests::{decode_packets, inflate};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type ReceivedPacket = (HashMap<String, String>, Vec<u8>);

pub(crate) struct MockState {
    addr: SocketAddr,
    next_transaction: AtomicU64,
    pub(crate) ttl_seconds: AtomicU64,
    pub(crate) flow_file_count: AtomicU64,
    pub(crate) fail_create: AtomicBool,
    pub(crate) omit_ttl: AtomicBool,
    pub(crate) omit_intent: AtomicBool,
    pub(crate) wrong_crc: AtomicBool,
    pub(crate) transactions_created: AtomicU64,
    pub(crate) heartbeats: Mutex<Vec<String>>,
    pub(crate) deletes: Mutex<Vec<(String, u8)>>,
    received: Mutex<Vec<(String, Vec<ReceivedPacket>)>>,
}

impl MockState {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            next_transaction: AtomicU64::new(1),
            ttl_seconds: AtomicU64::new(30),
            flow_file_count: AtomicU64::new(0),
            fail_create: AtomicBool::new(false),
            omit_ttl: AtomicBool::new(false),
            omit_intent: AtomicBool::new(false),
            wrong_crc: AtomicBool::new(false),
            transactions_created: AtomicU64::new(0),
            heartbeats: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Every packet received so far, in arrival order across transactions.
    pub(crate) fn received_packets(&self) -> Vec<ReceivedPacket> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, packets)| packets.clone())
            .collect()
    }

    /// Packet batches grouped per flow-files POST.
    pub(crate) fn received_batches(&self) -> Vec<Vec<ReceivedPacket>> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, packets)| packets.clone())
            .collect()
    }
}

pub(crate) struct MockCluster {
    pub(crate) addr: SocketAddr,
    pub(crate) state: Arc<MockState>,
}

impl MockCluster {
    pub(crate) async fn start() -> MockCluster {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::new(addr));

        let router = Router::new()
            .route("/nifi-api/site-to-site/peers", get(peers))
            .route(
                "/nifi-api/data-transfer/input-ports/:port/transactions",
                post(create_transaction),
            )
            .route(
                "/nifi-api/data-transfer/input-ports/:port/transactions/:tx/flow-files",
                post(receive_flow_files),
            )
            .route(
                "/nifi-api/data-transfer/input-ports/:port/transactions/:tx",
                put(extend_transaction).delete(end_transaction),
            )
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        MockCluster { addr, state }
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}/nifi-api", self.addr)
    }
}

async fn peers(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(json!([{
        "hostname": state.addr.ip().to_string(),
        "port": state.addr.port(),
        "secure": false,
        "flowFileCount": state.flow_file_count.load(Ordering::SeqCst),
    }]))
}

async fn create_transaction(
    State(state): State<Arc<MockState>>,
    Path(port): Path<String>,
) -> impl IntoResponse {
    if state.fail_create.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new()).into_response();
    }

    let transaction_id = state.next_transaction.fetch_add(1, Ordering::SeqCst);
    state.transactions_created.fetch_add(1, Ordering::SeqCst);

    let mut headers = HeaderMap::new();
    headers.insert(
        protocol::LOCATION_HEADER,
        format!(
            "http://{}/nifi-api/data-transfer/input-ports/{}/transactions/{}",
            state.addr, port, transaction_id
        )
        .parse()
        .unwrap(),
    );
    if !state.omit_intent.load(Ordering::SeqCst) {
        headers.insert(
            protocol::LOCATION_URI_INTENT_HEADER,
            protocol::LOCATION_URI_INTENT_TRANSACTION_URL.parse().unwrap(),
        );
    }
    if !state.omit_ttl.load(Ordering::SeqCst) {
        headers.insert(
            protocol::SERVER_TRANSACTION_TTL_HEADER,
            state
                .ttl_seconds
                .load(Ordering::SeqCst)
                .to_string()
                .parse()
                .unwrap(),
        );
    }

    (StatusCode::CREATED, headers).into_response()
}

async fn receive_flow_files(
    State(state): State<Arc<MockState>>,
    Path((_port, transaction_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let compressed = headers
        .get(protocol::HANDSHAKE_USE_COMPRESSION)
        .and_then(|value| value.to_str().ok())
        == Some("true");

    let data = if compressed {
        inflate(&body)
    } else {
        body.to_vec()
    };

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data);
    let mut crc = u64::from(hasher.finalize());
    if state.wrong_crc.load(Ordering::SeqCst) {
        crc = crc.wrapping_add(1);
    }

    state
        .received
        .lock()
        .unwrap()
        .push((transaction_id, decode_packets(&data)));

    (StatusCode::OK, crc.to_string())
}

async fn extend_transaction(
    State(state): State<Arc<MockState>>,
    Path((_port, transaction_id)): Path<(String, String)>,
) -> impl IntoResponse {
    state.heartbeats.lock().unwrap().push(transaction_id);
    StatusCode::OK
}

async fn end_transaction(
    State(state): State<Arc<MockState>>,
    Path((_port, transaction_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let code: u8 = query
        .get("responseCode")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    let (flow_files_sent, bytes_sent) = {
        let received = state.received.lock().unwrap();
        received
            .iter()
            .filter(|(tx, _)| *tx == transaction_id)
            .flat_map(|(_, packets)| packets.iter())
            .fold((0u64, 0u64), |(count, bytes), (_, payload)| {
                (count + 1, bytes + payload.len() as u64)
            })
    };

    state
        .deletes
        .lock()
        .unwrap()
        .push((transaction_id, code));

    Json(json!({
        "responseCode": code,
        "message": "ok",
        "flowFilesSent": flow_files_sent,
        "bytesSent": bytes_sent,
        "duration": 1,
    }))
}
