use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use tsbridge_codec::frame::{
    decode_frame, encode_frame, RelayFrame, REASON_PROTOCOL_ERROR, REASON_SERVER_SHUTTING_DOWN,
    REASON_SESSION_TAKEN_OVER,
};
use tsbridge_core::ident::topic_matches;

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind_addr: String,
    /// Frames buffered per client before deliveries to it are dropped.
    pub client_queue_capacity: usize,
    /// How long shutdown waits for sessions to flush their final frame.
    pub drain_timeout: Duration,
}

impl RelayServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            client_queue_capacity: 1024,
            drain_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("bind failed: {0}")]
    BindFailed(String),
    #[error("relay worker is closed")]
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sessions_accepted: u64,
    pub sessions_refused: u64,
    pub sessions_taken_over: u64,
    pub publishes_routed: u64,
    pub deliveries_sent: u64,
    pub deliveries_dropped: u64,
}

#[derive(Debug, Default)]
struct RelayStatsInner {
    sessions_accepted: AtomicU64,
    sessions_refused: AtomicU64,
    sessions_taken_over: AtomicU64,
    publishes_routed: AtomicU64,
    deliveries_sent: AtomicU64,
    deliveries_dropped: AtomicU64,
}

enum Outbound {
    Frame(Vec<u8>),
    Kick(u8),
}

struct SessionEntry {
    session_id: u64,
    tx: tokio_mpsc::Sender<Outbound>,
    filters: Vec<String>,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<String, SessionEntry>,
    retained: HashMap<String, Vec<u8>>,
}

struct Shared {
    state: Mutex<RelayState>,
    stats: RelayStatsInner,
    next_session: AtomicU64,
    client_queue_capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Topic-routing relay for [`crate::WebSocketTransport`] clients.
///
/// One live session per client id: a second `Connect` with the same id
/// disconnects the first with `REASON_SESSION_TAKEN_OVER`. Retained messages
/// are replayed after the `SubAck` of a matching subscription.
pub struct RelayServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn listen(config: RelayServerConfig) -> Result<Self, RelayServerError> {
        let (startup_tx, startup_rx) = mpsc::sync_channel::<Result<SocketAddr, String>>(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shared = Arc::new(Shared {
            state: Mutex::new(RelayState::default()),
            stats: RelayStatsInner::default(),
            next_session: AtomicU64::new(1),
            client_queue_capacity: config.client_queue_capacity.max(1),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(_) => {
                    let _ = startup_tx.send(Err("failed to build tokio runtime".to_string()));
                    return;
                }
            };
            runtime.block_on(run_relay_worker(config, worker_shared, shutdown_rx, startup_tx));
        });

        let local_addr = match startup_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(addr)) => addr,
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(RelayServerError::BindFailed(err));
            }
            Err(_) => return Err(RelayServerError::Closed),
        };

        Ok(Self {
            local_addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn stats_snapshot(&self) -> RelayStats {
        let s = &self.shared.stats;
        RelayStats {
            sessions_accepted: s.sessions_accepted.load(Ordering::Relaxed),
            sessions_refused: s.sessions_refused.load(Ordering::Relaxed),
            sessions_taken_over: s.sessions_taken_over.load(Ordering::Relaxed),
            publishes_routed: s.publishes_routed.load(Ordering::Relaxed),
            deliveries_sent: s.deliveries_sent.load(Ordering::Relaxed),
            deliveries_dropped: s.deliveries_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    /// Stops accepting, disconnects every session and joins the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_relay_worker(
    config: RelayServerConfig,
    shared: Arc<Shared>,
    mut shutdown_rx: oneshot::Receiver<()>,
    startup_tx: mpsc::SyncSender<Result<SocketAddr, String>>,
) {
    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(err) => {
            error!("relay bind failed on {}: {}", config.bind_addr, err);
            let _ = startup_tx.send(Err(err.to_string()));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            let _ = startup_tx.send(Err(err.to_string()));
            return;
        }
    };
    info!(%local_addr, "relay listening");
    let _ = startup_tx.send(Ok(local_addr));

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe_conn = listener.accept() => {
                match maybe_conn {
                    Ok((stream, addr)) => {
                        let shared = Arc::clone(&shared);
                        connections.spawn(async move {
                            if let Err(err) = serve_connection(stream, shared).await {
                                debug!(%addr, "relay connection ended: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("relay accept failed: {err}"),
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let sessions: Vec<tokio_mpsc::Sender<Outbound>> = shared
        .lock()
        .sessions
        .values()
        .map(|entry| entry.tx.clone())
        .collect();
    info!(sessions = sessions.len(), "relay shutting down");
    for tx in sessions {
        let _ = tx.try_send(Outbound::Kick(REASON_SERVER_SHUTTING_DOWN));
    }
    let drained = tokio::time::timeout(config.drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        connections.abort_all();
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_frame(write: &mut WsSink, frame: &RelayFrame) -> Result<(), String> {
    let bytes = encode_frame(frame).map_err(|err| err.to_string())?;
    write
        .send(Message::Binary(bytes))
        .await
        .map_err(|err| err.to_string())
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|err| format!("handshake failed: {err}"))?;
    let (mut write, mut read) = ws_stream.split();

    let first = loop {
        match read.next().await {
            Some(Ok(Message::Binary(bytes))) => break decode_frame(&bytes),
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.to_string()),
        }
    };
    let client_id = match first {
        Ok(RelayFrame::Connect { client_id, .. }) => client_id,
        Ok(_) => {
            return refuse(&mut write, &shared, "first frame must be Connect".to_string()).await;
        }
        Err(err) => return refuse(&mut write, &shared, err.to_string()).await,
    };

    let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = tokio_mpsc::channel::<Outbound>(shared.client_queue_capacity);
    {
        let mut state = shared.lock();
        let previous = state.sessions.insert(
            client_id.clone(),
            SessionEntry {
                session_id,
                tx,
                filters: Vec::new(),
            },
        );
        if let Some(old) = previous {
            warn!(%client_id, "client id reused; taking over previous session");
            shared.stats.sessions_taken_over.fetch_add(1, Ordering::Relaxed);
            let _ = old.tx.try_send(Outbound::Kick(REASON_SESSION_TAKEN_OVER));
        }
    }
    shared.stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    info!(%client_id, session_id, "relay session opened");

    let result = run_session(&mut write, &mut read, &mut rx, &shared, &client_id, session_id).await;

    {
        let mut state = shared.lock();
        if state
            .sessions
            .get(&client_id)
            .is_some_and(|entry| entry.session_id == session_id)
        {
            state.sessions.remove(&client_id);
        }
    }
    let _ = write.close().await;
    info!(%client_id, session_id, "relay session closed");
    result
}

async fn refuse(write: &mut WsSink, shared: &Shared, reason: String) -> Result<(), String> {
    shared.stats.sessions_refused.fetch_add(1, Ordering::Relaxed);
    warn!(%reason, "refusing relay connection");
    let _ = send_frame(write, &RelayFrame::Refused { reason }).await;
    let _ = write.close().await;
    Ok(())
}

async fn run_session(
    write: &mut WsSink,
    read: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    rx: &mut tokio_mpsc::Receiver<Outbound>,
    shared: &Shared,
    client_id: &str,
    session_id: u64,
) -> Result<(), String> {
    send_frame(write, &RelayFrame::ConnAck { session_present: false }).await?;

    loop {
        tokio::select! {
            maybe_out = rx.recv() => {
                match maybe_out {
                    Some(Outbound::Frame(bytes)) => {
                        write.send(Message::Binary(bytes)).await.map_err(|err| err.to_string())?;
                    }
                    Some(Outbound::Kick(reason_code)) => {
                        debug!(%client_id, session_id, reason_code, "disconnecting session");
                        let _ = send_frame(write, &RelayFrame::Disconnect { reason_code }).await;
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
            maybe_in = read.next() => {
                let bytes = match maybe_in {
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err.to_string()),
                };
                let frame = match decode_frame(&bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%client_id, "protocol error: {err}");
                        protocol_error(write).await;
                        return Err(err.to_string());
                    }
                };
                match frame {
                    RelayFrame::Subscribe { topic, qos } => {
                        let retained = subscribe(shared, client_id, session_id, &topic);
                        send_frame(write, &RelayFrame::SubAck { topic, granted_qos: qos }).await?;
                        for (topic, payload) in retained {
                            let replay = RelayFrame::Deliver { topic, retained: true, payload };
                            send_frame(write, &replay).await?;
                            shared.stats.deliveries_sent.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    RelayFrame::Publish { token, topic, retained, payload, .. } => {
                        route_publish(shared, topic, retained, payload)?;
                        send_frame(write, &RelayFrame::PubAck { token }).await?;
                    }
                    RelayFrame::Disconnect { .. } => return Ok(()),
                    other => {
                        warn!(%client_id, ?other, "unexpected frame from client");
                        protocol_error(write).await;
                        return Err("unexpected frame".to_string());
                    }
                }
            }
        }
    }
}

async fn protocol_error(write: &mut WsSink) {
    let frame = RelayFrame::Disconnect {
        reason_code: REASON_PROTOCOL_ERROR,
    };
    let _ = send_frame(write, &frame).await;
}

/// Records the filter and returns retained messages it matches.
fn subscribe(
    shared: &Shared,
    client_id: &str,
    session_id: u64,
    filter: &str,
) -> Vec<(String, Vec<u8>)> {
    let mut state = shared.lock();
    if let Some(entry) = state.sessions.get_mut(client_id) {
        if entry.session_id == session_id && !entry.filters.iter().any(|f| f == filter) {
            entry.filters.push(filter.to_string());
        }
    }
    let mut matches: Vec<(String, Vec<u8>)> = state
        .retained
        .iter()
        .filter(|(topic, _)| topic_matches(filter, topic))
        .map(|(topic, payload)| (topic.clone(), payload.clone()))
        .collect();
    matches.sort_by(|a, b| a.0.cmp(&b.0));
    matches
}

fn route_publish(
    shared: &Shared,
    topic: String,
    retained: bool,
    payload: Vec<u8>,
) -> Result<(), String> {
    let deliver = encode_frame(&RelayFrame::Deliver {
        topic: topic.clone(),
        retained: false,
        payload: payload.clone(),
    })
    .map_err(|err| err.to_string())?;

    let mut state = shared.lock();
    if retained {
        if payload.is_empty() {
            state.retained.remove(&topic);
        } else {
            state.retained.insert(topic.clone(), payload);
        }
    }
    for entry in state.sessions.values() {
        if !entry.filters.iter().any(|filter| topic_matches(filter, &topic)) {
            continue;
        }
        match entry.tx.try_send(Outbound::Frame(deliver.clone())) {
            Ok(()) => {
                shared.stats.deliveries_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                shared.stats.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    shared.stats.publishes_routed.fetch_add(1, Ordering::Relaxed);
    Ok(())
}
