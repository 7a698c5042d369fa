use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use tsbridge_codec::error::CodecError;
use tsbridge_codec::frame::{decode_frame, encode_frame, RelayFrame, RELAY_PROTOCOL_VERSION};
use tsbridge_core::error::CoreError;
use tsbridge_core::ident::{validate_topic, validate_topic_filter};
use tsbridge_transport::adapter::{
    ConnectOptions, DeliveryToken, DisconnectReason, PubSubTransport, Qos, TransportCallbacks,
};

#[derive(Debug, Clone)]
pub struct WebSocketTransportConfig {
    pub outbound_queue_capacity: usize,
    /// Bound on subscribe confirmation waits.
    pub request_timeout: Duration,
    pub max_payload_hint: Option<usize>,
}

impl Default for WebSocketTransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 1024,
            request_timeout: Duration::from_secs(5),
            max_payload_hint: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebSocketTransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("connection worker is closed")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("payload exceeds max payload hint ({hint} bytes)")]
    PayloadTooLarge { hint: usize },
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connection refused by relay: {0}")]
    Refused(String),
    #[error("subscribe rejected by relay: {0}")]
    SubscribeRejected(String),
    #[error("timed out waiting for relay")]
    Timeout,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Topic(#[from] CoreError),
}

enum Command {
    Publish(Vec<u8>),
    Subscribe {
        frame: Vec<u8>,
        reply: mpsc::SyncSender<Result<(), String>>,
    },
    Disconnect {
        frame: Vec<u8>,
        done: mpsc::SyncSender<()>,
    },
}

enum CallbackEvent {
    Delivered(DeliveryToken),
    Arrived(String, Bytes),
    Lost(String),
    Disconnected(DisconnectReason),
}

struct Session {
    commands: tokio_mpsc::Sender<Command>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

/// Pub/sub transport speaking relay frames over one WebSocket connection.
///
/// Socket I/O runs on a worker thread with its own tokio runtime. Callbacks
/// run on a separate dispatcher thread so a slow handler never stalls frame
/// processing (including the confirmations `subscribe` waits for).
pub struct WebSocketTransport {
    config: WebSocketTransportConfig,
    session: Option<Session>,
    connected: Arc<AtomicBool>,
    next_token: DeliveryToken,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketTransportConfig) -> Self {
        Self {
            config,
            session: None,
            connected: Arc::new(AtomicBool::new(false)),
            next_token: 1,
        }
    }

    fn commands(&self) -> Result<&tokio_mpsc::Sender<Command>, WebSocketTransportError> {
        match &self.session {
            Some(session) if self.connected.load(Ordering::Relaxed) => Ok(&session.commands),
            _ => Err(WebSocketTransportError::NotConnected),
        }
    }

    fn enqueue(&self, command: Command) -> Result<(), WebSocketTransportError> {
        self.commands()?
            .try_send(command)
            .map_err(|err| match err {
                tokio_mpsc::error::TrySendError::Full(_) => WebSocketTransportError::QueueFull,
                tokio_mpsc::error::TrySendError::Closed(_) => WebSocketTransportError::Closed,
            })
    }

    fn stop_worker(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Some(tx) = session.shutdown_tx.take() {
                let _ = tx.send(());
            }
            if let Some(worker) = session.worker.take() {
                let _ = worker.join();
            }
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(WebSocketTransportConfig::default())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl PubSubTransport for WebSocketTransport {
    type Error = WebSocketTransportError;

    fn connect(
        &mut self,
        options: &ConnectOptions,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Result<(), Self::Error> {
        if self.session.is_some() {
            if self.connected.load(Ordering::Relaxed) {
                return Err(WebSocketTransportError::AlreadyConnected);
            }
            self.stop_worker();
        }
        let connect_frame = encode_frame(&RelayFrame::Connect {
            version: RELAY_PROTOCOL_VERSION,
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive_secs: u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX),
        })?;

        let (command_tx, command_rx) =
            tokio_mpsc::channel::<Command>(self.config.outbound_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (startup_tx, startup_rx) = mpsc::sync_channel::<Result<(), WebSocketTransportError>>(1);
        let (event_tx, event_rx) = mpsc::channel::<CallbackEvent>();

        thread::spawn(move || dispatch_callbacks(event_rx, callbacks));

        let worker = WorkerContext {
            url: options.broker.clone(),
            client_id: options.client_id.clone(),
            connect_timeout: options.connect_timeout,
            connected: Arc::clone(&self.connected),
            events: event_tx,
        };
        let handle = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = startup_tx.send(Err(WebSocketTransportError::ConnectFailed(
                        format!("failed to build tokio runtime: {err}"),
                    )));
                    return;
                }
            };
            runtime.block_on(run_client_worker(
                worker,
                connect_frame,
                command_rx,
                shutdown_rx,
                startup_tx,
            ));
        });

        self.session = Some(Session {
            commands: command_tx,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(handle),
        });

        let wait = options.connect_timeout + Duration::from_millis(250);
        let outcome = match startup_rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WebSocketTransportError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WebSocketTransportError::Closed),
        };
        if outcome.is_err() {
            self.stop_worker();
        }
        outcome
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        retained: bool,
    ) -> Result<DeliveryToken, Self::Error> {
        validate_topic(topic)?;
        if let Some(hint) = self.config.max_payload_hint {
            if payload.len() > hint {
                return Err(WebSocketTransportError::PayloadTooLarge { hint });
            }
        }
        let token = self.next_token;
        let frame = encode_frame(&RelayFrame::Publish {
            token,
            topic: topic.to_string(),
            qos: qos.as_u8(),
            retained,
            payload: payload.to_vec(),
        })?;
        self.enqueue(Command::Publish(frame))?;
        self.next_token += 1;
        Ok(token)
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), Self::Error> {
        validate_topic_filter(topic)?;
        let frame = encode_frame(&RelayFrame::Subscribe {
            topic: topic.to_string(),
            qos: qos.as_u8(),
        })?;
        let (reply, confirmation) = mpsc::sync_channel(1);
        self.enqueue(Command::Subscribe { frame, reply })?;
        match confirmation.recv_timeout(self.config.request_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(WebSocketTransportError::SubscribeRejected(reason)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WebSocketTransportError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WebSocketTransportError::Closed),
        }
    }

    fn disconnect(&mut self, timeout: Duration) -> Result<(), Self::Error> {
        let frame = encode_frame(&RelayFrame::Disconnect {
            reason_code: DisconnectReason::Requested.code(),
        })?;
        let (done, finished) = mpsc::sync_channel(1);
        let queued = self.enqueue(Command::Disconnect { frame, done });
        let outcome = match queued {
            Ok(()) => finished
                .recv_timeout(timeout)
                .map_err(|_| WebSocketTransportError::Timeout),
            Err(err) => Err(err),
        };
        self.stop_worker();
        outcome
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn dispatch_callbacks(
    events: mpsc::Receiver<CallbackEvent>,
    callbacks: Arc<dyn TransportCallbacks>,
) {
    for event in events {
        match event {
            CallbackEvent::Delivered(token) => callbacks.on_delivered(token),
            CallbackEvent::Arrived(topic, payload) => {
                if !callbacks.on_message_arrived(&topic, payload) {
                    debug!(%topic, "message left unhandled");
                }
            }
            CallbackEvent::Lost(cause) => callbacks.on_connection_lost(&cause),
            CallbackEvent::Disconnected(reason) => callbacks.on_disconnected(reason),
        }
    }
}

struct WorkerContext {
    url: String,
    client_id: String,
    connect_timeout: Duration,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<CallbackEvent>,
}

impl WorkerContext {
    fn emit(&self, event: CallbackEvent) {
        let _ = self.events.send(event);
    }

    fn lost(&self, cause: String) {
        self.connected.store(false, Ordering::Relaxed);
        warn!(client_id = %self.client_id, %cause, "relay connection lost");
        self.emit(CallbackEvent::Lost(cause));
    }
}

async fn run_client_worker(
    ctx: WorkerContext,
    connect_frame: Vec<u8>,
    mut commands: tokio_mpsc::Receiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
    startup_tx: mpsc::SyncSender<Result<(), WebSocketTransportError>>,
) {
    let stream = match tokio::time::timeout(ctx.connect_timeout, connect_async(&ctx.url)).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(err)) => {
            let _ = startup_tx.send(Err(WebSocketTransportError::ConnectFailed(err.to_string())));
            return;
        }
        Err(_) => {
            let _ = startup_tx.send(Err(WebSocketTransportError::Timeout));
            return;
        }
    };
    let (mut write, mut read) = stream.split();

    if let Err(err) = write.send(Message::Binary(connect_frame)).await {
        let _ = startup_tx.send(Err(WebSocketTransportError::ConnectFailed(err.to_string())));
        return;
    }
    let handshake = tokio::time::timeout(ctx.connect_timeout, async {
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    return decode_frame(&bytes).map_err(|err| err.to_string())
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err("closed during handshake".to_string())
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.to_string()),
            }
        }
    })
    .await;
    match handshake {
        Ok(Ok(RelayFrame::ConnAck { .. })) => {
            ctx.connected.store(true, Ordering::Relaxed);
            info!(client_id = %ctx.client_id, url = %ctx.url, "connected to relay");
            let _ = startup_tx.send(Ok(()));
        }
        Ok(Ok(RelayFrame::Refused { reason })) => {
            let _ = startup_tx.send(Err(WebSocketTransportError::Refused(reason)));
            return;
        }
        Ok(Ok(_)) => {
            let _ = startup_tx.send(Err(WebSocketTransportError::ConnectFailed(
                "unexpected frame during handshake".to_string(),
            )));
            return;
        }
        Ok(Err(err)) => {
            let _ = startup_tx.send(Err(WebSocketTransportError::ConnectFailed(err)));
            return;
        }
        Err(_) => {
            let _ = startup_tx.send(Err(WebSocketTransportError::Timeout));
            return;
        }
    }

    let mut pending_subscribes: VecDeque<mpsc::SyncSender<Result<(), String>>> = VecDeque::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                ctx.connected.store(false, Ordering::Relaxed);
                let _ = write.close().await;
                return;
            }
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(Command::Publish(frame)) => {
                        if let Err(err) = write.send(Message::Binary(frame)).await {
                            ctx.lost(format!("write failed: {err}"));
                            return;
                        }
                    }
                    Some(Command::Subscribe { frame, reply }) => {
                        if let Err(err) = write.send(Message::Binary(frame)).await {
                            let _ = reply.send(Err(err.to_string()));
                            ctx.lost(format!("write failed: {err}"));
                            return;
                        }
                        pending_subscribes.push_back(reply);
                    }
                    Some(Command::Disconnect { frame, done }) => {
                        ctx.connected.store(false, Ordering::Relaxed);
                        let _ = write.send(Message::Binary(frame)).await;
                        let _ = write.close().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        ctx.connected.store(false, Ordering::Relaxed);
                        let _ = write.close().await;
                        return;
                    }
                }
            }
            maybe_in = read.next() => {
                match maybe_in {
                    Some(Ok(Message::Binary(bytes))) => {
                        let frame = match decode_frame(&bytes) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(
                                    client_id = %ctx.client_id,
                                    "dropping undecodable relay frame: {err}"
                                );
                                continue;
                            }
                        };
                        match frame {
                            RelayFrame::PubAck { token } => {
                                ctx.emit(CallbackEvent::Delivered(token));
                            }
                            RelayFrame::Deliver { topic, payload, .. } => {
                                ctx.emit(CallbackEvent::Arrived(topic, Bytes::from(payload)));
                            }
                            RelayFrame::SubAck { .. } => {
                                if let Some(reply) = pending_subscribes.pop_front() {
                                    let _ = reply.send(Ok(()));
                                }
                            }
                            RelayFrame::Disconnect { reason_code } => {
                                ctx.connected.store(false, Ordering::Relaxed);
                                let reason = DisconnectReason::from_code(reason_code);
                                ctx.emit(CallbackEvent::Disconnected(reason));
                                let _ = write.close().await;
                                return;
                            }
                            other => {
                                debug!(
                                    client_id = %ctx.client_id,
                                    ?other,
                                    "ignoring unexpected relay frame"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        ctx.lost("relay closed the connection".to_string());
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        ctx.lost(format!("read failed: {err}"));
                        return;
                    }
                }
            }
        }
    }
}
