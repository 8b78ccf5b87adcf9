//! WebSocket transport to the signaling server
//!
//! Owns the single long-lived connection of a client session:
//! - explicit `open` / `close` lifecycle
//! - `register` after every successful connect
//! - bounded fixed-delay reconnection
//! - one typed event stream for everything the server pushes

use super::messages::*;
use crate::config::{ClientConfig, ReconnectPolicy};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Upper bound for a single connect + handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling request: {0}")]
    InvalidRequest(String),

    #[error("Transport already opened")]
    AlreadyOpen,

    #[error("Transport has been closed")]
    Closed,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Everything the transport reports to its single consumer
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connected and `register` sent
    Connected,

    /// A decoded server push
    Message(ServerMessage),

    /// Connection lost (a reconnect may follow)
    Disconnected,

    /// Waiting `delay` before reconnect attempt `attempt`
    Reconnecting { attempt: u32, delay: Duration },

    /// Reconnect budget exhausted, the transport gave up
    ConnectionFailed { attempts: u32 },
}

// ============================================================================
// SEND SIDE
// ============================================================================

/// Anything that can put a client message on the wire
pub trait SignalingSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError>;
}

#[derive(Debug, Default)]
struct TransportState {
    is_connected: bool,
    is_closed: bool,
}

/// Cloneable, non-blocking send handle for a [`SignalingTransport`]
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state: Arc<RwLock<TransportState>>,
}

impl SignalingHandle {
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl SignalingSink for SignalingHandle {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        tracing::debug!("Queueing {} message", message.kind());
        self.outbound
            .send(message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingHandle")
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// SIGNALING TRANSPORT
// ============================================================================

/// Owned connection to the signaling server
pub struct SignalingTransport {
    config: ClientConfig,
    state: Arc<RwLock<TransportState>>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    outbound_rx: Option<mpsc::UnboundedReceiver<ClientMessage>>,
    event_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SignalingTransport {
    pub fn new(config: ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            state: Arc::new(RwLock::new(TransportState::default())),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            event_tx: Some(event_tx),
            event_rx: Some(event_rx),
            shutdown: None,
            supervisor: None,
        }
    }

    /// The event stream; can be taken exactly once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn handle(&self) -> SignalingHandle {
        SignalingHandle {
            outbound: self.outbound_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Connects (retrying per the reconnect policy) and keeps the connection
    /// alive until [`close`](Self::close)
    ///
    /// Resolves once the first connection is up, or with
    /// `ConnectionFailed` when the retry budget ran out first.
    pub async fn open(&mut self) -> Result<(), SignalingError> {
        if self.state.read().is_closed {
            return Err(SignalingError::Closed);
        }
        if self.supervisor.is_some() {
            return Err(SignalingError::AlreadyOpen);
        }

        let url = self
            .config
            .ws_url()
            .map_err(|e| SignalingError::InvalidRequest(e.to_string()))?
            .to_string();
        build_request(&url, self.config.auth_token.as_deref())?;
        let (Some(outbound), Some(events)) = (self.outbound_rx.take(), self.event_tx.take())
        else {
            return Err(SignalingError::AlreadyOpen);
        };

        let register = ClientMessage::Register(RegisterPayload {
            user_id: self.config.identity.user_id.clone(),
            department: self.config.identity.department.clone(),
            role: self.config.identity.role.clone(),
            name: self.config.identity.display_name.clone(),
        });
        let register = serde_json::to_string(&register)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        tracing::info!("Connecting to signaling server: {}", url);

        let supervisor = Supervisor {
            url,
            auth_token: self.config.auth_token.clone(),
            register,
            policy: self.config.reconnect,
            state: Arc::clone(&self.state),
            events,
        };
        self.supervisor = Some(tokio::spawn(supervisor.run(
            outbound,
            shutdown_rx,
            ready_tx,
        )));
        self.shutdown = Some(shutdown_tx);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Closed),
        }
    }

    /// Stops reconnecting, closes the socket and waits for the supervisor
    pub async fn close(&mut self) {
        self.state.write().is_closed = true;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.supervisor.take() {
            if let Err(e) = task.await {
                tracing::warn!("Signaling supervisor ended abnormally: {}", e);
            }
        }
        self.state.write().is_connected = false;
        tracing::info!("Signaling transport closed");
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SignalingTransport")
            .field("server_url", &self.config.server_url)
            .field("is_connected", &state.is_connected)
            .field("is_closed", &state.is_closed)
            .finish()
    }
}

/// Upgrade request with the optional bearer token
fn build_request(url: &str, auth_token: Option<&str>) -> Result<Request<()>, SignalingError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| SignalingError::InvalidRequest(e.to_string()))?;

    if let Some(token) = auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SignalingError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

// ============================================================================
// SUPERVISOR TASK
// ============================================================================

/// How a single connection ended
///
/// `answered` is set once `register` was written and the server sent at
/// least one frame back. Only such a connection resets the reconnect budget.
#[derive(Debug, PartialEq, Eq)]
enum ConnectionEnd {
    Dropped { answered: bool },
    Shutdown,
}

struct Supervisor {
    url: String,
    auth_token: Option<String>,
    register: String,
    policy: ReconnectPolicy,
    state: Arc<RwLock<TransportState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Supervisor {
    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
        mut shutdown: watch::Receiver<bool>,
        ready: oneshot::Sender<Result<(), SignalingError>>,
    ) {
        let mut ready = Some(ready);
        let mut failures = 0u32;
        let mut last_error = String::from("no connection attempt made");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(ws) => {
                    let end = self
                        .run_connection(ws, &mut outbound, &mut shutdown, &mut ready)
                        .await;
                    self.state.write().is_connected = false;
                    let _ = self.events.send(TransportEvent::Disconnected);
                    match end {
                        ConnectionEnd::Shutdown => break,
                        ConnectionEnd::Dropped { answered: true } => failures = 0,
                        ConnectionEnd::Dropped { answered: false } => {
                            last_error =
                                "connection closed before the server answered".to_string();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Signaling connect failed: {}", e);
                    last_error = e.to_string();
                }
            }

            failures += 1;
            match self.policy.delay_for(failures) {
                Some(delay) => {
                    tracing::info!(
                        "Will attempt to reconnect in {:?} (attempt {}/{})",
                        delay,
                        failures,
                        self.policy.max_attempts
                    );
                    let _ = self.events.send(TransportEvent::Reconnecting {
                        attempt: failures,
                        delay,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    let attempts = failures - 1;
                    tracing::error!(
                        "Giving up on signaling server after {} reconnect attempt(s)",
                        attempts
                    );
                    let _ = self
                        .events
                        .send(TransportEvent::ConnectionFailed { attempts });
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(SignalingError::ConnectionFailed(last_error)));
                    }
                    break;
                }
            }
        }

        self.state.write().is_connected = false;
        if let Some(ready) = ready.take() {
            let _ = ready.send(Err(SignalingError::Closed));
        }
        tracing::debug!("Signaling supervisor stopped");
    }

    async fn connect(&self) -> Result<WsStream, SignalingError> {
        let request = build_request(&self.url, self.auth_token.as_deref())?;
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request));
        match attempt.await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(SignalingError::ConnectionFailed(e.to_string())),
            Err(_) => Err(SignalingError::ConnectionFailed("Timeout".to_string())),
        }
    }

    async fn run_connection(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
        shutdown: &mut watch::Receiver<bool>,
        ready: &mut Option<oneshot::Sender<Result<(), SignalingError>>>,
    ) -> ConnectionEnd {
        let (mut write, mut read) = ws.split();

        // Anything still queued was addressed to the previous connection
        let mut stale = 0usize;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!("Dropped {} stale outbound message(s)", stale);
        }

        if let Err(e) = write.send(Message::Text(self.register.clone())).await {
            tracing::error!("Failed to send register: {}", e);
            return ConnectionEnd::Dropped { answered: false };
        }

        self.state.write().is_connected = true;
        tracing::info!("Connected to signaling server");
        let _ = self.events.send(TransportEvent::Connected);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let mut answered = false;

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        answered = true;
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                tracing::debug!("Received {} message", msg.kind());
                                let _ = self.events.send(TransportEvent::Message(msg));
                            }
                            Err(e) => tracing::warn!("Ignoring undecodable frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket closed by server");
                        return ConnectionEnd::Dropped { answered };
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        return ConnectionEnd::Dropped { answered };
                    }
                    Some(Ok(_)) => answered = true,
                },
                msg = outbound.recv() => {
                    let Some(msg) = msg else {
                        return ConnectionEnd::Shutdown;
                    };
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("Failed to encode {} message: {}", msg.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        return ConnectionEnd::Dropped { answered };
                    }
                },
                _ = shutdown.changed() => {
                    // Flush what was queued before close (e.g. a final end-call)
                    while let Ok(msg) = outbound.try_recv() {
                        if let Ok(text) = serde_json::to_string(&msg) {
                            let _ = write.send(Message::Text(text)).await;
                        }
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
