//! Call client
//!
//! The owned context a front-end holds for one signed-in user. It wires the
//! signaling transport, the presence registry and the call session manager
//! together and runs them on a single event loop, so transport events, peer
//! events and local commands are applied one at a time.

use crate::call::{
    CallError, CallEvent, CallSessionManager, CallState, MediaDevices, PeerConnector, PeerEvent,
};
use crate::config::{ClientConfig, ConfigError};
use crate::presence::{PresenceRegistry, PresenceSnapshot};
use crate::signaling::{
    ServerMessage, SignalingError, SignalingHandle, SignalingTransport, TransportEvent,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Event stream already taken")]
    EventsTaken,
}

// ============================================================================
// CLIENT EVENTS
// ============================================================================

/// Everything a UI needs to react to
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ConnectionFailed { attempts: u32 },
    PresenceChanged(Arc<PresenceSnapshot>),
    Call(CallEvent),
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate {
        targets: Vec<String>,
        reply: Reply<String>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// ============================================================================
// CALL CLIENT
// ============================================================================

pub struct CallClient {
    commands: mpsc::UnboundedSender<Command>,
    presence: Arc<PresenceRegistry>,
    call_state: watch::Receiver<CallState>,
    signaling: SignalingHandle,
    driver: Option<JoinHandle<()>>,
}

impl CallClient {
    /// Opens the signaling connection, registers and starts the event loop
    pub async fn connect(
        config: ClientConfig,
        media: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        config.validate()?;
        let identity = config.identity.clone();

        let mut transport = SignalingTransport::new(config);
        let transport_events = transport.take_events().ok_or(ClientError::EventsTaken)?;
        transport.open().await?;
        let signaling = transport.handle();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let manager = CallSessionManager::new(
            identity,
            Arc::new(signaling.clone()),
            media,
            connector,
            peer_tx,
            call_tx,
        );
        let call_state = manager.watch_state();
        let presence = Arc::new(PresenceRegistry::new());

        let driver = Driver {
            transport,
            manager,
            presence: Arc::clone(&presence),
            events: event_tx,
        };
        let driver = tokio::spawn(driver.run(command_rx, transport_events, peer_rx, call_rx));

        tracing::info!("Call client started");

        Ok((
            Self {
                commands: command_tx,
                presence,
                call_state,
                signaling,
                driver: Some(driver),
            },
            event_rx,
        ))
    }

    /// Calls one or more users and returns the new call id
    pub async fn initiate_call(&self, targets: Vec<String>) -> Result<String, CallError> {
        self.request(|reply| Command::Initiate { targets, reply })
            .await
    }

    /// Answers the ringing call
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Declines the ringing call
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hangs up, or cancels an outbound call that is still ringing
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Current call state
    pub fn call_state(&self) -> CallState {
        *self.call_state.borrow()
    }

    /// Receiver that observes every call state change
    pub fn watch_call_state(&self) -> watch::Receiver<CallState> {
        self.call_state.clone()
    }

    /// Whether the signaling socket is up and registered
    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Latest presence snapshot
    pub fn presence(&self) -> Arc<PresenceSnapshot> {
        self.presence.snapshot()
    }

    pub fn departments(&self) -> BTreeSet<String> {
        self.presence.departments()
    }

    pub fn users_in_department(&self, department: &str) -> Vec<String> {
        self.presence.users_in_department(department)
    }

    /// Ends any active call, closes the transport and stops the event loop
    pub async fn close(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = driver.await {
            tracing::warn!("Call client event loop ended abnormally: {}", e);
        }
        tracing::info!("Call client closed");
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| CallError::Shutdown)?;
        reply_rx.await.map_err(|_| CallError::Shutdown)?
    }
}

impl std::fmt::Debug for CallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallClient")
            .field("call_state", &self.call_state())
            .field("is_connected", &self.is_connected())
            .field("online_users", &self.presence.snapshot().len())
            .finish()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

struct Driver {
    transport: SignalingTransport,
    manager: CallSessionManager,
    presence: Arc<PresenceRegistry>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut call_events: mpsc::UnboundedReceiver<CallEvent>,
    ) {
        let mut done = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done: tx }) => {
                        done = Some(tx);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                Some(event) = peer_events.recv() => {
                    self.manager.handle_peer_event(event).await;
                }
                Some(event) = call_events.recv() => {
                    self.emit(ClientEvent::Call(event));
                }
            }
        }

        self.manager.shutdown().await;
        self.transport.close().await;
        while let Ok(event) = call_events.try_recv() {
            self.emit(ClientEvent::Call(event));
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
        tracing::debug!("Call client event loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate { targets, reply } => {
                let _ = reply.send(self.manager.initiate_call(targets).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.manager.accept_call().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.manager.reject_call().await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.manager.end_call().await);
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.emit(ClientEvent::Connected),
            TransportEvent::Message(ServerMessage::OnlineUsers(users)) => {
                let snapshot = self.presence.apply_snapshot(users);
                self.emit(ClientEvent::PresenceChanged(snapshot));
            }
            TransportEvent::Message(message) => {
                tracing::debug!("Received {} message", message.kind());
                self.manager.handle_server_message(message).await;
            }
            TransportEvent::Disconnected => {
                self.manager.handle_transport_lost().await;
                let snapshot = self.presence.clear();
                self.emit(ClientEvent::Disconnected);
                self.emit(ClientEvent::PresenceChanged(snapshot));
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.emit(ClientEvent::Reconnecting { attempt, delay });
            }
            TransportEvent::ConnectionFailed { attempts } => {
                self.emit(ClientEvent::ConnectionFailed { attempts });
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
