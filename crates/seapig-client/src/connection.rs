//! Connection manager
//!
//! Keeps one transport connection to the Seapig server alive and feeds it
//! through a [`SeapigClient`]. Everything runs in a single task: transport
//! events, the liveness check, the reconnect delay and application commands
//! are multiplexed with `tokio::select!` and handled one at a time, so
//! document callbacks always run between complete messages.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::{ConnectionState, SeapigClient};
use crate::config::ClientConfig;
use crate::document::{ChangeListener, ProduceHook};
use crate::error::{SyncError, SyncResult};
use crate::message::Version;

/// Events buffered for the application before new ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived
    Message(String),
    /// A keepalive frame arrived
    Ping,
    /// The remote end closed the connection
    Closed { code: Option<u16>, reason: String },
    /// The connection failed
    Error(String),
}

/// An open duplex, message-oriented connection
pub trait Transport: Send {
    /// Send one text frame
    fn send(&mut self, frame: String) -> impl Future<Output = SyncResult<()>> + Send;

    /// Wait for the next event; must be cancel safe
    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Close the connection without reporting further events
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports to a server URL
pub trait Connector: Send + Sync {
    type Transport: Transport;

    fn connect(&self, url: &str) -> impl Future<Output = SyncResult<Self::Transport>> + Send;
}

/// WebSocket stream used by [`WebSocketTransport`]
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over a tokio-tungstenite WebSocket
pub struct WebSocketTransport {
    stream: WsStream,
}

impl WebSocketTransport {
    /// Take ownership of the underlying WebSocket stream
    pub fn into_inner(self) -> WsStream {
        self.stream
    }
}

impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> SyncResult<()> {
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    return TransportEvent::Ping
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => TransportEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => TransportEvent::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return TransportEvent::Error(e.to_string()),
                None => {
                    return TransportEvent::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error closing WebSocket: {}", e);
        }
    }
}

/// Connects over WebSocket with `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self, url: &str) -> SyncResult<WebSocketTransport> {
        let (stream, _response) = connect_async(url).await?;
        Ok(WebSocketTransport { stream })
    }
}

/// Commands sent to the connection task
pub enum Command {
    /// Subscribe to an id or pattern
    Subscribe {
        pattern: String,
        listener: Option<ChangeListener>,
    },
    /// Register as producer for an id or pattern
    RegisterProducer {
        pattern: String,
        initial: Option<Value>,
        on_produce: Option<ProduceHook>,
    },
    /// Replace a producer's value and upload the change
    Publish {
        pattern: String,
        value: Value,
        version: Option<Version>,
    },
    /// Declare that a producer has no data
    Stall {
        pattern: String,
        version: Option<Version>,
    },
    /// Stop the task; `detach` hands the open transport back instead of closing it
    Disconnect { detach: bool },
}

/// Events emitted by the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection state changed
    StatusChanged(ConnectionState),
    /// The server skipped updates; the subscription is being resynced
    ConsistencyViolation {
        id: String,
        local: Version,
        received: Version,
    },
    /// A delta did not apply to the mirror; the subscription is being resynced
    PatchRejected { id: String, reason: String },
    /// Error occurred
    Error(String),
}

/// How the connection task ended
#[derive(Debug)]
pub enum Exit<T> {
    /// Transport closed (or none was open)
    Closed,
    /// Transport handed over to the caller, still open
    Detached(T),
}

/// Handle to control the connection task
pub struct ClientHandle {
    /// Send commands to the connection task
    pub command_tx: mpsc::Sender<Command>,
    /// Receive events from the connection task
    pub event_rx: mpsc::Receiver<ClientEvent>,
    /// Watch connection state
    pub status_rx: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    /// Get the current connection state
    pub fn status(&self) -> ConnectionState {
        *self.status_rx.borrow()
    }

    async fn command(&self, command: Command) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::Stopped)
    }

    pub async fn subscribe(&self, pattern: &str, listener: ChangeListener) -> SyncResult<()> {
        self.command(Command::Subscribe {
            pattern: pattern.to_string(),
            listener: Some(listener),
        })
        .await
    }

    pub async fn register_producer(
        &self,
        pattern: &str,
        initial: Option<Value>,
        on_produce: Option<ProduceHook>,
    ) -> SyncResult<()> {
        self.command(Command::RegisterProducer {
            pattern: pattern.to_string(),
            initial,
            on_produce,
        })
        .await
    }

    pub async fn publish(&self, pattern: &str, value: Value) -> SyncResult<()> {
        self.command(Command::Publish {
            pattern: pattern.to_string(),
            value,
            version: None,
        })
        .await
    }

    pub async fn stall(&self, pattern: &str) -> SyncResult<()> {
        self.command(Command::Stall {
            pattern: pattern.to_string(),
            version: None,
        })
        .await
    }

    /// Ask the task to stop; see [`Command::Disconnect`]
    pub async fn disconnect(&self, detach: bool) -> SyncResult<()> {
        self.command(Command::Disconnect { detach }).await
    }
}

enum Step {
    Transport(TransportEvent),
    LivenessCheck,
    Command(Option<Command>),
}

enum SessionEnd<T> {
    /// Connection dropped; reconnect after the delay
    Lost,
    /// Liveness timeout; reconnect right away
    Stale,
    Exit(Exit<T>),
}

/// Drives a [`SeapigClient`] over transports from a [`Connector`]
pub struct ConnectionManager<C: Connector> {
    config: ClientConfig,
    client: SeapigClient,
    connector: C,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
    status_tx: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager and the handle used to control it
    pub fn new(config: ClientConfig, client: SeapigClient, connector: C) -> (Self, ClientHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(client.state());

        let manager = Self {
            config,
            client,
            connector,
            command_rx,
            event_tx,
            status_tx,
        };
        let handle = ClientHandle {
            command_tx,
            event_rx,
            status_rx,
        };
        (manager, handle)
    }

    /// Run until disconnected by command or until every handle is dropped
    pub async fn run(mut self) -> Exit<C::Transport> {
        info!("Starting Seapig client for {}", self.config.url);

        loop {
            let transport = match self.connect().await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Seapig connection failed: {}", e);
                    self.emit(ClientEvent::Error(e.to_string()));
                    self.set_disconnected();
                    if !self.wait_before_reconnect().await {
                        return Exit::Closed;
                    }
                    continue;
                }
            };

            match self.session(transport).await {
                SessionEnd::Lost => {
                    self.set_disconnected();
                    if !self.wait_before_reconnect().await {
                        return Exit::Closed;
                    }
                }
                SessionEnd::Stale => self.set_disconnected(),
                SessionEnd::Exit(exit) => {
                    self.set_disconnected();
                    info!("Seapig client stopped");
                    return exit;
                }
            }
        }
    }

    async fn connect(&mut self) -> SyncResult<C::Transport> {
        self.client.on_connecting(Instant::now());
        self.publish_state();
        debug!("Connecting to {}", self.config.url);

        let timeout = self.config.liveness_timeout();
        match tokio::time::timeout(timeout, self.connector.connect(&self.config.url)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ConnectTimeout {
                url: self.config.url.clone(),
            }),
        }
    }

    /// Serve one open transport until it ends
    async fn session(&mut self, mut transport: C::Transport) -> SessionEnd<C::Transport> {
        self.client.on_open(Instant::now());
        self.publish_state();
        info!("Connected to Seapig server at {}", self.config.url);

        let period = self.config.liveness_interval();
        let mut liveness = tokio::time::interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Err(e) = self.flush(&mut transport).await {
                warn!("Failed to send to Seapig server: {}", e);
                transport.close().await;
                return SessionEnd::Lost;
            }

            let step = tokio::select! {
                event = transport.next_event() => Step::Transport(event),
                _ = liveness.tick() => Step::LivenessCheck,
                command = self.command_rx.recv() => Step::Command(command),
            };

            match step {
                Step::Transport(TransportEvent::Message(frame)) => self.handle_frame(&frame),
                Step::Transport(TransportEvent::Ping) => self.client.on_ping(Instant::now()),
                Step::Transport(TransportEvent::Closed { code, reason }) => {
                    warn!(
                        "Seapig connection died unexpectedly (code: {:?}, reason: {:?}), reconnecting in {:?}",
                        code,
                        reason,
                        self.config.reconnect_delay()
                    );
                    return SessionEnd::Lost;
                }
                Step::Transport(TransportEvent::Error(error)) => {
                    warn!("Seapig error: {}", error);
                    self.emit(ClientEvent::Error(error));
                    transport.close().await;
                    return SessionEnd::Lost;
                }
                Step::LivenessCheck => {
                    if self
                        .client
                        .is_stale(Instant::now(), self.config.liveness_timeout())
                    {
                        warn!("Seapig ping timeout, reconnecting");
                        transport.close().await;
                        return SessionEnd::Stale;
                    }
                }
                Step::Command(None) => {
                    debug!("All client handles dropped");
                    transport.close().await;
                    return SessionEnd::Exit(Exit::Closed);
                }
                Step::Command(Some(Command::Disconnect { detach })) => {
                    if detach {
                        return SessionEnd::Exit(Exit::Detached(transport));
                    }
                    transport.close().await;
                    return SessionEnd::Exit(Exit::Closed);
                }
                Step::Command(Some(command)) => self.apply_command(command),
            }
        }
    }

    /// Sleep before reconnecting while still serving commands
    ///
    /// Returns false if the task should stop instead.
    async fn wait_before_reconnect(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.reconnect_delay());
        tokio::pin!(delay);

        loop {
            let command = tokio::select! {
                _ = &mut delay => return true,
                command = self.command_rx.recv() => command,
            };

            match command {
                None | Some(Command::Disconnect { .. }) => return false,
                Some(command) => self.apply_command(command),
            }
        }
    }

    fn apply_command(&mut self, command: Command) {
        let result = match command {
            Command::Subscribe { pattern, listener } => {
                let subscription = self.client.subscribe(&pattern);
                if let Some(listener) = listener {
                    subscription.on_change(listener);
                }
                Ok(())
            }
            Command::RegisterProducer {
                pattern,
                initial,
                on_produce,
            } => {
                let doc = self.client.register_producer(&pattern);
                if let Some(value) = initial {
                    let version = doc.version();
                    doc.set_value(Some(value), version);
                }
                if let Some(hook) = on_produce {
                    doc.on_produce(hook);
                }
                Ok(())
            }
            Command::Publish {
                pattern,
                value,
                version,
            } => self.client.publish(&pattern, value, version),
            Command::Stall { pattern, version } => self.client.stall(&pattern, version),
            Command::Disconnect { .. } => Ok(()),
        };

        if let Err(e) = result {
            warn!("Seapig command failed: {}", e);
            self.emit(ClientEvent::Error(e.to_string()));
        }
    }

    fn handle_frame(&mut self, frame: &str) {
        debug!("Received {} byte frame", frame.len());
        match self.client.on_frame(frame, Instant::now()) {
            Ok(()) => {}
            Err(SyncError::VersionMismatch {
                id,
                local,
                received,
            }) => {
                warn!(
                    "Seapig lost some updates for {} (local {}, update from {}), resyncing",
                    id, local, received
                );
                self.emit(ClientEvent::ConsistencyViolation {
                    id,
                    local,
                    received,
                });
            }
            Err(SyncError::Patch { id, source }) => {
                warn!("Seapig patch for {} did not apply ({}), resyncing", id, source);
                self.emit(ClientEvent::PatchRejected {
                    id,
                    reason: source.to_string(),
                });
            }
            Err(e) => {
                warn!("Dropping Seapig message: {}", e);
                self.emit(ClientEvent::Error(e.to_string()));
            }
        }
    }

    async fn flush(&mut self, transport: &mut C::Transport) -> SyncResult<()> {
        for message in self.client.drain_outbox() {
            let frame = message.encode()?;
            transport.send(frame).await?;
        }
        Ok(())
    }

    fn set_disconnected(&mut self) {
        self.client.on_disconnected();
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.client.state();
        let _ = self.status_tx.send(state);
        self.emit(ClientEvent::StatusChanged(state));
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("Dropping client event: {}", e);
        }
    }
}

/// Spawn a WebSocket client task
///
/// Validates the configuration, then returns a handle to control the task
/// and the task itself, which yields the open WebSocket if it was detached.
pub fn spawn_client(
    config: ClientConfig,
    client: SeapigClient,
) -> anyhow::Result<(ClientHandle, JoinHandle<Exit<WebSocketTransport>>)> {
    config.validate()?;
    let (manager, handle) = ConnectionManager::new(config, client, WebSocketConnector);
    Ok((handle, tokio::spawn(manager.run())))
}
