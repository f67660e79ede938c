//! Seapig client library
//!
//! Mirrors JSON documents held by a Seapig server over a persistent
//! WebSocket, receiving only the patches needed to stay current, and
//! publishes documents this client owns.
//!
//! # Architecture
//!
//! - **SeapigClient**: protocol engine owning the document registry; no I/O
//! - **ConnectionManager**: one tokio task that keeps the transport alive,
//!   replays registrations on every reconnect and routes frames to the client
//!
//! # Quick Start
//!
//! ```ignore
//! let mut client = SeapigClient::new(json!({"name": "dashboard"}));
//! client.subscribe("user.*").on_change(Box::new(|user| {
//!     println!("{} is now {}", user.id(), user.value());
//! }));
//! client.register_producer("stats");
//!
//! let (handle, task) = spawn_client(ClientConfig::load()?, client)?;
//! handle.publish("stats", json!({"online": 3})).await?;
//! ```
//!
//! # Modules
//!
//! - `client`: protocol engine and connection state
//! - `connection`: transport seam and reconnecting driver
//! - `document`: synchronized and wildcard documents
//! - `registry`: consumer, producer and notifier maps
//! - `message`: wire messages
//! - `pattern`: wildcard id matching
//! - `config`: client configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod message;
pub mod pattern;
pub mod registry;

pub use client::{ConnectionState, SeapigClient};
pub use config::ClientConfig;
pub use connection::{
    spawn_client, ClientEvent, ClientHandle, Command, ConnectionManager, Connector, Exit,
    Transport, TransportEvent, WebSocketConnector, WebSocketTransport,
};
pub use document::{ChangeListener, ProduceHook, SyncedDocument, WildcardDocument};
pub use error::{SyncError, SyncResult};
pub use message::{ClientMessage, DocumentUpdate, ServerMessage, Version};
pub use pattern::Pattern;
pub use registry::{DocumentRegistry, Subscription};
