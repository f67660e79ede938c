//! Protocol engine
//!
//! [`SeapigClient`] holds everything that survives a reconnect: the client
//! options and the document registry. It consumes transport events and
//! queues outgoing messages, but does no I/O itself; the
//! [`ConnectionManager`](crate::connection::ConnectionManager) moves frames
//! between it and the wire.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::document::SyncedDocument;
use crate::error::{SyncError, SyncResult};
use crate::message::{ClientMessage, DocumentUpdate, ServerMessage, Version};
use crate::pattern::Pattern;
use crate::registry::{DocumentRegistry, Subscription};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Transport opening
    Connecting,
    /// Transport open and registrations sent
    Connected,
}

/// Client-side state of a Seapig session
#[derive(Debug)]
pub struct SeapigClient {
    /// Option set announced on every connection
    options: Value,
    registry: DocumentRegistry,
    state: ConnectionState,
    last_traffic: Instant,
    outbox: Vec<ClientMessage>,
}

impl Default for SeapigClient {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl SeapigClient {
    /// Create a client with the given option set
    pub fn new(options: Value) -> Self {
        Self {
            options,
            registry: DocumentRegistry::new(),
            state: ConnectionState::Disconnected,
            last_traffic: Instant::now(),
            outbox: Vec::new(),
        }
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    /// Subscribe to a document id or wildcard pattern
    pub fn subscribe(&mut self, pattern: &str) -> &mut Subscription {
        if self.is_connected() {
            self.outbox.push(ClientMessage::consumer_register(pattern, 0));
        }
        self.registry.add_consumer(Pattern::new(pattern))
    }

    /// Register as producer for a document id or wildcard pattern
    pub fn register_producer(&mut self, pattern: &str) -> &mut SyncedDocument {
        let connected = self.is_connected();
        let doc = self.registry.add_producer(Pattern::new(pattern));
        if connected {
            self.outbox
                .push(ClientMessage::producer_register(pattern, doc.version()));
        }
        doc
    }

    /// Register a local-only document; nothing is sent for it
    pub fn register_notifier(&mut self, pattern: &str) -> &mut SyncedDocument {
        self.registry.add_notifier(Pattern::new(pattern))
    }

    pub fn consumer(&self, pattern: &str) -> Option<&Subscription> {
        self.registry.consumers.get(pattern)
    }

    pub fn consumer_mut(&mut self, pattern: &str) -> Option<&mut Subscription> {
        self.registry.consumers.get_mut(pattern)
    }

    pub fn producer(&self, pattern: &str) -> Option<&SyncedDocument> {
        self.registry.producers.get(pattern)
    }

    pub fn producer_mut(&mut self, pattern: &str) -> Option<&mut SyncedDocument> {
        self.registry.producers.get_mut(pattern)
    }

    pub fn notifier(&self, pattern: &str) -> Option<&SyncedDocument> {
        self.registry.notifiers.get(pattern)
    }

    /// Replace a producer's value and upload the change
    pub fn publish(
        &mut self,
        pattern: &str,
        value: Value,
        version: Option<Version>,
    ) -> SyncResult<()> {
        let doc = self.producer_doc(pattern)?;
        doc.replace_value(value);
        let update = doc.mark_changed(version);
        self.upload(update);
        Ok(())
    }

    /// Mark a producer stalled and tell the server
    pub fn stall(&mut self, pattern: &str, version: Option<Version>) -> SyncResult<()> {
        let doc = self.producer_doc(pattern)?;
        doc.stall();
        let update = doc.mark_changed(version);
        self.upload(update);
        Ok(())
    }

    /// Upload the current state of a producer after editing it in place
    pub fn mark_changed(&mut self, pattern: &str, version: Option<Version>) -> SyncResult<()> {
        let update = self.producer_doc(pattern)?.mark_changed(version);
        self.upload(update);
        Ok(())
    }

    fn producer_doc(&mut self, pattern: &str) -> SyncResult<&mut SyncedDocument> {
        self.registry
            .producers
            .get_mut(pattern)
            .ok_or_else(|| SyncError::UnknownDocument(pattern.to_string()))
    }

    /// A new transport is being opened
    pub fn on_connecting(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.last_traffic = now;
    }

    /// Transport is open: announce options and replay every registration
    pub fn on_open(&mut self, now: Instant) {
        self.state = ConnectionState::Connected;
        self.outbox.push(ClientMessage::ClientOptionsSet {
            options: self.options.clone(),
        });
        for (pattern, subscription) in self.registry.consumers.iter() {
            self.outbox.push(ClientMessage::consumer_register(
                pattern.as_str(),
                subscription.known_version(),
            ));
        }
        for (pattern, doc) in self.registry.producers.iter() {
            self.outbox
                .push(ClientMessage::producer_register(pattern.as_str(), doc.version()));
        }
        self.last_traffic = now;
    }

    /// Keepalive frame received
    pub fn on_ping(&mut self, now: Instant) {
        self.last_traffic = now;
    }

    /// Transport closed or failed
    pub fn on_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    /// Whether nothing has been received for longer than `timeout`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_traffic) > timeout
    }

    /// Take all queued outgoing messages
    pub fn drain_outbox(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Decode and dispatch one inbound frame
    ///
    /// On a version mismatch or a patch that does not apply, the owning
    /// subscription is re-registered from version 0 and the error is
    /// returned; other subscriptions matching the same id are still updated.
    pub fn on_frame(&mut self, frame: &str, now: Instant) -> SyncResult<()> {
        self.last_traffic = now;
        match ServerMessage::decode(frame)? {
            ServerMessage::ObjectUpdate(update) => self.handle_update(&update),
            ServerMessage::ObjectDestroy { id } => {
                self.handle_destroy(&id);
                Ok(())
            }
            ServerMessage::ObjectProduce { id } => self.handle_produce(&id),
            ServerMessage::Unknown => {
                warn!("Ignoring message with unrecognized action: {}", frame);
                Ok(())
            }
        }
    }

    fn handle_update(&mut self, update: &DocumentUpdate) -> SyncResult<()> {
        let mut first_error = None;
        let mut resubscribe = Vec::new();
        let mut matched = false;

        for (pattern, subscription) in self.registry.consumers.matching_mut(&update.id) {
            matched = true;
            if let Err(e) = subscription.apply(update) {
                let mismatch = matches!(e, SyncError::VersionMismatch { .. });
                if mismatch || matches!(e, SyncError::Patch { .. }) {
                    resubscribe.push(pattern.as_str().to_string());
                }
                // A mismatch outranks other errors when reporting
                let replace = match &first_error {
                    None => true,
                    Some(SyncError::VersionMismatch { .. }) => false,
                    Some(_) => mismatch,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }

        if !matched {
            debug!("No subscription matches update for {}", update.id);
        }
        for pattern in resubscribe {
            warn!("Resubscribing to {} from version 0", pattern);
            self.send(ClientMessage::consumer_register(&pattern, 0));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_destroy(&mut self, id: &str) {
        for (pattern, subscription) in self.registry.consumers.matching_mut(id) {
            match subscription.as_wildcard_mut() {
                Some(wildcard) => {
                    if wildcard.destroy(id).is_none() {
                        debug!("Destroy for unknown child {} of {}", id, pattern);
                    }
                }
                None => debug!("Ignoring destroy for non-wildcard subscription {}", pattern),
            }
        }
    }

    fn handle_produce(&mut self, id: &str) -> SyncResult<()> {
        let doc = self
            .registry
            .resolve_producer(id)
            .ok_or_else(|| SyncError::UnknownDocument(id.to_string()))?;
        let update = doc.produce(id);
        self.upload(update);
        Ok(())
    }

    fn upload(&mut self, update: DocumentUpdate) {
        self.send(ClientMessage::ObjectPatch(update));
    }

    fn send(&mut self, message: ClientMessage) {
        if self.is_connected() {
            self.outbox.push(message);
        } else {
            debug!("Not connected, dropping {:?}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn connected_client() -> SeapigClient {
        let mut client = SeapigClient::new(json!({"name": "test"}));
        client.on_open(Instant::now());
        client.drain_outbox();
        client
    }

    fn frame(value: Value) -> String {
        value.to_string()
    }

    fn encoded(messages: Vec<ClientMessage>) -> Vec<Value> {
        messages
            .iter()
            .map(|m| serde_json::from_str(&m.encode().unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = SeapigClient::default();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.options(), &json!({}));
    }

    #[test]
    fn test_open_replays_registrations() {
        let mut client = SeapigClient::new(json!({"name": "test"}));
        client.subscribe("user.*");
        client.subscribe("stats");
        let producer_version = client.register_producer("jobs").version();
        client.register_notifier("local");
        assert!(client.drain_outbox().is_empty());

        client.on_open(Instant::now());
        assert!(client.is_connected());

        let sent = encoded(client.drain_outbox());
        assert_eq!(
            sent,
            vec![
                json!({"action": "client-options-set", "options": {"name": "test"}}),
                json!({"action": "object-consumer-register", "id": "user.*", "known-version": 0}),
                json!({"action": "object-consumer-register", "id": "stats", "known-version": 0}),
                json!({"action": "object-producer-register", "pattern": "jobs", "known-version": producer_version}),
            ]
        );
    }

    #[test]
    fn test_subscribe_while_connected_sends_registration() {
        let mut client = connected_client();
        client.subscribe("stats");

        let sent = encoded(client.drain_outbox());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["action"], "object-consumer-register");
        assert_eq!(sent[0]["id"], "stats");
    }

    #[test]
    fn test_wildcard_update_creates_child() {
        let mut client = connected_client();
        client.subscribe("user.*");

        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "user.42",
                    "old_version": 0, "new_version": 11, "value": {"name": "a"}})),
                Instant::now(),
            )
            .unwrap();

        let wildcard = client.consumer("user.*").unwrap().as_wildcard().unwrap();
        assert_eq!(wildcard.len(), 1);
        let child = wildcard.child("user.42").unwrap();
        assert_eq!(child.value(), &json!({"name": "a"}));
        assert_eq!(child.version(), 11);
        assert!(child.is_valid());
    }

    #[test]
    fn test_update_fans_out_to_all_matching_subscriptions() {
        let mut client = connected_client();
        client.subscribe("user.*");
        client.subscribe("user.42");
        client.subscribe("room.*");

        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "user.42",
                    "old_version": 0, "new_version": 1, "value": {"n": 1}})),
                Instant::now(),
            )
            .unwrap();

        assert_eq!(client.consumer("user.*").unwrap().value(), json!({"user.42": {"n": 1}}));
        assert_eq!(client.consumer("user.42").unwrap().value(), json!({"n": 1}));
        assert!(client.consumer("room.*").unwrap().as_wildcard().unwrap().is_empty());
    }

    #[test]
    fn test_version_mismatch_resubscribes_from_zero() {
        let mut client = connected_client();
        client.subscribe("stats");
        client.drain_outbox();

        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "stats",
                    "old_version": 0, "new_version": 3, "value": {"x": 1}})),
                Instant::now(),
            )
            .unwrap();

        let err = client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "stats",
                    "old_version": 5, "new_version": 6,
                    "patch": [{"op": "replace", "path": "/x", "value": 2}]})),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::VersionMismatch { local: 3, received: 5, .. }));

        let doc = client.consumer("stats").unwrap().as_document().unwrap();
        assert_eq!(doc.value(), &json!({"x": 1}));
        assert_eq!(doc.version(), 3);

        let sent = encoded(client.drain_outbox());
        assert_eq!(
            sent,
            vec![json!({"action": "object-consumer-register", "id": "stats", "known-version": 0})]
        );
    }

    #[test]
    fn test_failed_patch_resubscribes_from_zero() {
        let mut client = connected_client();
        client.subscribe("stats");
        client.drain_outbox();

        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "stats",
                    "old_version": 0, "new_version": 3, "value": {"x": 1}})),
                Instant::now(),
            )
            .unwrap();

        let err = client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "stats",
                    "old_version": 3, "new_version": 4,
                    "patch": [{"op": "remove", "path": "/missing"}]})),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Patch { .. }));

        let doc = client.consumer("stats").unwrap().as_document().unwrap();
        assert_eq!(doc.version(), 3);

        let sent = encoded(client.drain_outbox());
        assert_eq!(
            sent,
            vec![json!({"action": "object-consumer-register", "id": "stats", "known-version": 0})]
        );
    }

    #[test]
    fn test_mismatch_reported_over_patch_failure() {
        let mut client = connected_client();
        client.subscribe("stats");
        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "stats",
                    "old_version": 0, "new_version": 3, "value": {"x": 1}})),
                Instant::now(),
            )
            .unwrap();
        client.subscribe("st*");
        client.drain_outbox();

        // "stats" fails to patch, the fresh "st*" child has never synced
        let err = client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "stats",
                    "old_version": 3, "new_version": 4,
                    "patch": [{"op": "remove", "path": "/missing"}]})),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::VersionMismatch { local: 0, received: 3, .. }));

        let sent = encoded(client.drain_outbox());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["id"], "stats");
        assert_eq!(sent[1]["id"], "st*");
    }

    #[test]
    fn test_child_mismatch_resubscribes_wildcard_pattern() {
        let mut client = connected_client();
        client.subscribe("user.*");
        client.drain_outbox();

        let err = client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "user.1",
                    "old_version": 2, "new_version": 3, "patch": []})),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::VersionMismatch { .. }));

        let sent = encoded(client.drain_outbox());
        assert_eq!(sent[0]["id"], "user.*");
        assert_eq!(sent[0]["known-version"], 0);
    }

    #[test]
    fn test_destroy_removes_child() {
        let mut client = connected_client();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        client.subscribe("user.*").on_change(Box::new(move |child| {
            if child.is_destroyed() {
                sink.lock().unwrap().push(child.id().to_string());
            }
        }));

        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "user.42",
                    "new_version": 1, "value": {}})),
                Instant::now(),
            )
            .unwrap();
        client
            .on_frame(
                &frame(json!({"action": "object-destroy", "id": "user.42"})),
                Instant::now(),
            )
            .unwrap();

        let wildcard = client.consumer("user.*").unwrap().as_wildcard().unwrap();
        assert!(wildcard.child("user.42").is_none());
        assert_eq!(*removed.lock().unwrap(), vec!["user.42".to_string()]);
    }

    #[test]
    fn test_produce_uploads_full_snapshot_for_requested_id() {
        let mut client = connected_client();
        client
            .register_producer("user.*")
            .on_produce(Box::new(|id, doc| {
                let version = doc.version();
                doc.set_value(Some(json!({"id": id})), version);
            }));
        client.drain_outbox();

        client
            .on_frame(
                &frame(json!({"action": "object-produce", "id": "user.9"})),
                Instant::now(),
            )
            .unwrap();

        let sent = encoded(client.drain_outbox());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["action"], "object-patch");
        assert_eq!(sent[0]["id"], "user.9");
        assert_eq!(sent[0]["old_version"], 0);
        assert_eq!(sent[0]["value"], json!({"id": "user.9"}));
    }

    #[test]
    fn test_produce_for_unknown_id() {
        let mut client = connected_client();
        let err = client
            .on_frame(
                &frame(json!({"action": "object-produce", "id": "nobody"})),
                Instant::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownDocument(_)));
        assert!(client.drain_outbox().is_empty());
    }

    #[test]
    fn test_publish_uploads_change() {
        let mut client = connected_client();
        client.register_producer("stats").set_value(Some(json!({"x": 1})), 5);
        client.drain_outbox();

        client.publish("stats", json!({"x": 1, "y": 2}), Some(6)).unwrap();

        let sent = encoded(client.drain_outbox());
        assert_eq!(sent[0]["action"], "object-patch");
        assert_eq!(sent[0]["old_version"], 0);
        assert_eq!(sent[0]["new_version"], 6);
        assert_eq!(sent[0]["value"], json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_publish_unknown_producer() {
        let mut client = connected_client();
        let err = client.publish("nope", json!({}), None).unwrap_err();
        assert!(matches!(err, SyncError::UnknownDocument(_)));
    }

    #[test]
    fn test_uploads_dropped_while_disconnected() {
        let mut client = SeapigClient::default();
        client.register_producer("stats");
        client.publish("stats", json!({"x": 1}), None).unwrap();

        assert!(client.drain_outbox().is_empty());
        assert_eq!(client.producer("stats").unwrap().value(), &json!({"x": 1}));
    }

    #[test]
    fn test_notifier_receives_nothing() {
        let mut client = connected_client();
        client.register_notifier("local.*");

        client
            .on_frame(
                &frame(json!({"action": "object-update", "id": "local.1",
                    "new_version": 1, "value": {"x": 1}})),
                Instant::now(),
            )
            .unwrap();

        assert_eq!(client.notifier("local.*").unwrap().version(), 0);
        assert!(client.drain_outbox().is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        let mut client = connected_client();
        client
            .on_frame(r#"{"action":"server-hello"}"#, Instant::now())
            .unwrap();

        let err = client.on_frame("{{{", Instant::now()).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage(_)));
        assert!(client.is_connected());
    }

    #[test]
    fn test_staleness_tracks_traffic() {
        let mut client = connected_client();
        let start = Instant::now();
        client.on_ping(start);

        let timeout = Duration::from_secs(20);
        assert!(!client.is_stale(start + Duration::from_secs(19), timeout));
        assert!(client.is_stale(start + Duration::from_secs(21), timeout));

        client.on_frame("not json", start + Duration::from_secs(21)).ok();
        assert!(!client.is_stale(start + Duration::from_secs(30), timeout));
    }
}
