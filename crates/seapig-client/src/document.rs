//! Synchronized documents
//!
//! A [`SyncedDocument`] mirrors one JSON value together with its version.
//! Consumers apply server updates to it; producers edit it locally and turn
//! each change into the smallest upload they can. A [`WildcardDocument`]
//! holds one child document per concrete id matching its pattern.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::message::{DocumentUpdate, Version};
use crate::pattern::Pattern;

/// Listener invoked after a document changed
pub type ChangeListener = Box<dyn FnMut(&SyncedDocument) + Send>;

/// Hook invoked when the server demands a document from its producer
///
/// Receives the demanded id and the producer document to fill in.
pub type ProduceHook = Box<dyn FnMut(&str, &mut SyncedDocument) + Send>;

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn encoded_len<T: serde::Serialize>(value: &T) -> usize {
    serde_json::to_string(value).map_or(usize::MAX, |s| s.len())
}

/// Current time as a producer version (milliseconds since the UNIX epoch)
pub fn time_version() -> Version {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Next producer version after `current`, never going backwards
fn next_version(current: Version) -> Version {
    time_version().max(current.saturating_add(1))
}

/// A versioned mirror of one JSON document
pub struct SyncedDocument {
    /// Document id, or pattern for wildcard producers
    id: String,
    version: Version,
    value: Value,
    /// Set once a full sync has been applied
    valid: bool,
    /// Producer has nothing to offer right now
    stalled: bool,
    /// Last value sent or applied, used as diff base
    shadow: Value,
    /// Last upload was a stall, so the shadow is no diff base
    sent_stall: bool,
    /// Pattern of the wildcard subscription this child belongs to
    parent: Option<String>,
    destroyed: bool,
    on_change: Option<ChangeListener>,
    on_produce: Option<ProduceHook>,
}

impl SyncedDocument {
    /// Create an empty document at version 0
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            value: empty_object(),
            valid: false,
            stalled: false,
            shadow: empty_object(),
            sent_stall: false,
            parent: None,
            destroyed: false,
            on_change: None,
            on_produce: None,
        }
    }

    /// Create a producer document with a time-derived initial version
    ///
    /// A restarted producer must not reuse version 0 once it has sent data.
    pub fn producer(pattern: impl Into<String>) -> Self {
        let mut doc = Self::new(pattern);
        doc.version = time_version();
        doc
    }

    fn child(id: &str, parent: &str) -> Self {
        let mut doc = Self::new(id);
        doc.parent = Some(parent.to_string());
        doc
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Mutable access to the value; call [`mark_changed`](Self::mark_changed) afterwards
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Pattern of the owning wildcard subscription, if any
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The value last transmitted or applied
    pub fn shadow(&self) -> &Value {
        &self.shadow
    }

    /// Set the listener called after every applied update
    pub fn on_change(&mut self, listener: ChangeListener) -> &mut Self {
        self.on_change = Some(listener);
        self
    }

    /// Set the hook called when the server demands this document
    pub fn on_produce(&mut self, hook: ProduceHook) -> &mut Self {
        self.on_produce = Some(hook);
        self
    }

    /// Apply a server update and notify the change listener
    pub fn apply(&mut self, update: &DocumentUpdate) -> SyncResult<()> {
        self.apply_update(update)?;
        self.notify();
        Ok(())
    }

    /// Apply a server update without notifying
    ///
    /// The new value is built on a copy, so on error neither value nor
    /// version changes.
    fn apply_update(&mut self, update: &DocumentUpdate) -> SyncResult<()> {
        let full = update.is_full_sync();
        if !full {
            let received = update.old_version.unwrap_or_default();
            if received != self.version {
                return Err(SyncError::VersionMismatch {
                    id: update.id.clone(),
                    local: self.version,
                    received,
                });
            }
        }

        let mut next = if full { empty_object() } else { self.value.clone() };
        if let Some(patch) = &update.patch {
            json_patch::patch(&mut next, &patch.0).map_err(|source| SyncError::Patch {
                id: update.id.clone(),
                source,
            })?;
        }

        let stalled = update.is_stall();
        if let Some(value) = &update.value {
            next = if stalled { empty_object() } else { value.clone() };
        }

        self.value = next;
        self.shadow = self.value.clone();
        self.stalled = stalled;
        self.version = update.new_version;
        self.valid = true;
        Ok(())
    }

    fn notify(&mut self) {
        if let Some(mut listener) = self.on_change.take() {
            listener(self);
            self.on_change = Some(listener);
        }
    }

    /// Replace the value and diff base; `None` marks the document stalled
    pub fn set_value(&mut self, value: Option<Value>, version: Version) {
        match value {
            Some(value) => {
                self.stalled = false;
                self.value = value;
                self.shadow = self.value.clone();
                self.sent_stall = false;
            }
            None => self.stalled = true,
        }
        self.version = version;
    }

    /// Replace the value without touching the diff base
    pub fn replace_value(&mut self, value: Value) {
        self.stalled = false;
        self.value = value;
    }

    /// Declare that the producer currently has no data
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    /// Snapshot the current value under a new version and build its upload
    ///
    /// After a stall the server holds `false`, so the change goes out as a
    /// full value from version 0.
    pub fn mark_changed(&mut self, version: Option<Version>) -> DocumentUpdate {
        let previous = self.version;
        let old_version = if self.sent_stall { 0 } else { previous };
        let old_value = std::mem::replace(&mut self.shadow, self.value.clone());
        self.version = version.unwrap_or_else(|| next_version(previous));
        self.sent_stall = self.stalled;
        let id = self.id.clone();
        self.upload(old_version, &old_value, &id)
    }

    /// Build an `object-patch` payload moving `old_value` to the current snapshot
    ///
    /// Falls back to the full value when there is no base to diff against,
    /// when stalled, or when the patch would not be smaller than the value.
    pub fn upload(&self, old_version: Version, old_value: &Value, id: &str) -> DocumentUpdate {
        let mut update = DocumentUpdate {
            id: id.to_string(),
            old_version: Some(old_version),
            new_version: self.version,
            patch: None,
            value: None,
        };

        if old_version == 0 || self.stalled {
            update.value = Some(if self.stalled {
                Value::Bool(false)
            } else {
                self.shadow.clone()
            });
            return update;
        }

        let patch = json_patch::diff(old_value, &self.shadow);
        if encoded_len(&patch) < encoded_len(&self.shadow) {
            update.patch = Some(patch);
        } else {
            debug!("Patch for {} not smaller than value, sending full value", id);
            update.old_version = Some(0);
            update.value = Some(self.shadow.clone());
        }
        update
    }

    /// Answer a produce demand for `id` with a full snapshot
    pub fn produce(&mut self, id: &str) -> DocumentUpdate {
        if let Some(mut hook) = self.on_produce.take() {
            hook(id, self);
            self.on_produce = Some(hook);
        }
        self.sent_stall = self.stalled;
        self.upload(0, &empty_object(), id)
    }
}

impl fmt::Debug for SyncedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedDocument")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("value", &self.value)
            .field("valid", &self.valid)
            .field("stalled", &self.stalled)
            .field("parent", &self.parent)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

/// A subscription whose value is one child document per matching id
pub struct WildcardDocument {
    pattern: Pattern,
    /// Resume version sent on registration; resyncs always start from 0
    version: Version,
    children: BTreeMap<String, SyncedDocument>,
    on_change: Option<ChangeListener>,
}

impl WildcardDocument {
    pub fn new(pattern: impl Into<Pattern>) -> Self {
        Self {
            pattern: pattern.into(),
            version: 0,
            children: BTreeMap::new(),
            on_change: None,
        }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Look up the child for a concrete id
    pub fn child(&self, id: &str) -> Option<&SyncedDocument> {
        self.children.get(id)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &SyncedDocument)> {
        self.children.iter().map(|(id, doc)| (id.as_str(), doc))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// All child values keyed by id
    pub fn value(&self) -> Value {
        Value::Object(
            self.children
                .iter()
                .map(|(id, doc)| (id.clone(), doc.value().clone()))
                .collect(),
        )
    }

    /// Set the listener called with each changed or destroyed child
    pub fn on_change(&mut self, listener: ChangeListener) -> &mut Self {
        self.on_change = Some(listener);
        self
    }

    /// Apply an update to the child for `update.id`, creating it if needed
    pub fn apply(&mut self, update: &DocumentUpdate) -> SyncResult<()> {
        let parent = self.pattern.as_str();
        let child = self
            .children
            .entry(update.id.clone())
            .or_insert_with(|| SyncedDocument::child(&update.id, parent));

        if let Err(e) = child.apply_update(update) {
            if !child.is_valid() {
                self.children.remove(&update.id);
            }
            return Err(e);
        }

        if let Some(listener) = self.on_change.as_mut() {
            listener(child);
        }
        Ok(())
    }

    /// Remove the child for `id`, returning it marked as destroyed
    pub fn destroy(&mut self, id: &str) -> Option<SyncedDocument> {
        let mut child = self.children.remove(id)?;
        child.destroyed = true;
        if let Some(listener) = self.on_change.as_mut() {
            listener(&child);
        }
        Some(child)
    }
}

impl fmt::Debug for WildcardDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WildcardDocument")
            .field("pattern", &self.pattern)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
