//! Document registry
//!
//! Keeps consumer subscriptions, producer registrations and local notifiers
//! keyed by pattern. Each map preserves registration order, which decides
//! which wildcard producer answers a demand when several match.

use serde_json::Value;

use crate::document::{ChangeListener, SyncedDocument, WildcardDocument};
use crate::error::SyncResult;
use crate::message::{DocumentUpdate, Version};
use crate::pattern::Pattern;

/// Patterns mapped to entries, in registration order
#[derive(Debug)]
pub struct PatternMap<T> {
    entries: Vec<(Pattern, T)>,
}

impl<T> Default for PatternMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> PatternMap<T> {
    /// Insert an entry, replacing any entry for the same pattern in place
    pub fn insert(&mut self, pattern: Pattern, entry: T) -> &mut T {
        let index = match self.position(|p| p == &pattern) {
            Some(index) => {
                self.entries[index].1 = entry;
                index
            }
            None => {
                self.entries.push((pattern, entry));
                self.entries.len() - 1
            }
        };
        &mut self.entries[index].1
    }

    pub fn get(&self, pattern: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(p, _)| p.as_str() == pattern)
            .map(|(_, entry)| entry)
    }

    pub fn get_mut(&mut self, pattern: &str) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|(p, _)| p.as_str() == pattern)
            .map(|(_, entry)| entry)
    }

    fn position(&self, mut pred: impl FnMut(&Pattern) -> bool) -> Option<usize> {
        self.entries.iter().position(|(p, _)| pred(p))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pattern, &T)> {
        self.entries.iter().map(|(p, entry)| (p, entry))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Pattern, &mut T)> {
        self.entries.iter_mut().map(|(p, entry)| (&*p, entry))
    }

    /// Entries whose pattern matches a concrete id
    pub fn matching_mut<'a>(
        &'a mut self,
        id: &'a str,
    ) -> impl Iterator<Item = (&'a Pattern, &'a mut T)> + 'a {
        self.iter_mut().filter(move |(p, _)| p.matches(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A consumer subscription: one document, or a wildcard of children
#[derive(Debug)]
pub enum Subscription {
    Document(SyncedDocument),
    Wildcard(WildcardDocument),
}

impl Subscription {
    /// Build the subscription kind the pattern calls for
    pub fn for_pattern(pattern: &Pattern) -> Self {
        if pattern.is_wildcard() {
            Subscription::Wildcard(WildcardDocument::new(pattern.clone()))
        } else {
            Subscription::Document(SyncedDocument::new(pattern.as_str()))
        }
    }

    /// Version to resume from when (re-)registering
    pub fn known_version(&self) -> Version {
        match self {
            Subscription::Document(doc) => doc.version(),
            Subscription::Wildcard(wildcard) => wildcard.version(),
        }
    }

    /// Set the change listener; wildcard listeners receive each child
    pub fn on_change(&mut self, listener: ChangeListener) -> &mut Self {
        match self {
            Subscription::Document(doc) => {
                doc.on_change(listener);
            }
            Subscription::Wildcard(wildcard) => {
                wildcard.on_change(listener);
            }
        }
        self
    }

    pub fn apply(&mut self, update: &DocumentUpdate) -> SyncResult<()> {
        match self {
            Subscription::Document(doc) => doc.apply(update),
            Subscription::Wildcard(wildcard) => wildcard.apply(update),
        }
    }

    /// Current mirrored value; wildcards report children keyed by id
    pub fn value(&self) -> Value {
        match self {
            Subscription::Document(doc) => doc.value().clone(),
            Subscription::Wildcard(wildcard) => wildcard.value(),
        }
    }

    pub fn as_document(&self) -> Option<&SyncedDocument> {
        match self {
            Subscription::Document(doc) => Some(doc),
            Subscription::Wildcard(_) => None,
        }
    }

    pub fn as_wildcard(&self) -> Option<&WildcardDocument> {
        match self {
            Subscription::Wildcard(wildcard) => Some(wildcard),
            Subscription::Document(_) => None,
        }
    }

    pub fn as_wildcard_mut(&mut self) -> Option<&mut WildcardDocument> {
        match self {
            Subscription::Wildcard(wildcard) => Some(wildcard),
            Subscription::Document(_) => None,
        }
    }
}

/// All documents known to one client
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    pub consumers: PatternMap<Subscription>,
    pub producers: PatternMap<SyncedDocument>,
    /// Local-only documents; never sent to or fed from the server
    pub notifiers: PatternMap<SyncedDocument>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_consumer(&mut self, pattern: Pattern) -> &mut Subscription {
        let subscription = Subscription::for_pattern(&pattern);
        self.consumers.insert(pattern, subscription)
    }

    pub fn add_producer(&mut self, pattern: Pattern) -> &mut SyncedDocument {
        let doc = SyncedDocument::producer(pattern.as_str());
        self.producers.insert(pattern, doc)
    }

    pub fn add_notifier(&mut self, pattern: Pattern) -> &mut SyncedDocument {
        let doc = SyncedDocument::new(pattern.as_str());
        self.notifiers.insert(pattern, doc)
    }

    /// Find the producer answering a demand for `id`
    ///
    /// An exact registration wins; otherwise the first matching wildcard in
    /// registration order.
    pub fn resolve_producer(&mut self, id: &str) -> Option<&mut SyncedDocument> {
        let index = self
            .producers
            .position(|p| p.as_str() == id)
            .or_else(|| self.producers.position(|p| p.is_wildcard() && p.matches(id)))?;
        Some(&mut self.producers.entries[index].1)
    }
}
