//! Id-keyed registries for negotiators and forwarding peers
//!
//! Both registries are the same container. They differ in one policy: the
//! peer registry refuses a second entity with an id it already holds, the
//! negotiator registry accepts it and lookups return the first match.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::negotiator::Negotiator;
use crate::peer::ForwardingPeer;
use crate::types::PeerId;
use crate::{Error, Result};

/// Anything that can be looked up by participant id
pub trait Identified {
    fn id(&self) -> &PeerId;
}

impl<T: Identified + ?Sized> Identified for Arc<T> {
    fn id(&self) -> &PeerId {
        (**self).id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Allow,
    Reject,
}

/// Concurrent collection of entities keyed by [`Identified::id`].
///
/// Lookups share a read lock; add and remove take it exclusively. Lookups
/// scan linearly, which suits rooms of tens to a few hundred participants.
pub struct Registry<T> {
    kind: &'static str,
    policy: DuplicatePolicy,
    entries: RwLock<Vec<T>>,
}

pub type NegotiatorRegistry = Registry<Arc<Negotiator>>;
pub type PeerRegistry = Registry<Arc<ForwardingPeer>>;

impl<T: Identified + Clone> Registry<T> {
    #[must_use]
    pub fn with_policy(kind: &'static str, policy: DuplicatePolicy) -> Self {
        Self {
            kind,
            policy,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Add an entity and hand it back
    pub fn add(&self, entity: T) -> Result<T> {
        let mut entries = self.entries.write();
        if self.policy == DuplicatePolicy::Reject
            && entries.iter().any(|e| e.id() == entity.id())
        {
            return Err(Error::AlreadyExists(format!(
                "{} {} already exists",
                self.kind,
                entity.id()
            )));
        }
        entries.push(entity.clone());
        debug!(kind = self.kind, id = %entity.id(), count = entries.len(), "Registered");
        Ok(entity)
    }

    /// Remove the first entry with the entity's id
    pub fn remove(&self, entity: &T) -> bool {
        self.remove_by_id(entity.id()).is_some()
    }

    pub fn remove_by_id(&self, id: &PeerId) -> Option<T> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|e| e.id() == id)?;
        let removed = entries.remove(index);
        debug!(kind = self.kind, id = %id, count = entries.len(), "Unregistered");
        Some(removed)
    }

    pub fn get_by_id(&self, id: &PeerId) -> Result<T> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id() == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {id} not found", self.kind)))
    }

    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.read().iter().any(|e| e.id() == id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clone of every entry at this moment
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.read().clone()
    }
}

impl Registry<Arc<Negotiator>> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy("negotiator", DuplicatePolicy::Allow)
    }
}

impl Default for Registry<Arc<Negotiator>> {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry<Arc<ForwardingPeer>> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy("peer", DuplicatePolicy::Reject)
    }
}

impl Default for Registry<Arc<ForwardingPeer>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("count", &self.entries.read().len())
            .finish()
    }
}
