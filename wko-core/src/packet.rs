//! Per-attempt context bag passed through a step chain.
//!
//! A [`Packet`] is created fresh for every fiber invocation and is the only
//! channel through which steps hand intermediate results to each other.
//! Child fibers receive a [`fork`](Packet::fork): reads fall through to the
//! parent's entries as they were at fork time, while writes land in an
//! overlay private to the child, so siblings never observe each other.

use crate::error::Failure;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A shareable packet value.
pub type PacketValue = Arc<dyn Any + Send + Sync>;

/// Mapping from string keys to arbitrary typed values.
pub struct Packet {
    /// Entries inherited from the parent at fork time. Never mutated.
    inherited: Arc<HashMap<String, PacketValue>>,
    /// Local writes. `None` shadows an inherited entry that was removed.
    local: HashMap<String, Option<PacketValue>>,
    cancellation: CancellationToken,
    join_failure: Option<Failure>,
}

impl Packet {
    /// Create an empty packet with its own cancellation token.
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Create an empty packet bound to an existing cancellation token.
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self {
            inherited: Arc::new(HashMap::new()),
            local: HashMap::new(),
            cancellation,
            join_failure: None,
        }
    }

    fn lookup(&self, key: &str) -> Option<&PacketValue> {
        match self.local.get(key) {
            Some(Some(value)) => Some(value),
            Some(None) => None,
            None => self.inherited.get(key),
        }
    }

    /// Borrow the value stored under `key` if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.lookup(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a shared handle to the value stored under `key` if it has type `T`.
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.lookup(key).and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    /// Clone the value stored under `key`.
    pub fn get_cloned<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.get::<T>(key).cloned()
    }

    /// Whether `key` is present (in either the overlay or the inherited view).
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Store `value` under `key`, returning whether a value was replaced.
    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> bool {
        self.put_arc(key, Arc::new(value))
    }

    /// Store an already shared value under `key`.
    pub fn put_arc(&mut self, key: impl Into<String>, value: PacketValue) -> bool {
        let key = key.into();
        let existed = self.contains(&key);
        self.local.insert(key, Some(value));
        existed
    }

    /// Return the value under `key`, computing and storing it first if absent.
    pub fn get_or_insert_with<T, F>(&mut self, key: &str, f: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get_arc::<T>(key) {
            return existing;
        }
        let value = Arc::new(f());
        self.local
            .insert(key.to_string(), Some(Arc::clone(&value) as PacketValue));
        value
    }

    /// Remove `key` from this packet's view. Inherited entries are shadowed,
    /// not removed from the parent.
    pub fn remove(&mut self, key: &str) -> bool {
        let existed = self.contains(key);
        if self.inherited.contains_key(key) {
            self.local.insert(key.to_string(), None);
        } else {
            self.local.remove(key);
        }
        existed
    }

    /// Keys visible through this packet, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inherited
            .keys()
            .filter(|k| !self.local.contains_key(*k))
            .cloned()
            .chain(
                self.local
                    .iter()
                    .filter(|(_, v)| v.is_some())
                    .map(|(k, _)| k.clone()),
            )
            .collect();
        keys.sort();
        keys
    }

    /// Create a child packet for a child fiber.
    ///
    /// The child sees a snapshot of every entry visible here and writes into
    /// its own overlay. Its cancellation token is a child of this packet's
    /// token, so cancelling the parent cancels the child.
    pub fn fork(&self) -> Packet {
        let mut flattened: HashMap<String, PacketValue> = (*self.inherited).clone();
        for (key, value) in &self.local {
            match value {
                Some(v) => {
                    flattened.insert(key.clone(), Arc::clone(v));
                }
                None => {
                    flattened.remove(key);
                }
            }
        }
        Packet {
            inherited: Arc::new(flattened),
            local: HashMap::new(),
            cancellation: self.cancellation.child_token(),
            join_failure: None,
        }
    }

    /// The cancellation token of the fiber that owns this packet.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the owning fiber has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// First child failure (in submission order) of the most recent fan-out,
    /// or `None` if every child succeeded.
    pub fn join_failure(&self) -> Option<&Failure> {
        self.join_failure.as_ref()
    }

    pub(crate) fn set_join_failure(&mut self, failure: Option<Failure>) {
        self.join_failure = failure;
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("keys", &self.keys())
            .field("cancelled", &self.is_cancelled())
            .field("join_failure", &self.join_failure)
            .finish()
    }
}
