//! # Tunnel table
//!
//! Correlates asynchronous requests with their eventual replies. Each side of
//! the protocol keeps one table; a tunnel stores whatever the owner needs to
//! settle the request (a oneshot sender on the Controller, a pair of guest
//! promise resolvers in the Isolate) plus the namespace that owns it.
//!
//! ## Invariants
//!
//! - Ids come from a counter starting at 0 and are never compacted; removing
//!   a tunnel leaves every other id untouched.
//! - A tunnel is removed on first settlement, so a second settlement of the
//!   same id fails with [`Error::UnknownTunnel`] instead of reaching the caller.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No tunnel with this id is outstanding.
    UnknownTunnel(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTunnel(id) => write!(f, "unknown tunnel {}", id),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// An outstanding request.
pub struct Tunnel<T> {
    pub namespace: Option<String>,
    pub handle: T,
}

/// Table of outstanding tunnels keyed by id.
pub struct TunnelTable<T> {
    slots: DashMap<u64, Tunnel<T>>,
    next: AtomicU64,
}

impl<T> TunnelTable<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next: AtomicU64::new(0),
        }
    }

    /// Stores `handle` under a fresh id and returns the id.
    pub fn open(&self, namespace: Option<&str>, handle: T) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(id, Tunnel {
            namespace: namespace.map(str::to_string),
            handle,
        });
        id
    }

    /// Removes and returns the tunnel with this id.
    pub fn take(&self, id: u64) -> Result<Tunnel<T>> {
        self.slots
            .remove(&id)
            .map(|(_, tunnel)| tunnel)
            .ok_or(Error::UnknownTunnel(id))
    }

    /// Removes every tunnel owned by `namespace`, in id order.
    pub fn take_namespace(&self, namespace: &str) -> Vec<(u64, Tunnel<T>)> {
        let mut ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|entry| entry.value().namespace.as_deref() == Some(namespace))
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        self.take_ids(ids)
    }

    /// Removes every outstanding tunnel, in id order.
    pub fn take_all(&self) -> Vec<(u64, Tunnel<T>)> {
        let mut ids: Vec<u64> = self.slots.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        self.take_ids(ids)
    }

    fn take_ids(&self, ids: Vec<u64>) -> Vec<(u64, Tunnel<T>)> {
        ids.into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .collect()
    }

    /// Number of outstanding tunnels owned by `namespace`.
    pub fn pending_in(&self, namespace: &str) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().namespace.as_deref() == Some(namespace))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.contains_key(&id)
    }
}

impl<T> Default for TunnelTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
