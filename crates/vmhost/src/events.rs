//! # Event bus
//!
//! Publish/subscribe over `:`-separated event names. Every VM has its own
//! bus, and the [`Host`](crate::Host) owns a process-wide one; every cast
//! reaches both.
//!
//! ## Naming
//!
//! - `vm:{vm}[:{namespace}]:{operation}` before an operation,
//!   with `:ok` or `:error` appended when it settles.
//! - `vm:{vm}:{namespace}:event:{name}` for events cast by guest code.
//! - `vm:{vm}:worker:error` for protocol errors and Isolate exits.
//! - `vm:{vm}:stop:ignored` for rejections that failed during `stop`.
//!
//! Filters use `*` for one segment and `**` for any number of segments.
//!
//! ## Delivery
//!
//! `cast` never runs subscriber code. Each subscriber owns an unbounded queue
//! and reads it at its own pace; closed subscriptions are pruned on the next
//! cast.

use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use vmwire::glob;

use crate::vm::Vm;
use crate::vm::VmInner;

/// One cast event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Name of the VM the event concerns.
    pub vm: String,
    /// Operation arguments, plus `result` or `error` once settled.
    pub args: Value,
    source: Weak<VmInner>,
}

impl Event {
    pub(crate) fn new(name: String, vm: &str, args: Value, source: Weak<VmInner>) -> Self {
        Self {
            name,
            vm: vm.to_string(),
            args,
            source,
        }
    }

    /// The VM that cast this event, while any handle to it is still alive.
    pub fn handle(&self) -> Option<Vm> {
        self.source.upgrade().map(Vm::from_inner)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.vm == other.vm
            && self.args == other.args
            && Weak::ptr_eq(&self.source, &other.source)
    }
}

struct Subscriber {
    id: u64,
    filter: String,
    tx: mpsc::UnboundedSender<Event>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribes to every event whose name matches `filter`.
    pub fn subscribe(&self, filter: impl Into<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            filter: filter.into(),
            tx,
        });
        Subscription { id, rx }
    }

    /// Removes a subscription before it is dropped.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.subscribers.lock().retain(|s| s.id != subscription.id);
    }

    /// Queues `event` for every matching subscriber.
    pub fn cast(&self, event: &Event) {
        self.subscribers.lock().retain(|subscriber| {
            if !glob::matches(&subscriber.filter, &event.name) {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream of events matching one filter.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Waits for the next matching event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns the next already-queued event, if any.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drains every already-queued event.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
