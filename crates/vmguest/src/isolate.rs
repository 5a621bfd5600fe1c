//! # Isolate runtime
//!
//! Owns the guest engine, the namespace tree and the Isolate-side tunnel
//! table, and dispatches inbound protocol messages.
//!
//! ## Invariants
//!
//! - Handling is run-to-completion: one message is handled, then queued jobs
//!   and event deliveries are drained, then the next message is read.
//! - Native functions exposed to guest code only touch [`Core`]; they never
//!   re-enter the engine, and no `RefCell` borrow is held while guest code
//!   runs.
//! - Every tunnel is settled at most once: it is removed from the table before
//!   its resolver is called.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use rquickjs::Context;
use rquickjs::Ctx;
use rquickjs::Function;
use rquickjs::Object;
use rquickjs::Persistent;
use rquickjs::Runtime;
use rquickjs::Value;
use serde_json::Value as Json;
use tracing::debug;
use tracing::error;
use tracing::warn;
use vmwire::DEFAULT_NAMESPACE;
use vmwire::Message;
use vmwire::TunnelTable;
use vmwire::transport::Outbox;

use crate::config::IsolateConfig;
use crate::error::Error;
use crate::error::Result;
use crate::events::Delivery;
use crate::events::Listener;
use crate::namespace::NamespaceTree;
use crate::sandbox;

/// Resolvers of a guest promise waiting on a Controller reply.
pub(crate) struct Deferred {
    pub(crate) resolve: Persistent<Function<'static>>,
    pub(crate) reject: Persistent<Function<'static>>,
}

/// Mutable Isolate state.
pub(crate) struct State {
    pub(crate) tree: NamespaceTree<Persistent<Value<'static>>>,
    pub(crate) handles: HashMap<String, Persistent<Object<'static>>>,
    pub(crate) listeners: HashMap<String, Vec<Listener>>,
    pub(crate) queue: VecDeque<Delivery>,
    pub(crate) next_listener: u64,
}

/// State shared with native functions living inside the engine.
///
/// Native functions hold a `Weak<Core>`; the Isolate holds the only strong
/// reference.
pub(crate) struct Core {
    pub(crate) vm: String,
    pub(crate) outbox: Outbox,
    pub(crate) tunnels: TunnelTable<Deferred>,
    pub(crate) state: RefCell<State>,
}

impl Core {
    /// Sends a message to the Controller; false if it could not be sent.
    pub(crate) fn send(&self, message: Message) -> bool {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(vm = %self.vm, error = %e, "cannot encode outbound message");
                return false;
            }
        };
        match self.outbox.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!(vm = %self.vm, error = %e, "controller unreachable");
                false
            }
        }
    }

    pub(crate) fn reply(&self, tunnel: u64, outcome: Result<Json>) {
        let message = match outcome {
            Ok(payload) => Message::Resolve { tunnel, payload },
            Err(e) => Message::Reject { tunnel, error: e.to_string() },
        };
        self.send(message);
    }
}

/// A booted Isolate.
pub struct Isolate {
    // Field order matters: every persistent handle must be released before
    // the context and runtime are freed.
    pub(crate) core: Rc<Core>,
    pub(crate) helpers: Persistent<Object<'static>>,
    pub(crate) config: IsolateConfig,
    interrupt: Arc<AtomicBool>,
    pub(crate) context: Context,
    runtime: Runtime,
}

impl Isolate {
    /// Builds the engine, constructs the sandbox and creates the default
    /// namespace. Returns the Isolate and how long boot took.
    pub fn boot(
        vm: &str,
        outbox: Outbox,
        config: IsolateConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<(Self, Duration)> {
        let started = Instant::now();

        let runtime = Runtime::new().map_err(|e| Error::Guest(e.to_string()))?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);
        let flag = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

        let context = Context::full(&runtime).map_err(|e| Error::Guest(e.to_string()))?;
        let helpers = context.with(|ctx| {
            let sandbox = sandbox::build(&ctx)?;
            Ok::<_, Error>(Persistent::save(&ctx, sandbox.helpers))
        })?;

        let core = Rc::new(Core {
            vm: vm.to_string(),
            outbox,
            tunnels: TunnelTable::new(),
            state: RefCell::new(State {
                tree: NamespaceTree::new(),
                handles: HashMap::new(),
                listeners: HashMap::new(),
                queue: VecDeque::new(),
                next_listener: 0,
            }),
        });

        let isolate = Self {
            core,
            helpers,
            config,
            interrupt,
            context,
            runtime,
        };
        isolate.create(DEFAULT_NAMESPACE, None)?;

        let took = started.elapsed();
        debug!(vm = %vm, took_ms = took.as_secs_f64() * 1000.0, "isolate booted");
        Ok((isolate, took))
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn helper<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>> {
        let helpers = self
            .helpers
            .clone()
            .restore(ctx)
            .map_err(|e| Error::from_js(ctx, e))?;
        helpers.get(name).map_err(|e| Error::from_js(ctx, e))
    }

    // --- Dispatch ---

    /// Decodes and handles one inbound message.
    pub fn handle(&self, bytes: &[u8]) {
        match Message::decode(bytes) {
            Ok(message) => self.dispatch(message),
            Err(e) => match e.tunnel() {
                Some(tunnel) => {
                    warn!(vm = %self.core.vm, tunnel, error = %e, "rejecting undecodable message");
                    self.core.send(Message::Reject { tunnel, error: e.to_string() });
                }
                None => error!(vm = %self.core.vm, error = %e, "protocol error"),
            },
        }
    }

    pub fn dispatch(&self, message: Message) {
        debug!(vm = %self.core.vm, op = message.name(), tunnel = ?message.tunnel(), "handling");
        let core = &self.core;
        match message {
            Message::Resolve { tunnel, payload } => self.settle(tunnel, Ok(payload)),
            Message::Reject { tunnel, error } => self.settle(tunnel, Err(error)),
            Message::Call { tunnel, .. } => {
                core.reply(tunnel, Err(Error::Protocol("the isolate does not serve calls".into())));
            }
            Message::Emit { namespace, event, args } => self.emit(namespace, event, args),
            Message::Install { namespace, tunnel, dependency } => {
                if let Err(e) = self.install(&namespace, tunnel, dependency) {
                    core.reply(tunnel, Err(e));
                }
            }
            Message::Execute { namespace, tunnel, dependency, args } => {
                if let Err(e) = self.execute(&namespace, tunnel, &dependency, &args) {
                    core.reply(tunnel, Err(e));
                }
            }
            Message::Predefine { namespace, tunnel, idx, function } => {
                core.reply(tunnel, self.predefine(&namespace, idx, &function).map(|_| Json::Null));
            }
            Message::Create { namespace, tunnel, parent } => {
                core.reply(tunnel, self.create(&namespace, parent.as_deref()).map(|_| Json::Null));
            }
            Message::Delete { namespace, tunnel } => {
                core.reply(tunnel, self.delete(&namespace).map(Json::from));
            }
            Message::Link { namespace, tunnel, target } => {
                let linked = core.state.borrow_mut().tree.link(&namespace, &target);
                core.reply(tunnel, linked.map(|_| Json::Null).map_err(Error::from));
            }
            Message::Unlink { namespace, tunnel, target } => {
                let existed = core.state.borrow_mut().tree.unlink(&namespace, &target);
                core.reply(tunnel, existed.map(Json::from).map_err(Error::from));
            }
            Message::Mute { namespace, tunnel } => {
                let previous = core.state.borrow_mut().tree.set_muted(&namespace, true);
                core.reply(tunnel, previous.map(Json::from).map_err(Error::from));
            }
            Message::Unmute { namespace, tunnel } => {
                let previous = core.state.borrow_mut().tree.set_muted(&namespace, false);
                core.reply(tunnel, previous.map(Json::from).map_err(Error::from));
            }
            Message::ListNamespaces { tunnel } => {
                let names = core.state.borrow().tree.names();
                core.reply(tunnel, Ok(Json::from(names)));
            }
            Message::ListInstalled { namespace, tunnel } => {
                let names = core.state.borrow().tree.installed(&namespace);
                core.reply(tunnel, names.map(Json::from).map_err(Error::from));
            }
            Message::ListLinkedTo { namespace, tunnel } => {
                let names = core.state.borrow().tree.linked_to(&namespace);
                core.reply(tunnel, names.map(Json::from).map_err(Error::from));
            }
            Message::ListLinkedFrom { namespace, tunnel } => {
                let names = core.state.borrow().tree.linked_from(&namespace);
                core.reply(tunnel, names.map(Json::from).map_err(Error::from));
            }
            Message::IsMuted { namespace, tunnel } => {
                let muted = core.state.borrow().tree.is_muted(&namespace);
                core.reply(tunnel, muted.map(Json::from).map_err(Error::from));
            }
            Message::GetAncestors { namespace, tunnel } => {
                let names = core.state.borrow().tree.ancestors(&namespace);
                core.reply(tunnel, names.map(Json::from).map_err(Error::from));
            }
            Message::GetChildren { namespace, tunnel } => {
                let names = core.state.borrow().tree.children(&namespace);
                core.reply(tunnel, names.map(Json::from).map_err(Error::from));
            }
            Message::PendingTunnels { namespace, tunnel } => {
                let exists = core.state.borrow().tree.exists(&namespace);
                let pending = if exists {
                    Ok(Json::from(core.tunnels.pending_in(&namespace)))
                } else {
                    Err(Error::Namespace(crate::namespace::Error::NotFound(namespace)))
                };
                core.reply(tunnel, pending);
            }
        }
    }

    /// Settles an Isolate-side tunnel with the Controller's reply.
    fn settle(&self, tunnel: u64, outcome: std::result::Result<Json, String>) {
        let deferred = match self.core.tunnels.take(tunnel) {
            Ok(tunnel) => tunnel.handle,
            Err(e) => {
                warn!(vm = %self.core.vm, error = %e, "reply for unknown tunnel");
                return;
            }
        };
        self.context.with(|ctx| {
            let settled = match outcome {
                Ok(payload) => deferred
                    .resolve
                    .restore(&ctx)
                    .and_then(|resolve| resolve.call::<_, ()>((payload.to_string(),))),
                Err(message) => deferred
                    .reject
                    .restore(&ctx)
                    .and_then(|reject| reject.call::<_, ()>((message,))),
            };
            if let Err(e) = settled {
                warn!(vm = %self.core.vm, tunnel, error = %Error::from_js(&ctx, e), "settling tunnel failed");
            }
        });
    }

    /// Rejects every given tunnel with `message`.
    fn reject_all(&self, tunnels: Vec<(u64, vmwire::tunnel::Tunnel<Deferred>)>, message: &str) {
        if tunnels.is_empty() {
            return;
        }
        self.context.with(|ctx| {
            for (id, tunnel) in tunnels {
                let rejected = tunnel
                    .handle
                    .reject
                    .restore(&ctx)
                    .and_then(|reject| reject.call::<_, ()>((message,)));
                if let Err(e) = rejected {
                    warn!(vm = %self.core.vm, tunnel = id, error = %Error::from_js(&ctx, e), "rejecting tunnel failed");
                }
            }
        });
    }

    // --- Namespaces ---

    fn create(&self, name: &str, parent: Option<&str>) -> Result<()> {
        vmwire::ident::namespace(name).map_err(|e| Error::Protocol(e.to_string()))?;
        self.core.state.borrow_mut().tree.create(name, parent)?;

        match self.context.with(|ctx| self.events_handle(&ctx, name)) {
            Ok(handle) => {
                self.core
                    .state
                    .borrow_mut()
                    .handles
                    .insert(name.to_string(), handle);
                debug!(vm = %self.core.vm, namespace = name, parent = ?parent, "namespace created");
                Ok(())
            }
            Err(e) => {
                let _ = self.core.state.borrow_mut().tree.delete(name);
                Err(e)
            }
        }
    }

    fn delete(&self, name: &str) -> Result<Vec<String>> {
        let removed = {
            let mut state = self.core.state.borrow_mut();
            let removed = state.tree.delete(name)?;
            for gone in &removed {
                state.handles.remove(gone);
                state.listeners.remove(gone);
            }
            removed
        };

        for gone in &removed {
            let tunnels = self.core.tunnels.take_namespace(gone);
            self.reject_all(tunnels, "deleting namespace");
        }
        debug!(vm = %self.core.vm, namespace = name, removed = ?removed, "namespace deleted");
        Ok(removed)
    }

    // --- Loop ---

    /// Runs queued guest jobs and event deliveries until both are empty, the
    /// delivery budget is spent, or the Isolate is interrupted.
    pub fn drain(&self) {
        let mut delivered = 0;
        loop {
            self.run_jobs();
            if self.interrupted() {
                return;
            }

            let next = self.core.state.borrow_mut().queue.pop_front();
            let Some(delivery) = next else { break };

            if delivered >= self.config.max_event_deliveries {
                let dropped = {
                    let mut state = self.core.state.borrow_mut();
                    let dropped = state.queue.len() + 1;
                    state.queue.clear();
                    dropped
                };
                warn!(vm = %self.core.vm, dropped, "event delivery budget exhausted");
                break;
            }
            delivered += 1;
            self.deliver(delivery);
        }
    }

    fn run_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(job) => {
                    let message = job.0.with(|ctx| crate::error::describe_caught(&ctx));
                    warn!(vm = %self.core.vm, error = %message, "guest job failed");
                    if self.interrupted() {
                        break;
                    }
                }
            }
        }
    }

    /// Releases every guest value and handle held by the Isolate.
    pub(crate) fn clear(&self) {
        let tunnels = self.core.tunnels.take_all();
        drop(tunnels);
        let mut state = self.core.state.borrow_mut();
        state.tree.clear();
        state.handles.clear();
        state.listeners.clear();
        state.queue.clear();
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        self.clear();
    }
}
