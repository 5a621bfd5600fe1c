//! # VM Controller
//!
//! A [`Vm`] owns one Isolate thread and is the only way to talk to it. Every
//! public operation validates its input synchronously, allocates a tunnel,
//! sends one message and hands back a [`Pending`] that settles when the
//! matching reply arrives.
//!
//! ## Lifecycle
//!
//! `created -> booting -> running -> stopped`. `start` is only valid from
//! `created`; `stop` is valid from anywhere and a second `stop` is a no-op.
//! Nothing leaves `stopped`.
//!
//! ## Invariants
//!
//! - **At-most-once settlement**: a tunnel is removed from the table before
//!   its sender fires, so a reply, the boot deadline and the stop sweep can
//!   race without double-settling.
//! - **Pump**: one task per VM reads the Isolate's messages in order. It holds
//!   the VM weakly; dropping the last [`Vm`] handle tears everything down.
//! - **Events**: every operation casts `vm:{vm}[:{ns}]:{op}` before it is sent
//!   and `...:ok` or `...:error` when it settles, on the VM's bus and on the
//!   host's bus.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use vmguest::IsolateHandle;
use vmguest::syntax;
use vmwire::BOOT_TUNNEL;
use vmwire::DEFAULT_NAMESPACE;
use vmwire::Dependency;
use vmwire::Message;
use vmwire::Transport;
use vmwire::TunnelTable;
use vmwire::graph;
use vmwire::ident;
use vmwire::transport::channel_pair;
use vmwire::tunnel;

use crate::config::VmConfig;
use crate::error::LifecycleState;
use crate::error::Result;
use crate::error::VmError;
use crate::events::Event;
use crate::events::EventBus;
use crate::functions::FunctionTable;
use crate::functions::HostFunction;
use crate::pending::Pending;

/// Settlement payload of operations that return nothing.
const NULL: &Value = &Value::Null;

/// Boot durations reported by a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootTimes {
    /// Time the Isolate spent building its sandbox, as measured by itself.
    pub isolate_ms: f64,
    /// Time from `start` until the Controller saw the boot reply.
    pub host_ms: f64,
}

/// What a tunnel was opened for; used to cast its settlement events.
struct Op {
    name: &'static str,
    namespace: Option<String>,
    args: Value,
}

impl Op {
    fn new(name: &'static str, namespace: Option<&str>, args: Value) -> Self {
        Self {
            name,
            namespace: namespace.map(str::to_string),
            args,
        }
    }
}

/// Extra work done when a tunnel settles.
enum Cleanup {
    None,
    /// Free a predefined-function index if registration is rejected.
    ReleaseFunction(u32),
    /// Fail the Controller's own tunnels in every namespace a delete removed.
    RejectRemoved,
}

struct Settler {
    op: Op,
    tx: oneshot::Sender<Result<Value>>,
    cleanup: Cleanup,
}

pub(crate) struct VmInner {
    this: Weak<VmInner>,
    name: String,
    config: VmConfig,
    state: Mutex<LifecycleState>,
    tunnels: TunnelTable<Settler>,
    functions: FunctionTable,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    isolate: Mutex<Option<IsolateHandle>>,
    pump: Mutex<Option<AbortHandle>>,
    deadline: Mutex<Option<AbortHandle>>,
    started: Mutex<Option<Instant>>,
    local: Arc<EventBus>,
    global: Arc<EventBus>,
}

/// Handle to one sandboxed VM. Cloning shares the VM.
#[derive(Clone)]
pub struct Vm {
    inner: Arc<VmInner>,
}

impl Vm {
    pub(crate) fn new(name: &str, config: VmConfig, global: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new_cyclic(|this| VmInner {
                this: this.clone(),
                name: name.to_string(),
                config,
                state: Mutex::new(LifecycleState::Created),
                tunnels: TunnelTable::new(),
                functions: FunctionTable::new(),
                transport: Mutex::new(None),
                isolate: Mutex::new(None),
                pump: Mutex::new(None),
                deadline: Mutex::new(None),
                started: Mutex::new(None),
                local: Arc::new(EventBus::new()),
                global,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<VmInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<VmInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// This VM's own event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.local
    }

    // --- Lifecycle ---

    /// Spawns the Isolate and waits up to `timeout` (the configured default
    /// if `None`) for it to report a finished sandbox.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&self, timeout: Option<Duration>) -> Result<Pending<BootTimes>> {
        let inner = &self.inner;
        let requested = timeout.unwrap_or(inner.config.boot_timeout);
        let timeout = ident::timeout(requested, inner.config.max_boot_timeout)?;
        let runtime = Handle::try_current().map_err(|e| VmError::Spawn(e.to_string()))?;

        {
            let mut state = inner.state.lock();
            if *state != LifecycleState::Created {
                return Err(VmError::State { op: "start", state: *state });
            }
            *state = LifecycleState::Booting;
        }

        let args = json!({ "timeout": timeout.as_millis() as u64 });
        inner.cast("start", None, None, &args);
        *inner.started.lock() = Some(Instant::now());

        let (tx, rx) = oneshot::channel();
        inner.tunnels.open(Some(DEFAULT_NAMESPACE), Settler {
            op: Op::new("start", None, args),
            tx,
            cleanup: Cleanup::None,
        });
        let pending = Pending::reply(rx, |payload| {
            let (isolate_ms, host_ms): (f64, f64) =
                serde_json::from_value(payload).map_err(|e| VmError::Decode(e.to_string()))?;
            Ok(BootTimes { isolate_ms, host_ms })
        });

        let (transport, port) = channel_pair();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        *inner.transport.lock() = Some(transport.clone());

        match vmguest::spawn(&inner.name, port, inner.config.isolate.clone()) {
            Ok(handle) => *inner.isolate.lock() = Some(handle),
            Err(e) => {
                inner.fail_boot(VmError::Spawn(e.to_string()));
                return Ok(pending);
            }
        }
        debug!(vm = %inner.name, timeout_ms = timeout.as_millis() as u64, "isolate spawned");

        let pump = runtime.spawn(pump(Arc::downgrade(inner), transport));
        *inner.pump.lock() = Some(pump.abort_handle());

        let vm = Arc::downgrade(inner);
        let deadline = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = vm.upgrade() {
                inner.fail_boot(VmError::Timeout(timeout));
            }
        });
        *inner.deadline.lock() = Some(deadline.abort_handle());

        // A concurrent stop may have swept the VM while the tasks were wired.
        if *inner.state.lock() == LifecycleState::Stopped {
            drop(inner.teardown());
        }
        Ok(pending)
    }

    /// Moves to `stopped`, terminates the Isolate and rejects every
    /// outstanding request with [`VmError::Stopped`]. The returned future
    /// resolves once the Isolate thread has exited.
    pub fn stop(&self) -> Pending<()> {
        let inner = self.inner.clone();
        let previous = {
            let mut state = inner.state.lock();
            std::mem::replace(&mut *state, LifecycleState::Stopped)
        };
        if previous == LifecycleState::Stopped {
            return Pending::ready(Ok(()));
        }

        info!(vm = %inner.name, from = %previous, "stopping");
        inner.cast("stop", None, None, &json!({}));
        let handle = inner.teardown();

        for (tunnel, op) in inner.reject_all(VmError::Stopped) {
            warn!(vm = %inner.name, tunnel, op, "stop could not reject tunnel");
            inner.cast_raw(
                format!("vm:{}:stop:ignored", inner.name),
                json!({ "tunnel": tunnel, "op": op }),
            );
        }

        Pending::new(async move {
            if let Some(handle) = handle {
                let joined = tokio::task::spawn_blocking(move || handle.join()).await;
                if !matches!(joined, Ok(true)) {
                    warn!(vm = %inner.name, "isolate thread panicked");
                }
            }
            inner.cast("stop", None, Some("ok"), &json!({}));
            Ok(())
        })
    }

    // --- Namespaces ---

    pub fn create_namespace(&self, name: &str, parent: Option<&str>) -> Result<Pending<()>> {
        self.inner.ensure_running("createNamespace")?;
        ident::namespace(name)?;
        if let Some(parent) = parent {
            ident::namespace(parent)?;
        }
        let op = Op::new("createNamespace", Some(name), json!({ "name": name, "parent": parent }));
        let rx = self.inner.request(op, Cleanup::None, |tunnel| Message::Create {
            namespace: name.to_string(),
            tunnel,
            parent: parent.map(str::to_string),
        });
        Ok(Pending::decoded(rx))
    }

    /// Deletes `name` and its descendants. Resolves to every removed name,
    /// descendants first.
    pub fn delete_namespace(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.inner.ensure_running("deleteNamespace")?;
        ident::namespace(name)?;
        let op = Op::new("deleteNamespace", Some(name), json!({ "name": name }));
        let rx = self.inner.request(op, Cleanup::RejectRemoved, |tunnel| Message::Delete {
            namespace: name.to_string(),
            tunnel,
        });
        Ok(Pending::decoded(rx))
    }

    /// Events cast in `source` are also delivered in `target`.
    pub fn link_namespaces(&self, source: &str, target: &str) -> Result<Pending<()>> {
        self.inner.ensure_running("linkNamespaces")?;
        ident::namespace(source)?;
        ident::namespace(target)?;
        let op = Op::new("linkNamespaces", Some(source), json!({ "source": source, "target": target }));
        let rx = self.inner.request(op, Cleanup::None, |tunnel| Message::Link {
            namespace: source.to_string(),
            tunnel,
            target: target.to_string(),
        });
        Ok(Pending::decoded(rx))
    }

    /// Resolves to whether the link existed.
    pub fn unlink_namespaces(&self, source: &str, target: &str) -> Result<Pending<bool>> {
        self.inner.ensure_running("unlinkNamespaces")?;
        ident::namespace(source)?;
        ident::namespace(target)?;
        let op = Op::new("unlinkNamespaces", Some(source), json!({ "source": source, "target": target }));
        let rx = self.inner.request(op, Cleanup::None, |tunnel| Message::Unlink {
            namespace: source.to_string(),
            tunnel,
            target: target.to_string(),
        });
        Ok(Pending::decoded(rx))
    }

    /// Stops forwarding guest events from `name` to the Controller. Resolves
    /// to the previous flag.
    pub fn mute_namespace(&self, name: &str) -> Result<Pending<bool>> {
        self.simple("muteNamespace", name, |namespace, tunnel| Message::Mute { namespace, tunnel })
    }

    /// Resolves to the previous flag.
    pub fn unmute_namespace(&self, name: &str) -> Result<Pending<bool>> {
        self.simple("unmuteNamespace", name, |namespace, tunnel| Message::Unmute { namespace, tunnel })
    }

    pub fn list_namespaces(&self) -> Result<Pending<Vec<String>>> {
        self.inner.ensure_running("listNamespaces")?;
        let op = Op::new("listNamespaces", None, json!({}));
        let rx = self.inner.request(op, Cleanup::None, |tunnel| Message::ListNamespaces { tunnel });
        Ok(Pending::decoded(rx))
    }

    /// Symbols installed directly in `name`; inherited ones are not listed.
    pub fn list_installed(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.simple("listInstalled", name, |namespace, tunnel| Message::ListInstalled { namespace, tunnel })
    }

    /// Namespaces `name` links to.
    pub fn list_linked_to(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.simple("listLinkedTo", name, |namespace, tunnel| Message::ListLinkedTo { namespace, tunnel })
    }

    /// Namespaces linking to `name`.
    pub fn list_linked_from(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.simple("listLinkedFrom", name, |namespace, tunnel| Message::ListLinkedFrom { namespace, tunnel })
    }

    pub fn is_muted(&self, name: &str) -> Result<Pending<bool>> {
        self.simple("isMuted", name, |namespace, tunnel| Message::IsMuted { namespace, tunnel })
    }

    /// `name` first, then its parent, up to the root of its tree.
    pub fn get_ancestors(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.simple("getAncestors", name, |namespace, tunnel| Message::GetAncestors { namespace, tunnel })
    }

    pub fn get_children(&self, name: &str) -> Result<Pending<Vec<String>>> {
        self.simple("getChildren", name, |namespace, tunnel| Message::GetChildren { namespace, tunnel })
    }

    /// Number of Isolate-side requests outstanding in `name`, such as guest
    /// calls to predefined functions.
    pub fn pending_tunnels(&self, name: &str) -> Result<Pending<u64>> {
        self.simple("pendingTunnels", name, |namespace, tunnel| Message::PendingTunnels { namespace, tunnel })
    }

    fn simple<T>(
        &self,
        op: &'static str,
        name: &str,
        message: impl FnOnce(String, u64) -> Message,
    ) -> Result<Pending<T>>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        self.inner.ensure_running(op)?;
        ident::namespace(name)?;
        let rx = self.inner.request(
            Op::new(op, Some(name), json!({ "name": name })),
            Cleanup::None,
            |tunnel| message(name.to_string(), tunnel),
        );
        Ok(Pending::decoded(rx))
    }

    // --- Dependencies ---

    /// Makes `callback` callable from guest code in `namespace` as `name`.
    /// Each guest call is an asynchronous round trip to the Controller.
    pub fn predefine<F>(&self, namespace: &str, name: &str, callback: F) -> Result<Pending<()>>
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.inner.ensure_running("predefine")?;
        ident::namespace(namespace)?;
        ident::identifier(name)?;

        let callback: HostFunction = Arc::new(callback);
        let idx = self.inner.functions.reserve(namespace, name, callback);
        let op = Op::new("predefine", Some(namespace), json!({ "name": name, "idx": idx }));
        let rx = self.inner.request(op, Cleanup::ReleaseFunction(idx), |tunnel| Message::Predefine {
            namespace: namespace.to_string(),
            tunnel,
            idx,
            function: name.to_string(),
        });
        Ok(Pending::decoded(rx))
    }

    /// Runs `dependency` once and keeps its result under its name.
    pub fn install(&self, namespace: &str, dependency: Dependency) -> Result<Pending<()>> {
        self.inner.ensure_running("install")?;
        ident::namespace(namespace)?;
        check_dependency(&dependency)?;

        let op = Op::new("install", Some(namespace), json!({ "dependency": dependency.as_object() }));
        let rx = self.inner.request(op, Cleanup::None, |tunnel| Message::Install {
            namespace: namespace.to_string(),
            tunnel,
            dependency,
        });
        Ok(Pending::decoded(rx))
    }

    /// Installs a batch in dependency order. Installs run one at a time, so a
    /// failure leaves the prefix before it installed.
    ///
    /// The batch starts immediately on its own task and runs to completion
    /// whether or not the returned [`Pending`] is awaited. It first queries the
    /// installed names, so operations issued after this call may reach the
    /// Isolate before the batch's installs do.
    ///
    /// Must be called inside a tokio runtime.
    pub fn install_all(&self, namespace: &str, dependencies: Vec<Dependency>) -> Result<Pending<()>> {
        self.inner.ensure_running("installAll")?;
        ident::namespace(namespace)?;
        for dependency in &dependencies {
            check_dependency(dependency)?;
        }
        let runtime = Handle::try_current().map_err(|e| VmError::Spawn(e.to_string()))?;

        let objects: Vec<Value> = dependencies.iter().map(Dependency::as_object).collect();
        let op = Op::new("installAll", Some(namespace), json!({ "dependencies": objects }));
        self.inner.cast(op.name, Some(namespace), None, &op.args);

        let (tx, rx) = oneshot::channel();
        let vm = self.clone();
        let namespace = namespace.to_string();
        runtime.spawn(async move {
            let result = vm.install_ordered(&namespace, dependencies).await;
            vm.inner.cast_settled(&op, result.as_ref().map(|_| NULL));
            let _ = tx.send(result.map(|()| Value::Null));
        });
        Ok(Pending::reply(rx, |_| Ok(())))
    }

    async fn install_ordered(&self, namespace: &str, dependencies: Vec<Dependency>) -> Result<()> {
        let mut installed = BTreeSet::new();
        for ancestor in self.get_ancestors(namespace)?.await? {
            installed.extend(self.list_installed(&ancestor)?.await?);
        }

        let ordered = graph::order(&installed, dependencies)?;
        debug!(
            vm = %self.inner.name,
            namespace,
            order = ?ordered.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "installing batch"
        );
        for dependency in ordered {
            self.install(namespace, dependency)?.await?;
        }
        Ok(())
    }

    /// Runs `dependency` with its imports resolved in `namespace` and `args`
    /// bound by name. Resolves to the guest's return value.
    pub fn execute(
        &self,
        namespace: &str,
        dependency: Dependency,
        args: Map<String, Value>,
    ) -> Result<Pending<Value>> {
        self.inner.ensure_running("execute")?;
        ident::namespace(namespace)?;
        check_dependency(&dependency)?;
        for name in args.keys() {
            ident::identifier(name)?;
        }

        let op = Op::new(
            "execute",
            Some(namespace),
            json!({ "dependency": dependency.as_object(), "args": args }),
        );
        let rx = self.inner.request(op, Cleanup::None, |tunnel| Message::Execute {
            namespace: namespace.to_string(),
            tunnel,
            dependency,
            args,
        });
        Ok(Pending::reply(rx, Ok))
    }

    // --- Events ---

    /// Casts `event` into `namespace` inside the Isolate. Fire and forget.
    pub fn emit(&self, namespace: &str, event: &str, args: Vec<Value>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_running("emit")?;
        ident::namespace(namespace)?;

        let op = Op::new("emit", Some(namespace), json!({ "event": event, "args": args }));
        inner.cast(op.name, Some(namespace), None, &op.args);
        let sent = inner.send(&Message::Emit {
            namespace: namespace.to_string(),
            event: event.to_string(),
            args,
        });
        inner.cast_settled(&op, sent.as_ref().map(|_| NULL));
        sent
    }
}

fn check_dependency(dependency: &Dependency) -> Result<()> {
    dependency.validate()?;
    syntax::check_function_body(&dependency.code).map_err(ident::Error::Syntax)?;
    Ok(())
}

impl VmInner {
    fn ensure_running(&self, op: &'static str) -> Result<()> {
        let state = *self.state.lock();
        if state != LifecycleState::Running {
            return Err(VmError::State { op, state });
        }
        Ok(())
    }

    fn send(&self, message: &Message) -> Result<()> {
        let bytes = message.encode().map_err(|e| VmError::Protocol(e.to_string()))?;
        let transport = self.transport.lock().clone().ok_or(VmError::Stopped)?;
        transport.send(bytes)?;
        Ok(())
    }

    /// Casts the before-event, opens a tunnel and sends the message built for
    /// it. A send failure settles the tunnel immediately.
    fn request(
        &self,
        op: Op,
        cleanup: Cleanup,
        message: impl FnOnce(u64) -> Message,
    ) -> oneshot::Receiver<Result<Value>> {
        self.cast(op.name, op.namespace.as_deref(), None, &op.args);

        let (tx, rx) = oneshot::channel();
        let owner = op.namespace.clone();
        let tunnel = self.tunnels.open(owner.as_deref(), Settler { op, tx, cleanup });
        let message = message(tunnel);
        debug!(vm = %self.name, op = message.name(), tunnel, "sending");

        if let Err(e) = self.send(&message) {
            let _ = self.settle(tunnel, Err(e));
        }
        rx
    }

    // --- Settlement ---

    fn settle(&self, tunnel: u64, result: Result<Value>) -> tunnel::Result<()> {
        let settler = self.tunnels.take(tunnel)?.handle;
        self.deliver(tunnel, settler, result);
        Ok(())
    }

    /// Runs cleanup, casts the settlement event and wakes the caller. Returns
    /// false if the caller is gone.
    fn deliver(&self, tunnel: u64, settler: Settler, result: Result<Value>) -> bool {
        let Settler { op, tx, cleanup } = settler;
        match (&result, cleanup) {
            (Err(_), Cleanup::ReleaseFunction(idx)) => self.functions.release(idx),
            (Ok(removed), Cleanup::RejectRemoved) => self.reject_removed(removed),
            _ => {}
        }

        debug!(vm = %self.name, op = op.name, tunnel, ok = result.is_ok(), "settled");
        self.cast_settled(&op, result.as_ref());
        tx.send(result).is_ok()
    }

    fn reject_removed(&self, removed: &Value) {
        let names = removed.as_array().into_iter().flatten().filter_map(Value::as_str);
        for name in names {
            for (tunnel, owned) in self.tunnels.take_namespace(name) {
                self.deliver(tunnel, owned.handle, Err(VmError::NamespaceDeleted(name.to_string())));
            }
        }
    }

    /// Rejects every outstanding tunnel with `error`. Returns the tunnels
    /// whose callers were already gone.
    fn reject_all(&self, error: VmError) -> Vec<(u64, &'static str)> {
        let mut ignored = Vec::new();
        for (tunnel, owned) in self.tunnels.take_all() {
            let op = owned.handle.op.name;
            if !self.deliver(tunnel, owned.handle, Err(error.clone())) {
                ignored.push((tunnel, op));
            }
        }
        ignored
    }

    // --- Boot ---

    fn finish_boot(&self, payload: Value) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Booting {
                return;
            }
            *state = LifecycleState::Running;
        }
        if let Some(deadline) = self.deadline.lock().take() {
            deadline.abort();
        }

        let isolate_ms = payload.as_f64().unwrap_or_default();
        let started = *self.started.lock();
        let host_ms = started
            .map(|at| at.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or_default();
        info!(vm = %self.name, isolate_ms, host_ms, "vm running");

        if let Err(e) = self.settle(BOOT_TUNNEL, Ok(json!([isolate_ms, host_ms]))) {
            warn!(vm = %self.name, error = %e, "boot tunnel already settled");
        }
    }

    fn fail_boot(&self, error: VmError) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Booting {
                return;
            }
            *state = LifecycleState::Stopped;
        }
        error!(vm = %self.name, error = %error, "boot failed");
        drop(self.teardown());

        if let Ok(boot) = self.tunnels.take(BOOT_TUNNEL) {
            self.deliver(BOOT_TUNNEL, boot.handle, Err(error));
        }
    }

    /// Cancels the Controller tasks, closes the channel and interrupts the
    /// Isolate. Returns the thread handle so the caller can join it.
    fn teardown(&self) -> Option<IsolateHandle> {
        if let Some(deadline) = self.deadline.lock().take() {
            deadline.abort();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        let handle = self.isolate.lock().take();
        if let Some(handle) = &handle {
            handle.terminate();
        }
        handle
    }

    fn isolate_exited(&self) {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Stopped {
                return;
            }
            *state = LifecycleState::Stopped;
        }
        error!(vm = %self.name, "isolate exited unexpectedly");
        self.worker_error("isolate exited");
        drop(self.teardown());
        self.reject_all(VmError::IsolateExited);
    }

    // --- Inbound ---

    fn handle(&self, bytes: &[u8]) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.refuse(e.tunnel(), e.to_string());
                return;
            }
        };

        match message {
            Message::Resolve { tunnel, payload } => self.reply(tunnel, Ok(payload)),
            Message::Reject { tunnel, error } => self.reply(tunnel, Err(VmError::Remote(error))),
            Message::Call { namespace, tunnel, idx, args } => self.call(&namespace, tunnel, idx, args),
            Message::Emit { namespace, event, args } => {
                debug!(vm = %self.name, namespace = %namespace, event = %event, "guest event");
                self.cast_raw(
                    format!("vm:{}:{}:event:{}", self.name, namespace, event),
                    Value::Array(args),
                );
            }
            other => {
                let reason = format!("the controller does not serve '{}'", other.name());
                self.refuse(other.tunnel(), reason);
            }
        }
    }

    fn reply(&self, tunnel: u64, result: Result<Value>) {
        if tunnel == BOOT_TUNNEL && *self.state.lock() == LifecycleState::Booting {
            match result {
                Ok(payload) => self.finish_boot(payload),
                Err(e) => self.fail_boot(e),
            }
            return;
        }
        if let Err(e) = self.settle(tunnel, result) {
            warn!(vm = %self.name, error = %e, "reply for unknown tunnel");
            self.worker_error(&e.to_string());
        }
    }

    /// Serves a guest call to a predefined function.
    fn call(&self, namespace: &str, tunnel: u64, idx: u32, args: Vec<Value>) {
        let name = self.functions.describe(idx).map(|(_, name)| name);
        let op = Op::new("call", Some(namespace), json!({ "idx": idx, "name": name, "args": args }));
        self.cast(op.name, Some(namespace), None, &op.args);

        let result = self.functions.call(idx, args);
        let reply = match &result {
            Ok(payload) => Message::Resolve { tunnel, payload: payload.clone() },
            Err(error) => Message::Reject { tunnel, error: error.clone() },
        };
        let outcome = result.map_err(VmError::Remote);
        self.cast_settled(&op, outcome.as_ref());

        if let Err(e) = self.send(&reply) {
            warn!(vm = %self.name, tunnel, error = %e, "cannot answer call");
        }
    }

    /// Rejects the Isolate's tunnel, if the message named one, and reports a
    /// protocol error.
    fn refuse(&self, tunnel: Option<u64>, reason: String) {
        warn!(vm = %self.name, tunnel = ?tunnel, reason = %reason, "protocol error");
        if let Some(tunnel) = tunnel {
            let reject = Message::Reject { tunnel, error: reason.clone() };
            if let Err(e) = self.send(&reject) {
                warn!(vm = %self.name, tunnel, error = %e, "cannot reject tunnel");
            }
        }
        self.worker_error(&reason);
    }

    // --- Events ---

    fn worker_error(&self, reason: &str) {
        self.cast_raw(format!("vm:{}:worker:error", self.name), json!({ "error": reason }));
    }

    fn cast(&self, op: &str, namespace: Option<&str>, suffix: Option<&str>, args: &Value) {
        let mut name = format!("vm:{}", self.name);
        for segment in [namespace, Some(op), suffix].into_iter().flatten() {
            name.push(':');
            name.push_str(segment);
        }
        self.cast_raw(name, args.clone());
    }

    fn cast_settled(&self, op: &Op, outcome: std::result::Result<&Value, &VmError>) {
        let mut args = op.args.clone();
        let suffix = match outcome {
            Ok(result) => {
                if let Some(fields) = args.as_object_mut() {
                    fields.insert("result".into(), result.clone());
                }
                "ok"
            }
            Err(error) => {
                if let Some(fields) = args.as_object_mut() {
                    fields.insert("error".into(), Value::String(error.to_string()));
                }
                "error"
            }
        };
        self.cast(op.name, op.namespace.as_deref(), Some(suffix), &args);
    }

    fn cast_raw(&self, name: String, args: Value) {
        let event = Event::new(name, &self.name, args, self.this.clone());
        self.local.cast(&event);
        self.global.cast(&event);
    }
}

impl Drop for VmInner {
    fn drop(&mut self) {
        drop(self.teardown());
    }
}

/// Reads the Isolate's messages in order until the channel closes.
async fn pump(vm: Weak<VmInner>, transport: Arc<dyn Transport>) {
    loop {
        let bytes = match transport.recv().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "transport failed");
                break;
            }
        };
        let Some(inner) = vm.upgrade() else {
            return;
        };
        inner.handle(&bytes);
    }

    if let Some(inner) = vm.upgrade() {
        inner.isolate_exited();
    }
}
