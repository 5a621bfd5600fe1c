use std::time::Duration;

use vmwire::graph;
use vmwire::ident;
use vmwire::transport;

/// Lifecycle of a VM. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Booting,
    Running,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Booting => write!(f, "booting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors surfaced by the Controller API.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Malformed identifier, namespace, code, timeout or arguments. Raised
    /// before anything is sent.
    Validation(ident::Error),
    /// The operation is not valid in the VM's current state.
    State { op: &'static str, state: LifecycleState },
    /// Another live VM already uses this name.
    NameTaken(String),
    /// The Isolate sent something the Controller cannot act on.
    Protocol(String),
    /// A dependency batch cannot be ordered.
    Dependency(graph::Error),
    /// The Isolate did not boot within the deadline.
    Timeout(Duration),
    /// The VM was stopped while the request was outstanding.
    Stopped,
    /// The Isolate thread went away while the VM was not stopped.
    IsolateExited,
    /// The namespace owning the request was deleted.
    NamespaceDeleted(String),
    /// The Isolate rejected the request; the text is the Isolate's message.
    Remote(String),
    Transport(transport::Error),
    /// A reply payload did not have the expected shape.
    Decode(String),
    /// The Isolate thread or a Controller task could not be started.
    Spawn(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "validation error: {}", e),
            Self::State { op, state } => write!(f, "cannot {} while {}", op, state),
            Self::NameTaken(name) => write!(f, "a vm named '{}' already exists", name),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Dependency(e) => write!(f, "{}", e),
            Self::Timeout(after) => write!(f, "isolate did not boot within {}ms", after.as_millis()),
            Self::Stopped => write!(f, "vm stopped"),
            Self::IsolateExited => write!(f, "isolate exited"),
            Self::NamespaceDeleted(name) => write!(f, "namespace '{}' was deleted", name),
            Self::Remote(msg) => write!(f, "{}", msg),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Decode(msg) => write!(f, "unexpected reply: {}", msg),
            Self::Spawn(msg) => write!(f, "cannot spawn: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

impl From<ident::Error> for VmError {
    fn from(e: ident::Error) -> Self {
        Self::Validation(e)
    }
}

impl From<graph::Error> for VmError {
    fn from(e: graph::Error) -> Self {
        Self::Dependency(e)
    }
}

impl From<transport::Error> for VmError {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, VmError>;
