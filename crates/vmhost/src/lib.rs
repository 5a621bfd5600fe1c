//! # vmhost
//!
//! The Controller side of the sandbox. A [`Host`] creates named [`Vm`]s; each
//! VM runs one Isolate on its own thread and exposes namespaces, dependency
//! installation and execution, predefined host functions and events through
//! an asynchronous, message-only API.

pub mod config;
pub mod error;
pub mod events;
pub mod functions;
pub mod host;
pub mod logging;
pub mod pending;
pub mod vm;

pub use config::VmConfig;
pub use error::LifecycleState;
pub use error::Result;
pub use error::VmError;
pub use events::Event;
pub use events::EventBus;
pub use events::Subscription;
pub use functions::HostFunction;
pub use host::Host;
pub use pending::Pending;
pub use vm::BootTimes;
pub use vm::Vm;
pub use vmguest::IsolateConfig;
pub use vmwire::Dependency;
