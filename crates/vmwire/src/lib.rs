//! # vmwire
//!
//! The shared protocol between a Controller and its Isolate: validated names,
//! dependencies, the message union, tunnels, dependency ordering, event
//! filters, and the byte transport.

pub mod dependency;
pub mod glob;
pub mod graph;
pub mod ident;
pub mod message;
pub mod transport;
pub mod tunnel;

pub use dependency::Dependency;
pub use message::Message;
pub use transport::Transport;
pub use tunnel::TunnelTable;

/// Namespace created by every Isolate at boot.
pub const DEFAULT_NAMESPACE: &str = "root";

/// Tunnel reserved for the boot handshake.
pub const BOOT_TUNNEL: u64 = 0;
