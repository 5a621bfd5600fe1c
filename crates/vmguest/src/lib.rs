//! # vmguest
//!
//! The Isolate side of the sandbox: a QuickJS engine behind a message
//! channel, with a namespace tree of installed guest values, a sandboxed
//! global environment, dependency execution, host-function stubs and
//! per-namespace events.
//!
//! ## Philosophy
//!
//! - **Message-Only**: The Controller never touches engine state. Everything
//!   arrives as a [`vmwire::Message`] and leaves as one.
//! - **Single-Threaded**: One thread owns the engine. Messages are handled
//!   one at a time, to completion.
//! - **Closed World**: Guest code sees a pruned, patched and frozen global
//!   object and nothing else from the host.

pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod isolate;
pub mod namespace;
pub mod sandbox;
pub mod syntax;
pub mod worker;


pub use config::IsolateConfig;
pub use error::Error;
pub use isolate::Isolate;
pub use worker::IsolateHandle;
pub use worker::spawn;
