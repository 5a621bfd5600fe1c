//! # Transport Abstraction
//!
//! A minimal interface for moving bytes between the Controller and the
//! Isolate.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about messages or
//!   tunnels. It moves opaque buffers.
//! - **Ordered**: Sends are synchronous and enqueue in call order, so the
//!   receiver observes messages exactly in the order they were sent. No
//!   reordering, no loss while both ends are alive.
//! - **Closable**: Closing the Controller end is how an Isolate learns it has
//!   been shut down.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is gone or the channel was closed.
    ConnectionLost(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The Controller's end of a channel to an Isolate.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Enqueues a payload for the peer.
    ///
    /// # Invariants
    /// - Payloads are delivered in the order `send` was called.
    /// - Must return `Err` once the channel is closed.
    /// - Should not interpret the payload content.
    fn send(&self, payload: Vec<u8>) -> Result<()>;

    /// Waits for the next payload; `None` once the peer has hung up.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending half. Idempotent.
    fn close(&self);
}

/// Controller end of an in-process channel pair.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    fn send(&self, payload: Vec<u8>) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::ConnectionLost("transport closed".into()))?;
        tx.send(payload)
            .map_err(|_| Error::ConnectionLost("isolate hung up".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Isolate end of an in-process channel pair.
///
/// The Isolate runs on its own OS thread, outside any async runtime, so this
/// end blocks on receive.
pub struct IsolatePort {
    outbox: Outbox,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl IsolatePort {
    /// Blocks until the next payload arrives; `None` once the Controller end
    /// has been closed or dropped.
    pub fn recv_blocking(&mut self) -> Option<Vec<u8>> {
        self.rx.blocking_recv()
    }

    /// A cloneable sending handle back to the Controller.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }
}

/// Cloneable sending half used by the Isolate.
#[derive(Clone)]
pub struct Outbox {
    tx: Arc<mpsc::UnboundedSender<Vec<u8>>>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx: Arc::new(tx) }
    }

    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| Error::ConnectionLost("controller hung up".into()))
    }
}

/// Creates a connected Controller/Isolate channel pair.
pub fn channel_pair() -> (ChannelTransport, IsolatePort) {
    let (to_isolate, from_controller) = mpsc::unbounded_channel();
    let (to_controller, from_isolate) = mpsc::unbounded_channel();

    let transport = ChannelTransport {
        tx: Mutex::new(Some(to_isolate)),
        rx: tokio::sync::Mutex::new(from_isolate),
    };
    let port = IsolatePort {
        outbox: Outbox::new(to_controller),
        rx: from_controller,
    };
    (transport, port)
}
