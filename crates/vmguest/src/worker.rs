//! # Isolate thread
//!
//! Each Isolate runs on its own OS thread named `isolate-{vm}`. The thread
//! boots the engine, reports the outcome on the boot tunnel, then handles
//! messages until the Controller closes the channel or the interrupt flag is
//! raised.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::error;
use vmwire::BOOT_TUNNEL;
use vmwire::Message;
use vmwire::transport::IsolatePort;

use crate::config::IsolateConfig;
use crate::isolate::Isolate;

/// Controller-side handle to a running Isolate thread.
pub struct IsolateHandle {
    interrupt: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IsolateHandle {
    /// Raises the interrupt flag. Running guest code is aborted at its next
    /// interrupt check and the thread exits instead of reading more messages.
    pub fn terminate(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the thread to exit. Returns false if it panicked.
    pub fn join(mut self) -> bool {
        match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for IsolateHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawns an Isolate for `vm` on a dedicated thread.
pub fn spawn(vm: &str, port: IsolatePort, config: IsolateConfig) -> std::io::Result<IsolateHandle> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    let name = vm.to_string();

    let thread = std::thread::Builder::new()
        .name(format!("isolate-{}", vm))
        .stack_size(config.thread_stack_size())
        .spawn(move || run(name, port, config, flag))?;

    Ok(IsolateHandle {
        interrupt,
        thread: Some(thread),
    })
}

fn run(vm: String, mut port: IsolatePort, config: IsolateConfig, interrupt: Arc<AtomicBool>) {
    let outbox = port.outbox();
    let report = |message: Message| {
        if let Ok(bytes) = message.encode() {
            let _ = outbox.send(bytes);
        }
    };

    let isolate = match Isolate::boot(&vm, outbox.clone(), config, interrupt.clone()) {
        Ok((isolate, took)) => {
            report(Message::Resolve {
                tunnel: BOOT_TUNNEL,
                payload: serde_json::json!(took.as_secs_f64() * 1000.0),
            });
            isolate
        }
        Err(e) => {
            error!(vm = %vm, error = %e, "isolate failed to boot");
            report(Message::Reject {
                tunnel: BOOT_TUNNEL,
                error: e.to_string(),
            });
            return;
        }
    };

    while let Some(bytes) = port.recv_blocking() {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        isolate.handle(&bytes);
        isolate.drain();
        if isolate.interrupted() {
            break;
        }
    }
    debug!(vm = %vm, "isolate exited");
}
