//! # Predefined host functions
//!
//! Index-addressed table of host callbacks that guest code can call through
//! stubs. An index is stable once assigned; a registration that fails frees
//! its index for the next one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

/// A host callback. Receives the guest's positional arguments; an `Err`
/// rejects the guest's promise with its text.
pub type HostFunction = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

struct Entry {
    namespace: String,
    name: String,
    callback: HostFunction,
}

pub(crate) struct FunctionTable {
    slots: Mutex<Vec<Option<Entry>>>,
}

impl FunctionTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Stores `callback` in the lowest free slot and returns its index.
    pub(crate) fn reserve(&self, namespace: &str, name: &str, callback: HostFunction) -> u32 {
        let mut slots = self.slots.lock();
        let entry = Entry {
            namespace: namespace.to_string(),
            name: name.to_string(),
            callback,
        };
        let idx = match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = Some(entry);
                free
            }
            None => {
                slots.push(Some(entry));
                slots.len() - 1
            }
        };
        idx as u32
    }

    pub(crate) fn release(&self, idx: u32) {
        if let Some(slot) = self.slots.lock().get_mut(idx as usize) {
            *slot = None;
        }
    }

    /// `(namespace, name)` registered at `idx`.
    pub(crate) fn describe(&self, idx: u32) -> Option<(String, String)> {
        self.slots
            .lock()
            .get(idx as usize)
            .and_then(Option::as_ref)
            .map(|entry| (entry.namespace.clone(), entry.name.clone()))
    }

    /// Invokes the callback at `idx`. Unknown indices and panics become
    /// errors; nothing unwinds out of here.
    pub(crate) fn call(&self, idx: u32, args: Vec<Value>) -> Result<Value, String> {
        let callback = self
            .slots
            .lock()
            .get(idx as usize)
            .and_then(Option::as_ref)
            .map(|entry| entry.callback.clone())
            .ok_or_else(|| format!("no predefined function at index {}", idx))?;

        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(args))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(format!("predefined function panicked: {}", message))
            }
        }
    }
}
