//! # Host
//!
//! Composition root for VMs. A [`Host`] owns the name registry and the
//! process-wide event bus every VM it creates casts into.
//!
//! ## Invariants
//!
//! - A name belongs to at most one live VM. Entries are weak: the registry
//!   never keeps a VM alive and never removes one by force; a dropped VM's
//!   name can be taken again.

use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;
use vmwire::ident;

use crate::config::VmConfig;
use crate::error::Result;
use crate::error::VmError;
use crate::events::EventBus;
use crate::vm::Vm;
use crate::vm::VmInner;

pub struct Host {
    vms: DashMap<String, Weak<VmInner>>,
    events: Arc<EventBus>,
    config: VmConfig,
}

impl Host {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            vms: DashMap::new(),
            events: Arc::new(EventBus::new()),
            config,
        }
    }

    /// Creates a VM in the `created` state.
    pub fn create_vm(&self, name: &str) -> Result<Vm> {
        self.create_vm_with(name, self.config.clone())
    }

    /// Creates a VM with its own configuration.
    pub fn create_vm_with(&self, name: &str, config: VmConfig) -> Result<Vm> {
        ident::identifier(name)?;

        let vm = match self.vms.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    return Err(VmError::NameTaken(name.to_string()));
                }
                let vm = Vm::new(name, config, self.events.clone());
                entry.insert(vm.downgrade());
                vm
            }
            Entry::Vacant(entry) => {
                let vm = Vm::new(name, config, self.events.clone());
                entry.insert(vm.downgrade());
                vm
            }
        };
        debug!(vm = %name, "vm created");
        Ok(vm)
    }

    /// The live VM registered under `name`.
    pub fn vm(&self, name: &str) -> Option<Vm> {
        self.vms
            .get(name)
            .and_then(|entry| entry.upgrade())
            .map(Vm::from_inner)
    }

    /// Names of every live VM, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .vms
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// The process-wide bus. Every VM created here casts every event into it
    /// as well as into its own bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}
