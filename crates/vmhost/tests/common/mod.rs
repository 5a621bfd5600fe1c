//! Shared fixtures for the Controller integration tests.
#![allow(dead_code)]

use std::time::Duration;

use serde_json::Map;
use serde_json::Value;
use vmhost::Dependency;
use vmhost::Event;
use vmhost::Host;
use vmhost::Subscription;
use vmhost::Vm;
use vmhost::VmConfig;
use vmhost::logging;

/// Boot deadline for tests; debug builds of the engine boot slowly.
pub const BOOT: Duration = Duration::from_secs(10);

pub fn host() -> Host {
    logging::init();
    Host::with_config(VmConfig::default().with_boot_timeout(BOOT))
}

/// Creates and boots a VM.
pub async fn booted(host: &Host, name: &str) -> anyhow::Result<Vm> {
    let vm = host.create_vm(name)?;
    vm.start(None)?.await?;
    Ok(vm)
}

pub fn leaf(name: &str, code: &str) -> Dependency {
    Dependency::leaf(name, code).expect("valid dependency")
}

pub fn with_imports(name: &str, code: &str, imports: &[(&str, &str)]) -> Dependency {
    Dependency::new(name, code, imports.iter().copied()).expect("valid dependency")
}

pub fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("arguments must be an object, got {}", other),
    }
}

/// Runs `code` as a throwaway dependency in `namespace`.
pub async fn run(vm: &Vm, namespace: &str, code: &str) -> vmhost::Result<Value> {
    vm.execute(namespace, leaf("main", code), Map::new())?.await
}

/// Next event on `subscription`, failing the test if none arrives.
pub async fn next(subscription: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("event within 5s")
        .expect("bus alive")
}
