//! VM lifecycle: boot, stop, deadlines and the name registry.

mod common;

use std::time::Duration;

use serde_json::Map;
use vmhost::IsolateConfig;
use vmhost::LifecycleState;
use vmhost::VmConfig;
use vmhost::VmError;
use vmwire::ident;

use common::BOOT;
use common::booted;
use common::host;
use common::leaf;

#[tokio::test]
async fn test_start_then_stop() -> anyhow::Result<()> {
    let host = host();
    let vm = host.create_vm("alpha")?;
    assert_eq!(vm.state(), LifecycleState::Created);

    let times = vm.start(None)?.await?;
    assert_eq!(vm.state(), LifecycleState::Running);
    assert!(times.isolate_ms >= 0.0);
    assert!(times.host_ms >= times.isolate_ms);

    vm.stop().await?;
    assert_eq!(vm.state(), LifecycleState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_start_is_only_valid_once() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    assert!(matches!(
        vm.start(None),
        Err(VmError::State { op: "start", state: LifecycleState::Running })
    ));

    vm.stop().await?;
    assert!(matches!(
        vm.start(None),
        Err(VmError::State { op: "start", state: LifecycleState::Stopped })
    ));
    Ok(())
}

#[tokio::test]
async fn test_stop_settles_before_boot() -> anyhow::Result<()> {
    let host = host();
    let vm = host.create_vm("alpha")?;
    let boot = vm.start(None)?;

    vm.stop().await?;
    assert_eq!(boot.await, Err(VmError::Stopped));
    assert_eq!(vm.state(), LifecycleState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_second_stop_is_a_no_op() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut stops = vm.events().subscribe("vm:alpha:stop");

    vm.stop().await?;
    vm.stop().await?;
    assert_eq!(stops.drain().len(), 1);

    // Stopping a VM that never started is also fine.
    let idle = host.create_vm("beta")?;
    idle.stop().await?;
    assert_eq!(idle.state(), LifecycleState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_stop_rejects_outstanding_requests_once() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let forever = vm.execute("root", leaf("forever", "return await new Promise(() => {});"), Map::new())?;
    let spinning = vm.execute("root", leaf("spin", "while (true) {}"), Map::new())?;

    vm.stop().await?;
    assert_eq!(forever.await, Err(VmError::Stopped));
    assert_eq!(spinning.await, Err(VmError::Stopped));
    Ok(())
}

#[tokio::test]
async fn test_boot_deadline() -> anyhow::Result<()> {
    let host = host();
    let vm = host.create_vm("alpha")?;

    let result = vm.start(Some(Duration::from_micros(1)))?.await;
    assert_eq!(result, Err(VmError::Timeout(Duration::from_micros(1))));
    assert_eq!(vm.state(), LifecycleState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_isolate_boot_failure_stops_the_vm() -> anyhow::Result<()> {
    let host = host();
    let config = VmConfig::default()
        .with_boot_timeout(BOOT)
        .with_isolate(IsolateConfig::default().with_memory_limit(64 * 1024));
    let vm = host.create_vm_with("starved", config)?;

    let result = vm.start(None)?.await;
    let Err(VmError::Remote(message)) = &result else {
        panic!("expected the isolate to refuse to boot, got {:?}", result);
    };
    assert!(!message.is_empty());
    assert_ne!(message, "null");
    assert_eq!(vm.state(), LifecycleState::Stopped);

    assert!(matches!(vm.create_namespace("a", None), Err(VmError::State { .. })));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_boot_deadline_is_bounded() -> anyhow::Result<()> {
    let host = host();
    let vm = host.create_vm("alpha")?;
    let max = host.config().max_boot_timeout;

    assert!(matches!(
        vm.start(Some(Duration::ZERO)),
        Err(VmError::Validation(ident::Error::Timeout { .. }))
    ));
    assert!(matches!(
        vm.start(Some(max + Duration::from_millis(1))),
        Err(VmError::Validation(ident::Error::Timeout { .. }))
    ));
    assert_eq!(vm.state(), LifecycleState::Created);

    vm.start(Some(BOOT))?.await?;
    Ok(())
}

#[tokio::test]
async fn test_requests_need_a_running_vm() -> anyhow::Result<()> {
    let host = host();
    let vm = host.create_vm("alpha")?;

    assert!(matches!(
        vm.list_namespaces(),
        Err(VmError::State { op: "listNamespaces", state: LifecycleState::Created })
    ));
    assert!(matches!(
        vm.emit("root", "tick", vec![]),
        Err(VmError::State { op: "emit", state: LifecycleState::Created })
    ));

    vm.start(None)?.await?;
    vm.stop().await?;
    assert!(matches!(
        vm.create_namespace("a", None),
        Err(VmError::State { op: "createNamespace", state: LifecycleState::Stopped })
    ));
    Ok(())
}

#[tokio::test]
async fn test_vm_names_are_unique_while_alive() -> anyhow::Result<()> {
    let host = host();
    let first = host.create_vm("alpha")?;
    assert_eq!(host.create_vm("alpha").err(), Some(VmError::NameTaken("alpha".into())));
    assert_eq!(host.names(), vec!["alpha".to_string()]);
    assert!(host.vm("alpha").is_some());

    drop(first);
    assert!(host.vm("alpha").is_none());
    assert!(host.names().is_empty());
    host.create_vm("alpha")?;

    assert!(matches!(host.create_vm("1alpha"), Err(VmError::Validation(_))));
    assert!(matches!(host.create_vm("while"), Err(VmError::Validation(_))));
    Ok(())
}

#[tokio::test]
async fn test_lookup_shares_the_vm() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let found = host.vm("alpha").expect("registered");
    assert_eq!(found.name(), "alpha");
    found.stop().await?;
    assert_eq!(vm.state(), LifecycleState::Stopped);
    Ok(())
}
