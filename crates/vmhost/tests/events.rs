//! Operation events on the VM and host buses, and guest events.

mod common;

use serde_json::json;

use common::booted;
use common::host;
use common::next;
use common::run;

#[tokio::test]
async fn test_operations_cast_before_and_after() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut local = vm.events().subscribe("vm:alpha:a:**");
    let mut global = host.events().subscribe("vm:*:a:createNamespace:*");

    vm.create_namespace("a", None)?.await?;
    assert!(vm.create_namespace("a", None)?.await.is_err());

    let names: Vec<String> = local.drain().into_iter().map(|e| e.name).collect();
    assert_eq!(
        names,
        vec![
            "vm:alpha:a:createNamespace",
            "vm:alpha:a:createNamespace:ok",
            "vm:alpha:a:createNamespace",
            "vm:alpha:a:createNamespace:error",
        ]
    );

    let settled = global.drain();
    assert_eq!(settled.len(), 2);
    assert_eq!(settled[0].vm, "alpha");
    assert_eq!(settled[0].args["name"], json!("a"));
    assert_eq!(settled[1].args["error"], json!("namespace 'a' already exists"));

    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_events_lead_back_to_their_vm() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut created = host.events().subscribe("vm:*:*:createNamespace:ok");

    vm.create_namespace("a", None)?.await?;
    let event = next(&mut created).await;
    let source = event.handle().expect("the vm is still alive");
    assert_eq!(source.name(), "alpha");

    source.create_namespace("b", Some("a"))?.await?;
    assert_eq!(vm.get_children("a")?.await?, vec!["b"]);
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_lifecycle_events() -> anyhow::Result<()> {
    let host = host();
    let mut lifecycle = host.events().subscribe("vm:beta:**");
    let vm = booted(&host, "beta").await?;
    vm.stop().await?;

    let names: Vec<String> = lifecycle.drain().into_iter().map(|e| e.name).collect();
    assert_eq!(
        names,
        vec!["vm:beta:start", "vm:beta:start:ok", "vm:beta:stop", "vm:beta:stop:ok"]
    );
    Ok(())
}

#[tokio::test]
async fn test_guest_events_reach_the_controller() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut hello = vm.events().subscribe("vm:alpha:root:event:hello");

    run(&vm, "root", "__events.cast('hello', 1, 'two'); return 0;").await?;
    let event = next(&mut hello).await;
    assert_eq!(event.args, json!([1, "two"]));

    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_host_emit_reaches_guest_listeners() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut pong = host.events().subscribe("vm:alpha:root:event:pong");

    run(&vm, "root", "__events.on('ping', (n) => __events.cast('pong', n + 1)); return 0;").await?;
    vm.emit("root", "ping", vec![json!(41)])?;
    assert_eq!(next(&mut pong).await.args, json!([42]));

    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_muted_namespace_is_not_forwarded() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut pong = vm.events().subscribe("vm:alpha:root:event:pong");

    run(&vm, "root", "__events.on('ping', (n) => __events.cast('pong', n)); return 0;").await?;
    vm.mute_namespace("root")?.await?;
    vm.emit("root", "ping", vec![json!("muted")])?;
    vm.unmute_namespace("root")?.await?;
    vm.emit("root", "ping", vec![json!("heard")])?;

    assert_eq!(next(&mut pong).await.args, json!(["heard"]));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_linked_namespaces_hear_events() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.create_namespace("source", None)?.await?;
    vm.create_namespace("sink", None)?.await?;
    vm.link_namespaces("source", "sink")?.await?;
    let mut heard = vm.events().subscribe("vm:alpha:sink:event:heard");

    run(&vm, "sink", "__events.on('tick', (n) => __events.cast('heard', n)); return 0;").await?;
    run(&vm, "source", "__events.cast('tick', 7); return 0;").await?;

    assert_eq!(next(&mut heard).await.args, json!([7]));
    vm.stop().await?;
    Ok(())
}
