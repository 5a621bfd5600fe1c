//! Dependency installation, batch ordering and execution.

mod common;

use rand::seq::SliceRandom;
use serde_json::Map;
use serde_json::json;
use vmhost::VmError;
use vmwire::graph;
use vmwire::ident;

use common::args;
use common::booted;
use common::host;
use common::leaf;
use common::next;
use common::run;
use common::with_imports;

#[tokio::test]
async fn test_install_all_orders_by_imports() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let batch = vec![
        with_imports("b", "return { next: a.value + 1 };", &[("a", "a")]),
        leaf("a", "return { value: 1 };"),
    ];
    vm.install_all("root", batch)?.await?;
    assert_eq!(vm.list_installed("root")?.await?, vec!["a", "b"]);

    let read = with_imports("read", "return b.next;", &[("b", "b")]);
    assert_eq!(vm.execute("root", read, Map::new())?.await?, json!(2));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_install_all_any_input_order() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.create_namespace("base", None)?.await?;
    vm.create_namespace("app", Some("base"))?.await?;
    vm.install("base", leaf("seed", "return 10;"))?.await?;

    let mut batch = vec![
        with_imports("one", "return seed + 1;", &[("seed", "seed")]),
        with_imports("two", "return one + 1;", &[("one", "one")]),
        with_imports("three", "return one + two;", &[("one", "one"), ("two", "two")]),
        with_imports("four", "return three * 2;", &[("three", "three")]),
    ];
    batch.shuffle(&mut rand::thread_rng());
    vm.install_all("app", batch)?.await?;

    let read = with_imports("read", "return four;", &[("four", "four")]);
    assert_eq!(vm.execute("app", read, Map::new())?.await?, json!(46));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_install_all_runs_without_being_awaited() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut settled = vm.events().subscribe("vm:alpha:root:installAll:*");

    let batch = vec![
        with_imports("b", "return a + 1;", &[("a", "a")]),
        leaf("a", "return 1;"),
    ];
    drop(vm.install_all("root", batch)?);

    assert_eq!(next(&mut settled).await.name, "vm:alpha:root:installAll:ok");
    assert_eq!(vm.list_installed("root")?.await?, vec!["a", "b"]);

    let read = with_imports("read", "return b;", &[("b", "b")]);
    assert_eq!(vm.execute("root", read, Map::new())?.await?, json!(2));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_install_all_settles_when_awaited_late() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    let mut settled = vm.events().subscribe("vm:alpha:root:installAll:ok");

    let batch = vm.install_all("root", vec![leaf("a", "return 'ready';")])?;
    next(&mut settled).await;

    let read = with_imports("read", "return a;", &[("a", "a")]);
    let result = vm.execute("root", read, Map::new())?;
    batch.await?;
    assert_eq!(result.await?, json!("ready"));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_install_all_names_unresolved_targets() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let batch = vec![
        leaf("a", "return 1;"),
        with_imports("b", "return z;", &[("z", "zeta")]),
    ];
    let result = vm.install_all("root", batch)?.await;
    let Err(VmError::Dependency(graph::Error::Unresolved(unresolved))) = result else {
        panic!("expected an unresolved batch, got {:?}", result);
    };
    assert_eq!(unresolved, vec![("b".to_string(), vec!["zeta".to_string()])]);

    // Nothing was installed.
    assert!(vm.list_installed("root")?.await?.is_empty());
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_install_all_keeps_prefix_on_failure() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let batch = vec![
        leaf("a", "return 1;"),
        with_imports("b", "throw new Error('broken');", &[("a", "a")]),
    ];
    let result = vm.install_all("root", batch)?.await;
    assert!(matches!(&result, Err(VmError::Remote(msg)) if msg.contains("broken")), "{:?}", result);
    assert_eq!(vm.list_installed("root")?.await?, vec!["a"]);
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_installed_values_are_frozen_and_shared() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.install("root", leaf("config", "return { limit: 3, tags: ['a'] };"))?.await?;

    let mutate = with_imports(
        "mutate",
        "try { config.tags.push('b'); } catch (e) { return 'frozen'; } return 'mutated';",
        &[("config", "config")],
    );
    assert_eq!(vm.execute("root", mutate, Map::new())?.await?, json!("frozen"));

    let read = with_imports("read", "return config.tags.length;", &[("config", "config")]);
    assert_eq!(vm.execute("root", read, Map::new())?.await?, json!(1));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_arguments_cannot_shadow_imports() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.install("root", leaf("x", "return 1;"))?.await?;

    let dependency = with_imports("f", "return x;", &[("x", "x")]);
    let result = vm.execute("root", dependency, args(json!({ "x": 2 })))?.await;
    assert!(matches!(&result, Err(VmError::Remote(msg)) if msg.contains("shadow")), "{:?}", result);
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_imports_are_reported_together() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let dependency = with_imports("f", "return 0;", &[("p", "alpha"), ("q", "beta"), ("r", "alpha")]);
    let result = vm.execute("root", dependency, Map::new())?.await;
    let Err(VmError::Remote(msg)) = result else {
        panic!("expected a remote error, got {:?}", result);
    };
    assert!(msg.contains("alpha, beta"), "{}", msg);
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_executions_do_not_leak_state() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let count = leaf("count", "let seen = []; seen.push(n); return seen.length + n;");
    assert_eq!(vm.execute("root", count.clone(), args(json!({ "n": 1 })))?.await?, json!(2));
    assert_eq!(vm.execute("root", count, args(json!({ "n": 5 })))?.await?, json!(6));

    let leak = run(&vm, "root", "globalThis.leaked = 1; return 0;").await;
    assert!(leak.is_err());
    assert_eq!(run(&vm, "root", "return typeof leaked;").await?, json!("undefined"));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_code_is_checked_before_sending() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let broken = leaf("broken", "return (;");
    assert!(matches!(
        vm.install("root", broken),
        Err(VmError::Validation(ident::Error::Syntax(_)))
    ));

    let smuggled = vmhost::Dependency {
        name: "smuggled".into(),
        code: "return '\u{2028}';".into(),
        imports: Default::default(),
    };
    assert!(matches!(
        vm.execute("root", smuggled, Map::new()),
        Err(VmError::Validation(ident::Error::ForbiddenCharacter { .. }))
    ));
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_sandbox_hides_ambient_state() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    assert!(run(&vm, "root", "return Math.random();").await.is_err());
    assert!(run(&vm, "root", "return Date.now();").await.is_err());
    assert_eq!(
        run(&vm, "root", "return new Date(0).toISOString();").await?,
        json!("1970-01-01T00:00:00.000Z")
    );
    assert_eq!(
        run(&vm, "root", "return new Date('2020-01-01T00:00:00').getTime() === Date.UTC(2020, 0, 1);").await?,
        json!(true)
    );
    assert_eq!(run(&vm, "root", "return typeof setTimeout;").await?, json!("undefined"));
    vm.stop().await?;
    Ok(())
}
