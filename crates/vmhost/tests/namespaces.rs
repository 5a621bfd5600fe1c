//! Namespace tree operations through the Controller API.

mod common;

use serde_json::Map;
use serde_json::json;
use vmhost::VmError;

use common::args;
use common::booted;
use common::host;
use common::leaf;
use common::with_imports;

#[tokio::test]
async fn test_tree_reads() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    assert_eq!(vm.list_namespaces()?.await?, vec!["root"]);
    vm.create_namespace("app", None)?.await?;
    vm.create_namespace("app.users", Some("app"))?.await?;
    vm.create_namespace("app.jobs", Some("app"))?.await?;

    assert_eq!(vm.list_namespaces()?.await?, vec!["app", "app.jobs", "app.users", "root"]);
    assert_eq!(vm.get_children("app")?.await?, vec!["app.jobs", "app.users"]);
    assert_eq!(vm.get_ancestors("app.users")?.await?, vec!["app.users", "app"]);
    assert_eq!(vm.pending_tunnels("app")?.await?, 0);

    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_namespace_errors() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    vm.create_namespace("a", None)?.await?;
    let duplicate = vm.create_namespace("a", None)?.await;
    assert_eq!(duplicate, Err(VmError::Remote("namespace 'a' already exists".into())));

    let orphan = vm.create_namespace("b", Some("missing"))?.await;
    assert!(matches!(orphan, Err(VmError::Remote(msg)) if msg.contains("missing")));

    assert!(matches!(vm.create_namespace("a..b", None), Err(VmError::Validation(_))));
    assert!(matches!(vm.list_installed("if"), Err(VmError::Validation(_))));
    assert!(vm.get_children("nowhere")?.await.is_err());

    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_inheritance_and_shadowing() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.create_namespace("a", None)?.await?;
    vm.create_namespace("b", Some("a"))?.await?;
    vm.create_namespace("c", Some("a"))?.await?;

    vm.install("a", leaf("x", "return 1;"))?.await?;
    let read = with_imports("read", "return x;", &[("x", "x")]);
    assert_eq!(vm.execute("b", read, Map::new())?.await?, json!(1));

    // Installs are exclusive along the inheritance chain.
    assert!(vm.install("a", leaf("x", "return 2;"))?.await.is_err());
    assert!(vm.install("b", leaf("x", "return 2;"))?.await.is_err());
    assert!(vm.list_installed("b")?.await?.is_empty());

    // A child's own entry shadows a later parent entry, for the child only.
    vm.install("c", leaf("y", "return 'child';"))?.await?;
    vm.install("a", leaf("y", "return 'parent';"))?.await?;
    let read_y = with_imports("read", "return y;", &[("y", "y")]);
    assert_eq!(vm.execute("c", read_y.clone(), Map::new())?.await?, json!("child"));
    assert_eq!(vm.execute("b", read_y, Map::new())?.await?, json!("parent"));

    assert_eq!(vm.list_installed("a")?.await?, vec!["x", "y"]);
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_delete_cascades() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.create_namespace("a", None)?.await?;
    vm.create_namespace("b", Some("a"))?.await?;

    let stuck = vm.execute("b", leaf("wait", "return await new Promise(() => {});"), Map::new())?;
    let mut removed = vm.delete_namespace("a")?.await?;
    removed.sort();
    assert_eq!(removed, vec!["a", "b"]);

    assert_eq!(stuck.await, Err(VmError::NamespaceDeleted("b".into())));
    assert_eq!(vm.list_namespaces()?.await?, vec!["root"]);

    // The names are free again and start empty.
    vm.create_namespace("a", None)?.await?;
    assert!(vm.list_installed("a")?.await?.is_empty());
    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_links_and_mutes() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;
    vm.create_namespace("a", None)?.await?;
    vm.create_namespace("b", None)?.await?;

    vm.link_namespaces("a", "b")?.await?;
    vm.link_namespaces("a", "b")?.await?;
    assert_eq!(vm.list_linked_to("a")?.await?, vec!["b"]);
    assert_eq!(vm.list_linked_from("b")?.await?, vec!["a"]);
    assert!(vm.list_linked_to("b")?.await?.is_empty());

    assert!(vm.unlink_namespaces("a", "b")?.await?);
    assert!(!vm.unlink_namespaces("a", "b")?.await?);

    assert!(!vm.is_muted("a")?.await?);
    assert!(!vm.mute_namespace("a")?.await?);
    assert!(vm.mute_namespace("a")?.await?);
    assert!(vm.is_muted("a")?.await?);
    assert!(vm.unmute_namespace("a")?.await?);
    assert!(!vm.is_muted("a")?.await?);

    vm.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_arguments_are_bound_by_name() -> anyhow::Result<()> {
    let host = host();
    let vm = booted(&host, "alpha").await?;

    let add = leaf("add", "return a + b;");
    let got = vm.execute("root", add, args(json!({ "a": 2, "b": 3 })))?.await?;
    assert_eq!(got, json!(5));

    assert!(matches!(
        vm.execute("root", leaf("bad", "return 0;"), args(json!({ "if": 1 }))),
        Err(VmError::Validation(_))
    ));
    vm.stop().await?;
    Ok(())
}
