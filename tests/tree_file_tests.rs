//! Tree File Integration Tests
//!
//! Two independent registries stand in for two processes sharing one file:
//! they share nothing in memory, so only the lock file and reloads keep
//! their updates from clobbering each other.

use massive_tree::path;
use massive_tree::storage::{IdGenerator, MessagePackCodec};
use massive_tree::{AdapterRegistry, Config, Database, TreeAdapter, TreeOptions};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

fn process_view(file: &std::path::Path) -> Arc<Database> {
    let options = TreeOptions::new(file)
        .multiprocess(true)
        .registry(Arc::new(AdapterRegistry::new()));
    let adapter = TreeAdapter::new(options).expect("tree adapter");
    Arc::new(Database::single(Arc::new(adapter)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_views_never_lose_increments() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("shared.json");
    let first = process_view(&file);
    let second = process_view(&file);

    let mut tasks = Vec::new();
    for view in [first.clone(), second.clone()] {
        for _ in 0..25 {
            let view = view.clone();
            tasks.push(tokio::spawn(async move { view.inc(&path!["n"], 1).await }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(first.get(&path!["n"]).await.unwrap(), Some(json!(50)));
    assert_eq!(second.get(&path!["n"]).await.unwrap(), Some(json!(50)));
}

#[tokio::test]
async fn test_reads_see_other_view_writes() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("shared.json");
    let first = process_view(&file);
    let second = process_view(&file);

    assert_eq!(second.get(&path!["k"]).await.unwrap(), None);
    first.set(&path!["k"], Some(json!("v"))).await.unwrap();
    assert_eq!(second.get(&path!["k"]).await.unwrap(), Some(json!("v")));
}

#[tokio::test]
async fn test_reopen_msgpack_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("tree.mp");
    let open = || {
        let options = TreeOptions::new(&file)
            .codec(Arc::new(MessagePackCodec))
            .registry(Arc::new(AdapterRegistry::new()));
        Database::single(Arc::new(TreeAdapter::new(options).unwrap()))
    };

    let db = open();
    let created = db.add(&path!["posts"], json!({"title": "hello"})).await.unwrap();
    db.disconnect().await.unwrap();

    let reopened = open();
    assert_eq!(reopened.get(&created).await.unwrap(), Some(json!({"title": "hello"})));
    assert_eq!(reopened.len(&path!["posts"]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_database_built_from_config_file() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("massive-tree.toml");
    let mut config_file = std::fs::File::create(&config_path).unwrap();
    writeln!(
        config_file,
        r#"
[database]
lazy_connect = false
timeout = 500

[ids]
length = 12
"#
    )
    .unwrap();

    let config = Config::from_file(&config_path).unwrap();
    assert_eq!(config.database.write_budget(), Some(std::time::Duration::from_millis(500)));

    let mut options = TreeOptions::new(dir.path().join("db.json")).registry(Arc::new(AdapterRegistry::new()));
    options.ids = IdGenerator::new(&config.ids).unwrap();
    let db = Database::new(vec![Arc::new(TreeAdapter::new(options).unwrap())], config.database.clone()).unwrap();
    assert!(db.get(&path!["k"]).await.is_err());

    db.connect().await.unwrap();
    let created = db.add(&path!["items"], json!(1)).await.unwrap();
    assert_eq!(created.last().map(str::len), Some(12));
}
