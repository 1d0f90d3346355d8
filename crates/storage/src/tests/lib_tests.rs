use super::*;
use serde_json::json;

#[tokio::test]
async fn memory_store_round_trips_and_notifies() {
    let store = MemoryStore::new();
    let mut changes = store.subscribe();

    store.set("connectedDApps", json!([])).await.expect("set");
    assert_eq!(store.get("connectedDApps").await.expect("get"), Some(json!([])));

    let change = changes.recv().await.expect("change");
    assert_eq!(change.key, "connectedDApps");
    assert_eq!(change.old_value, None);
    assert_eq!(change.new_value, Some(json!([])));

    store.remove("connectedDApps").await.expect("remove");
    let change = changes.recv().await.expect("change");
    assert_eq!(change.old_value, Some(json!([])));
    assert_eq!(change.new_value, None);
    assert_eq!(store.get("connectedDApps").await.expect("get"), None);
}

#[tokio::test]
async fn unchanged_writes_are_not_broadcast() {
    let store = MemoryStore::new();
    store.set("k", json!(1)).await.expect("set");
    let mut changes = store.subscribe();

    store.set("k", json!(1)).await.expect("same value");
    store.remove("missing").await.expect("remove missing");
    store.set("k", json!(2)).await.expect("new value");

    let change = changes.recv().await.expect("change");
    assert_eq!(change.new_value, Some(json!(2)));
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn typed_helpers_report_shape_mismatch() {
    let store = MemoryStore::new();
    store_json(&store, "numbers", &vec![1u32, 2, 3]).await.expect("store");
    let loaded: Option<Vec<u32>> = load_json(&store, "numbers").await.expect("load");
    assert_eq!(loaded, Some(vec![1, 2, 3]));

    let err = load_json::<String>(&store, "numbers").await.expect_err("shape");
    assert!(err.to_string().contains("numbers"));
    assert_eq!(load_json::<String>(&store, "absent").await.expect("load"), None);
}

#[tokio::test]
async fn sqlite_store_round_trips_in_memory() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
    let mut changes = store.subscribe();

    store
        .set("pendingRequest:1", json!({ "kind": "connect" }))
        .await
        .expect("set");
    store
        .set("pendingRequest:1", json!({ "kind": "transaction" }))
        .await
        .expect("overwrite");
    assert_eq!(
        store.get("pendingRequest:1").await.expect("get"),
        Some(json!({ "kind": "transaction" }))
    );

    let first = changes.recv().await.expect("first");
    assert_eq!(first.old_value, None);
    let second = changes.recv().await.expect("second");
    assert_eq!(second.old_value, Some(json!({ "kind": "connect" })));

    store.remove("pendingRequest:1").await.expect("remove");
    assert_eq!(store.get("pendingRequest:1").await.expect("get"), None);
}

#[tokio::test]
async fn sqlite_store_creates_database_file_and_persists() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("wallet.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    {
        let store = SqliteStore::new(&database_url).await.expect("db");
        store.set("connectedDApps", json!(["a"])).await.expect("set");
        store.pool().close().await;
    }

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    let reopened = SqliteStore::new(&database_url).await.expect("reopen");
    assert_eq!(
        reopened.get("connectedDApps").await.expect("get"),
        Some(json!(["a"]))
    );
}

#[test]
fn memory_urls_have_no_file_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("sqlite:file:wallet?mode=memory&cache=shared"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/wallet.db?mode=rwc"),
        Some(PathBuf::from("./data/wallet.db"))
    );
}

#[test]
fn both_sqlite_url_forms_resolve_to_a_file_path() {
    assert_eq!(sqlite_path("sqlite:wallet.db"), Some(PathBuf::from("wallet.db")));
    assert_eq!(
        sqlite_path("sqlite:data/wallet.db?mode=rwc"),
        Some(PathBuf::from("data/wallet.db"))
    );
    assert_eq!(sqlite_path("sqlite://"), None);
    assert_eq!(sqlite_path("postgres://localhost/wallet"), None);
}

#[test]
fn parent_dir_is_created_for_short_sqlite_urls() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let nested = temp_root.path().join("profiles").join("default");
    let database_url = format!("sqlite:{}/wallet.db", nested.to_string_lossy().replace('\\', "/"));

    ensure_sqlite_parent_dir_exists(&database_url).expect("create parent");
    assert!(nested.is_dir());

    ensure_sqlite_parent_dir_exists("sqlite:wallet.db").expect("bare file name");
    ensure_sqlite_parent_dir_exists("sqlite::memory:").expect("memory");
}
