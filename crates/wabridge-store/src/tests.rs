use super::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use wabridge_core::message::GroupInfo;
use wabridge_core::paths::{DbKind, PathResolver};

async fn memory_pool() -> SqlitePool {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .unwrap()
}

async fn test_catalog() -> Catalog {
    Catalog::from_pool(memory_pool().await).await.unwrap()
}

async fn test_bot_store() -> BotStore {
    BotStore::from_pool(memory_pool().await).await.unwrap()
}

fn group(jid: &str, name: &str) -> GroupInfo {
    GroupInfo {
        jid: jid.to_string(),
        name: name.to_string(),
        description: None,
        participants: 0,
        is_admin: false,
    }
}

#[tokio::test]
async fn test_catalog_add_and_list() {
    let catalog = test_catalog().await;
    let paths = PathResolver::new(".");
    let a = catalog
        .add(
            "6281",
            &paths.db_path(111, "6281", DbKind::Upstream),
            &paths.db_path(111, "6281", DbKind::BotData),
        )
        .await
        .unwrap();
    let b = catalog
        .add(
            "6282",
            &paths.db_path(111, "6282", DbKind::Upstream),
            &paths.db_path(111, "6282", DbKind::BotData),
        )
        .await
        .unwrap();
    assert!(a < b);

    let accounts = catalog.list().await.unwrap();
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].id, a);
    assert_eq!(accounts[0].status, AccountStatus::Active);
    assert_eq!(
        accounts[0].upstream_db_path,
        "DB USER TELEGRAM/111/whatsmeow-111-6281.db"
    );
    assert_eq!(accounts[0].operator_id(), Some(111));
}

#[tokio::test]
async fn test_catalog_readd_replaces_paths_in_place() {
    let catalog = test_catalog().await;
    let id = catalog
        .add("6289", Path::new("whatsmeow-111-6289.db"), Path::new("bot_data-111-6289.db"))
        .await
        .unwrap();
    let again = catalog
        .add(
            "6289",
            Path::new("DB USER TELEGRAM/111/whatsmeow-111-6289.db"),
            Path::new("DB USER TELEGRAM/111/bot_data-111-6289.db"),
        )
        .await
        .unwrap();
    assert_eq!(id, again);
    assert_eq!(catalog.count().await.unwrap(), 1);
    let account = catalog.get(id).await.unwrap().unwrap();
    assert_eq!(
        account.bot_db_path,
        "DB USER TELEGRAM/111/bot_data-111-6289.db"
    );
}

#[tokio::test]
async fn test_catalog_status_and_remove() {
    let catalog = test_catalog().await;
    let id = catalog
        .add("6281", Path::new("u.db"), Path::new("b.db"))
        .await
        .unwrap();

    assert!(catalog.update_status(id, AccountStatus::Inactive).await.unwrap());
    // No change, no update.
    assert!(!catalog.update_status(id, AccountStatus::Inactive).await.unwrap());
    assert_eq!(
        catalog.get(id).await.unwrap().unwrap().status,
        AccountStatus::Inactive
    );

    catalog
        .update_paths(id, Path::new("u2.db"), Path::new("b2.db"))
        .await
        .unwrap();
    let found = catalog
        .find_by_upstream_path(Path::new("u2.db"))
        .await
        .unwrap();
    assert_eq!(found.map(|a| a.id), Some(id));

    assert!(catalog.remove(id).await.unwrap());
    assert!(!catalog.remove(id).await.unwrap());
    assert!(catalog.get(id).await.unwrap().is_none());
    assert!(catalog.get_by_phone("6281").await.unwrap().is_none());
}

#[tokio::test]
async fn test_activity_scoped_by_operator() {
    let catalog = test_catalog().await;
    catalog
        .log_activity(&ActivityEntry::ok(111, "pair", "paired 6281"))
        .await
        .unwrap();
    catalog
        .log_activity(
            &ActivityEntry::failed(222, "join", "join failed", "not-authorized")
                .with_metadata(serde_json::json!({"group": "x@g.us"})),
        )
        .await
        .unwrap();
    catalog
        .log_activity(&ActivityEntry::ok(111, "rename", "renamed 3 groups"))
        .await
        .unwrap();

    let logs = catalog.recent_activity(111, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.operator_id == 111));
    assert_eq!(logs[0].action, "rename");

    let other = catalog.recent_activity(222, 10).await.unwrap();
    assert_eq!(other.len(), 1);
    assert!(!other[0].success);
    assert!(other[0].metadata_json.as_deref().unwrap().contains("x@g.us"));
}

#[tokio::test]
async fn test_statistics_increment() {
    let catalog = test_catalog().await;
    assert_eq!(catalog.stat(stats::BULK_UPDATED).await.unwrap(), 0);
    catalog.increment_stat(stats::BULK_UPDATED, 3).await.unwrap();
    catalog.increment_stat(stats::BULK_UPDATED, 2).await.unwrap();
    assert_eq!(catalog.stat(stats::BULK_UPDATED).await.unwrap(), 5);
}

#[tokio::test]
async fn test_bot_store_group_cache() {
    let store = test_bot_store().await;
    store.upsert_group("1@g.us", "Alpha").await.unwrap();
    let n = store
        .upsert_groups(&[group("1@g.us", "Alpha Team"), group("2@g.us", "Beta")])
        .await
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(store.group_count().await.unwrap(), 2);

    let all = store.list_groups(None).await.unwrap();
    assert_eq!(all[0].group_name, "Alpha Team");

    let found = store.list_groups(Some("beta")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].group_jid, "2@g.us");

    store.remove_group("2@g.us").await.unwrap();
    assert_eq!(store.group_count().await.unwrap(), 1);

    let stats = store.statistics().await.unwrap();
    assert!(stats.contains(&(stats::GROUPS_CACHED.to_string(), 2)));
}

#[tokio::test]
async fn test_bot_store_message_log() {
    let store = test_bot_store().await;
    store.log_message("628@s.whatsapp.net", "hello").await.unwrap();
    store.log_message("628@s.whatsapp.net", "again").await.unwrap();
    assert_eq!(store.message_count().await.unwrap(), 2);
    let stats = store.statistics().await.unwrap();
    assert!(stats.contains(&(stats::MESSAGES_SEEN.to_string(), 2)));
}

#[tokio::test]
async fn test_bot_store_open_existing_never_creates() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("bot_data-111-6281.db");

    let err = BotStore::open_existing(&path).await.err().unwrap();
    assert!(matches!(err, BridgeError::Db(_)));
    assert!(!path.exists());

    BotStore::open(&path).await.unwrap().close().await;
    let store = BotStore::open_existing(&path).await.unwrap();
    store.upsert_group("1@g.us", "One").await.unwrap();
    assert_eq!(store.group_count().await.unwrap(), 1);
    store.close().await;
}

#[tokio::test]
async fn test_validate_device_store_states() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("whatsmeow-1-628.db");
    assert_eq!(
        validate_device_store(&path).await,
        DeviceValidation::MissingFile
    );

    let plain = tmp.path().join("plain.db");
    open_pool(&plain, 1).await.unwrap().close().await;
    assert_eq!(
        validate_device_store(&plain).await,
        DeviceValidation::NoDeviceTable
    );

    let pool = device::init_device_store(&path).await.unwrap();
    assert_eq!(
        validate_device_store(&path).await,
        DeviceValidation::EmptyDeviceTable
    );

    device::write_identity_row(&pool, b"identity").await.unwrap();
    pool.close().await;
    assert!(validate_device_store(&path).await.is_valid());
}

#[tokio::test]
async fn test_validate_legacy_device_table() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("legacy.db");
    let pool = open_pool(&path, 1).await.unwrap();
    sqlx::raw_sql(
        "CREATE TABLE whatsmeow_device (jid TEXT PRIMARY KEY);
         INSERT INTO whatsmeow_device (jid) VALUES ('628@s.whatsapp.net');",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;
    assert!(validate_device_store(&path).await.is_valid());
}

#[tokio::test]
async fn test_pool_registry_swaps_on_current_change() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Arc::new(PathResolver::new(tmp.path()));
    let pools = PoolRegistry::with_close_delay(paths.clone(), Duration::from_millis(10));

    assert!(pools.bot_store().await.is_err());

    paths.set_current(111, "6281");
    let first = pools.bot_store().await.unwrap();
    first.upsert_group("1@g.us", "One").await.unwrap();
    assert_eq!(
        pools.cached_bot_path().await.unwrap(),
        paths.db_path(111, "6281", DbKind::BotData)
    );

    // Same account: same store.
    let again = pools.bot_store().await.unwrap();
    assert_eq!(again.group_count().await.unwrap(), 1);

    paths.set_current(111, "6282");
    let second = pools.bot_store().await.unwrap();
    assert_eq!(second.group_count().await.unwrap(), 0);
    assert_eq!(
        pools.cached_bot_path().await.unwrap(),
        paths.db_path(111, "6282", DbKind::BotData)
    );

    pools.close_all().await;
    assert!(pools.cached_bot_path().await.is_none());
}

#[tokio::test]
async fn test_upstream_pool_requires_existing_store() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Arc::new(PathResolver::new(tmp.path()));
    let pools = PoolRegistry::new(paths.clone());
    paths.set_current(7, "6281");
    assert!(pools.upstream_pool().await.is_err());

    let upstream = paths.db_path(7, "6281", DbKind::Upstream);
    device::init_device_store(&upstream).await.unwrap().close().await;
    let pool = pools.upstream_pool().await.unwrap();
    assert!(db_size(&pool).await.unwrap() > 0);
    pools.release(&upstream).await;
}

#[tokio::test]
async fn test_backup_account_writes_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("whatsmeow-1-628.db");
    let pool = device::init_device_store(&source).await.unwrap();
    device::write_identity_row(&pool, b"id").await.unwrap();
    pool.close().await;

    let target = backup::backup_account(&source, &tmp.path().join("backup"), "628", 1)
        .await
        .unwrap();
    let name = target.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("account_628_1_"));
    assert!(name.ends_with(".db"));
    assert!(validate_device_store(&target).await.is_valid());
}

#[test]
fn test_backup_file_name_shape() {
    use chrono::TimeZone;
    let at = chrono::Local
        .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
        .single()
        .unwrap();
    assert_eq!(
        backup::backup_file_name("6281", 9, at),
        "account_6281_9_20260304_050607.db"
    );
}
