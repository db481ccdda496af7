use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wabridge_core::{
    message::{GroupInfo, WaEvent},
    paths::{path_string, DbKind, PathResolver},
    traits::WaClient,
    BridgeError,
};
use wabridge_store::{device, AccountStatus, ActivityEntry, BotStore, Catalog};

use crate::bulk::{BulkConfig, BulkExecutor, BulkProgress, NoProgress, ProgressSink};
use crate::manager::{AccountManager, ManagerDeps};
use crate::pairing::{classify_pair_error, Bootstrapper};
use crate::reactor::Intent;
use crate::reconcile::Reconciler;
use crate::session::{Phase, Timings};
use crate::testing::{
    eventually, seed_account, seed_paired_files, MockBehavior, MockFactory, RecordingNotifier,
};
use crate::OperatorContext;

const OP: i64 = 111;
const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    _tmp: tempfile::TempDir,
    paths: Arc<PathResolver>,
    catalog: Catalog,
    factory: Arc<MockFactory>,
    notifier: Arc<RecordingNotifier>,
    manager: Arc<AccountManager>,
}

impl Harness {
    fn upstream(&self, phone: &str) -> std::path::PathBuf {
        self.paths.db_path(OP, phone, DbKind::Upstream)
    }

    fn bot(&self, phone: &str) -> std::path::PathBuf {
        self.paths.db_path(OP, phone, DbKind::BotData)
    }

    fn files_gone(&self, phone: &str) -> bool {
        [self.upstream(phone), self.bot(phone)]
            .iter()
            .flat_map(|p| wabridge_core::paths::with_sidecars(p))
            .all(|p| !p.exists())
    }
}

async fn harness_with(behavior: MockBehavior, max_accounts: usize) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Arc::new(PathResolver::new(tmp.path()));
    let catalog = Catalog::open(&paths.master_db_path()).await.unwrap();
    let factory = Arc::new(MockFactory::new(behavior));
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = AccountManager::new(ManagerDeps {
        catalog: catalog.clone(),
        paths: paths.clone(),
        factory: factory.clone(),
        notifier: notifier.clone(),
        timings: Timings::fast(),
        max_accounts,
    });
    Harness {
        _tmp: tmp,
        paths,
        catalog,
        factory,
        notifier,
        manager,
    }
}

async fn harness() -> Harness {
    harness_with(MockBehavior::default(), 10).await
}

/// Two paired, connected accounts; the first is current.
async fn two_accounts(h: &Harness) -> (i64, i64) {
    let a = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    let b = seed_account(&h.catalog, &h.paths, OP, "6282").await;
    h.manager.load_all().await.unwrap();
    h.manager.create_client(a).await.unwrap();
    h.manager.create_client(b).await.unwrap();
    h.manager.set_current(a).await.unwrap();
    (a, b)
}

// --- Manager ---

#[tokio::test]
async fn test_load_all_is_lazy() {
    let h = harness().await;
    seed_account(&h.catalog, &h.paths, OP, "6281").await;
    seed_account(&h.catalog, &h.paths, OP, "6282").await;

    assert_eq!(h.manager.load_all().await.unwrap(), 2);
    assert_eq!(h.manager.load_all().await.unwrap(), 0);
    assert_eq!(h.factory.created(), 0);
    let sessions = h.manager.sessions().await;
    assert!(sessions.iter().all(|s| s.phase == Phase::Unconnected));
    assert!(h.manager.current().await.is_none());
}

#[tokio::test]
async fn test_create_client_marks_active_and_set_current_is_idempotent() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.catalog
        .update_status(id, AccountStatus::Inactive)
        .await
        .unwrap();
    h.manager.load_all().await.unwrap();

    h.manager.create_client(id).await.unwrap();
    let row = h.catalog.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, AccountStatus::Active);

    h.manager.set_current(id).await.unwrap();
    h.manager.set_current(id).await.unwrap();
    assert_eq!(h.manager.current().await, Some(id));
    assert_eq!(h.paths.current_bot_db_path(), Some(h.bot("6281")));

    // Already connected: no second client.
    h.manager.create_client(id).await.unwrap();
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn test_create_client_failure_is_connect_error() {
    let behavior = MockBehavior {
        connect_ok: false,
        ..Default::default()
    };
    let h = harness_with(behavior, 10).await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.manager.load_all().await.unwrap();

    let err = h.manager.create_client(id).await.unwrap_err();
    assert!(matches!(err, BridgeError::Connect(_)));
    let row = h.catalog.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, AccountStatus::Inactive);
    assert!(h.manager.client(id).await.is_none());
}

#[tokio::test]
async fn test_set_current_unknown_account_fails() {
    let h = harness().await;
    assert!(matches!(
        h.manager.set_current(42).await,
        Err(BridgeError::Validation(_))
    ));
}

#[tokio::test]
async fn test_remove_deletes_row_and_all_six_files() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    for path in [h.upstream("6281"), h.bot("6281")] {
        for sidecar in &wabridge_core::paths::with_sidecars(&path)[1..] {
            std::fs::write(sidecar, b"").unwrap();
        }
    }
    h.manager.load_all().await.unwrap();
    h.manager.create_client(id).await.unwrap();
    h.manager.set_current(id).await.unwrap();

    assert!(h.manager.remove(id).await.unwrap());
    assert!(h.catalog.get(id).await.unwrap().is_none());
    assert!(h.files_gone("6281"));
    assert!(h.manager.current().await.is_none());
    assert!(h.paths.current().is_none());

    // Repeating is harmless.
    assert!(!h.manager.remove(id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_current_while_logging_activity_leaves_no_files() {
    for round in 0..20 {
        let h = harness().await;
        let id = seed_account(&h.catalog, &h.paths, OP, "625").await;
        h.manager.load_all().await.unwrap();
        h.manager.create_client(id).await.unwrap();
        h.manager.set_current(id).await.unwrap();

        let writer = {
            let manager = h.manager.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    manager
                        .log_activity(ActivityEntry::ok(OP, "note", format!("entry {i}")))
                        .await;
                }
            })
        };
        tokio::task::yield_now().await;
        assert!(h.manager.remove(id).await.unwrap());
        writer.await.unwrap();

        assert!(h.files_gone("625"), "round {round}: account files left behind");
        assert!(h.catalog.get(id).await.unwrap().is_none());
        assert!(h.manager.current().await.is_none());
    }
}

#[tokio::test]
async fn test_group_refresh_after_remove_does_not_recreate_store() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.manager.load_all().await.unwrap();
    h.manager.create_client(id).await.unwrap();

    // Files vanish underneath a live session.
    wabridge_core::paths::remove_db_files(&h.bot("6281")).unwrap();
    assert_eq!(h.manager.refresh_groups_all().await, 0);
    assert!(!h.bot("6281").exists());
}

#[tokio::test]
async fn test_add_then_remove_restores_pre_state() {
    let h = harness().await;
    let before = h.paths.canonical_files();
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    assert!(h.manager.remove(id).await.unwrap());
    assert_eq!(h.catalog.count().await.unwrap(), 0);
    assert_eq!(h.paths.canonical_files(), before);
}

#[tokio::test]
async fn test_validate_reports_device_state() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    assert!(h.manager.validate(id).await.unwrap().is_valid());

    std::fs::remove_file(h.upstream("6281")).unwrap();
    assert!(!h.manager.validate(id).await.unwrap().is_valid());
}

#[tokio::test]
async fn test_sync_status_follows_connection() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.manager.load_all().await.unwrap();
    h.manager.create_client(id).await.unwrap();

    let client = h.factory.client_for(&h.upstream("6281")).unwrap();
    client.drop_connection();
    assert_eq!(h.manager.sync_status(id).await.unwrap(), AccountStatus::Inactive);
    assert_eq!(
        h.catalog.get(id).await.unwrap().unwrap().status,
        AccountStatus::Inactive
    );

    assert_eq!(h.manager.sync_all().await, 0);
    client.connect().await.unwrap();
    assert_eq!(h.manager.sync_all().await, 1);
    assert_eq!(
        h.catalog.get(id).await.unwrap().unwrap().status,
        AccountStatus::Active
    );
}

#[tokio::test]
async fn test_auto_switch_then_realtime_cleanup() {
    let h = harness().await;
    let (a, b) = two_accounts(&h).await;
    let _loop = h.manager.spawn_intent_loop(CancellationToken::new()).unwrap();

    h.factory
        .client_for(&h.upstream("6281"))
        .unwrap()
        .drop_connection();

    let manager = h.manager.clone();
    assert!(eventually(WAIT, || async { manager.current().await == Some(b) }).await);
    assert!(h
        .notifier
        .texts_to(OP)
        .iter()
        .any(|t| t.contains("Switched to account #2")));

    let catalog = h.catalog.clone();
    assert!(eventually(WAIT, || async { catalog.get(a).await.unwrap().is_none() }).await);
    assert!(h.files_gone("6281"));
    assert_ne!(h.manager.current().await, Some(a));
    assert_eq!(h.paths.current_bot_db_path(), Some(h.bot("6282")));
}

#[tokio::test]
async fn test_logged_out_last_account_clears_current() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.manager.load_all().await.unwrap();
    h.manager.create_client(id).await.unwrap();
    h.manager.set_current(id).await.unwrap();
    let _loop = h.manager.spawn_intent_loop(CancellationToken::new()).unwrap();

    h.factory
        .client_for(&h.upstream("6281"))
        .unwrap()
        .emit(WaEvent::LoggedOut);

    let catalog = h.catalog.clone();
    assert!(eventually(WAIT, || async { catalog.count().await.unwrap() == 0 }).await);
    assert!(h.manager.current().await.is_none());
    assert!(h
        .notifier
        .texts_to(OP)
        .iter()
        .any(|t| t.contains("No connected account left")));
}

#[tokio::test]
async fn test_disconnect_after_remove_is_noop() {
    let h = harness().await;
    let (a, b) = two_accounts(&h).await;
    h.manager.set_current(b).await.unwrap();
    h.manager.remove(a).await.unwrap();
    let sent = h.notifier.sent().len();

    h.manager
        .handle_intent(Intent::Disconnected {
            account_id: a,
            logged_out: false,
        })
        .await;

    assert_eq!(h.manager.current().await, Some(b));
    assert_eq!(h.notifier.sent().len(), sent);
    assert!(h.catalog.get(b).await.unwrap().is_some());
}

#[tokio::test]
async fn test_auth_fatal_intent_cancels_work_and_cleans_up() {
    let h = harness().await;
    let (a, b) = two_accounts(&h).await;
    let token = h.manager.work_token(a).await.unwrap();
    let other = h.manager.work_token(b).await.unwrap();

    h.manager
        .handle_intent(Intent::AuthFatal {
            account_id: a,
            reason: "401 unauthorized".into(),
        })
        .await;
    assert!(token.is_cancelled());
    assert!(!other.is_cancelled());

    let catalog = h.catalog.clone();
    assert!(eventually(WAIT, || async { catalog.get(a).await.unwrap().is_none() }).await);
    assert_eq!(h.manager.current().await, Some(b));
}

#[tokio::test]
async fn test_startup_elects_first_connectable_account() {
    let h = harness().await;
    let a = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    seed_account(&h.catalog, &h.paths, OP, "6282").await;

    let report = h.manager.startup().await;
    assert_eq!(report.current, Some(a));
    assert_eq!(h.manager.current().await, Some(a));
    assert_eq!(h.factory.created(), 1);

    assert_eq!(h.manager.connect_remaining().await, 1);
    assert!(h.manager.sessions().await.iter().all(|s| s.connected));
}

#[tokio::test]
async fn test_startup_without_accounts_leaves_current_empty() {
    let h = harness().await;
    let report = h.manager.startup().await;
    assert!(report.current.is_none());
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let h = harness().await;
    two_accounts(&h).await;
    let a_client = h.factory.client_for(&h.upstream("6281")).unwrap();
    h.manager.shutdown().await;
    assert!(!a_client.is_connected());
    assert!(h.manager.pools().cached_bot_path().await.is_none());
}

// --- Reconciler ---

#[tokio::test]
async fn test_reconcile_registers_orphan_pair_and_prunes_missing_row() {
    let h = harness().await;
    seed_paired_files(&h.paths, OP, "6281").await;
    let p2 = h
        .catalog
        .add("6282", &h.upstream("6282"), &h.bot("6282"))
        .await
        .unwrap();

    let report = Reconciler::new(&h.catalog, &h.paths).run().await;
    assert_eq!(report.registered, vec!["6281".to_string()]);
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].0, p2);

    let accounts = h.catalog.list().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].phone, "6281");
    assert_eq!(accounts[0].upstream_db_path, path_string(&h.upstream("6281")));
    assert!(h
        .paths
        .canonical_files()
        .iter()
        .all(|f| f.to_string_lossy().contains("6281")));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness().await;
    seed_paired_files(&h.paths, OP, "6281").await;
    let first = Reconciler::new(&h.catalog, &h.paths).run().await;
    assert!(!first.is_noop());
    let files = h.paths.canonical_files();
    let rows = h.catalog.list().await.unwrap();

    let second = Reconciler::new(&h.catalog, &h.paths).run().await;
    assert!(second.is_noop(), "{second:?}");
    assert_eq!(h.paths.canonical_files(), files);
    assert_eq!(h.catalog.list().await.unwrap(), rows);
}

#[tokio::test]
async fn test_reconcile_migrates_legacy_root_files() {
    let h = harness().await;
    let root = h.paths.root().to_path_buf();
    let legacy_upstream = root.join("whatsmeow-111-6289.db");
    let pool = device::init_device_store(&legacy_upstream).await.unwrap();
    device::write_identity_row(&pool, b"legacy").await.unwrap();
    pool.close().await;
    let legacy_bot = root.join("bot_data-111-6289.db");
    BotStore::open(&legacy_bot).await.unwrap().close().await;

    let report = Reconciler::new(&h.catalog, &h.paths).run().await;
    assert_eq!(report.migrated.len(), 2, "{report:?}");
    assert!(!legacy_upstream.exists());
    assert!(!legacy_bot.exists());
    assert!(h.upstream("6289").exists());
    assert!(h.bot("6289").exists());

    let row = h.catalog.get_by_phone("6289").await.unwrap().unwrap();
    assert_eq!(row.upstream_db_path, path_string(&h.upstream("6289")));
    assert_eq!(row.bot_db_path, path_string(&h.bot("6289")));

    // Already migrated: nothing to do.
    assert!(Reconciler::new(&h.catalog, &h.paths).run().await.is_noop());
}

#[tokio::test]
async fn test_reconcile_repoints_rows_at_legacy_paths() {
    let h = harness().await;
    let root = h.paths.root().to_path_buf();
    let legacy_upstream = root.join("whatsmeow-111-6289.db");
    let legacy_bot = root.join("bot_data-111-6289.db");
    let id = h
        .catalog
        .add("6289", &legacy_upstream, &legacy_bot)
        .await
        .unwrap();
    let pool = device::init_device_store(&legacy_upstream).await.unwrap();
    device::write_identity_row(&pool, b"legacy").await.unwrap();
    pool.close().await;

    let report = Reconciler::new(&h.catalog, &h.paths).run().await;
    assert!(report.repathed.contains(&id));
    let row = h.catalog.get(id).await.unwrap().unwrap();
    assert_eq!(row.upstream_db_path, path_string(&h.upstream("6289")));
}

#[tokio::test]
async fn test_reconcile_deletes_invalid_unregistered_store() {
    let h = harness().await;
    // Schema but no identity row.
    device::init_device_store(&h.upstream("6283"))
        .await
        .unwrap()
        .close()
        .await;
    BotStore::open(&h.bot("6283")).await.unwrap().close().await;

    let report = Reconciler::new(&h.catalog, &h.paths).run().await;
    assert!(report.registered.is_empty());
    assert!(!report.orphans_removed.is_empty());
    assert!(h.files_gone("6283"));
}

// --- Reactor ---

#[tokio::test]
async fn test_group_message_fills_cache() {
    let behavior = MockBehavior {
        groups: vec![GroupInfo {
            jid: "2@g.us".into(),
            name: "Other".into(),
            description: None,
            participants: 3,
            is_admin: true,
        }],
        ..Default::default()
    };
    let h = harness_with(behavior, 10).await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.manager.load_all().await.unwrap();
    h.manager.create_client(id).await.unwrap();

    h.factory
        .client_for(&h.upstream("6281"))
        .unwrap()
        .emit(WaEvent::Message {
            group_jid: Some("1@g.us".into()),
            group_name: Some("Team".into()),
            sender: "628@s.whatsapp.net".into(),
            text: "hi".into(),
            from_me: false,
        });

    let store = BotStore::open(&h.bot("6281")).await.unwrap();
    let reader = store.clone();
    assert!(eventually(WAIT, || async { reader.group_count().await.unwrap() == 2 }).await);
    let names: Vec<String> = store
        .list_groups(None)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.group_name)
        .collect();
    assert_eq!(names, vec!["Other".to_string(), "Team".to_string()]);
    assert_eq!(store.message_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_own_and_direct_messages_are_ignored() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    h.manager.load_all().await.unwrap();
    h.manager.create_client(id).await.unwrap();
    let client = h.factory.client_for(&h.upstream("6281")).unwrap();
    client.emit(WaEvent::Message {
        group_jid: Some("1@g.us".into()),
        group_name: Some("Team".into()),
        sender: "me".into(),
        text: "mine".into(),
        from_me: true,
    });
    client.emit(WaEvent::Message {
        group_jid: None,
        group_name: None,
        sender: "628@s.whatsapp.net".into(),
        text: "dm".into(),
        from_me: false,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let store = BotStore::open(&h.bot("6281")).await.unwrap();
    assert_eq!(store.group_count().await.unwrap(), 0);
    assert_eq!(store.message_count().await.unwrap(), 0);
}

// --- Pairing ---

#[tokio::test]
async fn test_first_pairing_registers_canonical_account() {
    let h = harness().await;
    let boot = Bootstrapper::new(h.manager.clone());

    let id = boot
        .pair(OP, "+62 812-3456-7890", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(id, 1);

    let accounts = h.catalog.list().await.unwrap();
    assert_eq!(accounts.len(), 1);
    let row = &accounts[0];
    assert_eq!(row.phone, "6281234567890");
    assert_eq!(row.upstream_db_path, path_string(&h.upstream("6281234567890")));
    assert_eq!(row.bot_db_path, path_string(&h.bot("6281234567890")));
    assert_eq!(row.status, AccountStatus::Active);
    assert!(row
        .upstream_db_path
        .ends_with("DB USER TELEGRAM/111/whatsmeow-111-6281234567890.db"));

    let (staging_upstream, staging_bot) = h.paths.staging_paths(OP);
    assert!(!staging_upstream.exists());
    assert!(!staging_bot.exists());
    assert!(device::validate_device_store(&h.upstream("6281234567890"))
        .await
        .is_valid());

    assert_eq!(h.manager.current().await, Some(id));
    assert!(!boot.is_pairing(OP));
    let texts = h.notifier.texts_to(OP);
    assert!(texts.iter().any(|t| t.contains("ABCD-1234")));
    assert!(texts.iter().any(|t| t.contains("paired as account #1")));
}

#[tokio::test]
async fn test_pairing_timeout_persists_nothing() {
    let behavior = MockBehavior {
        confirm_after: None,
        ..Default::default()
    };
    let h = harness_with(behavior, 10).await;
    let boot = Bootstrapper::new(h.manager.clone());

    let err = boot
        .pair(OP, "6281234567890", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::PairTimeout(_)));
    assert_eq!(h.catalog.count().await.unwrap(), 0);
    let (staging_upstream, _) = h.paths.staging_paths(OP);
    assert!(!staging_upstream.exists());
    assert!(h
        .notifier
        .sent()
        .iter()
        .flat_map(|m| m.keyboard.iter().flatten())
        .any(|b| b.callback_data == "pair:retry:6281234567890"));
}

#[tokio::test]
async fn test_pairing_cancel_aborts_poll() {
    let behavior = MockBehavior {
        confirm_after: None,
        ..Default::default()
    };
    let h = harness_with(behavior, 10).await;
    let boot = Arc::new(Bootstrapper::new(h.manager.clone()));
    let cancel = CancellationToken::new();

    let task = {
        let boot = boot.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { boot.pair(OP, "6281234567890", cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    cancel.cancel();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)));
    assert_eq!(h.catalog.count().await.unwrap(), 0);
    assert!(!boot.is_pairing(OP));
}

#[tokio::test]
async fn test_pairing_code_failure_is_classified() {
    let behavior = MockBehavior {
        pair_result: Err("websocket not connected".into()),
        ..Default::default()
    };
    let h = harness_with(behavior, 10).await;
    let boot = Bootstrapper::new(h.manager.clone());
    let err = boot
        .pair(OP, "6281234567890", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Connect(_)));

    assert!(matches!(
        classify_pair_error("attempt to write a readonly database"),
        BridgeError::Fs(_)
    ));
    assert!(matches!(
        classify_pair_error("context deadline exceeded"),
        BridgeError::Transient(_)
    ));
    assert!(matches!(
        classify_pair_error("bad-request"),
        BridgeError::Upstream(_)
    ));
}

#[tokio::test]
async fn test_pairing_rejects_bad_phone_and_full_catalog() {
    let h = harness_with(MockBehavior::default(), 1).await;
    let boot = Bootstrapper::new(h.manager.clone());
    assert!(matches!(
        boot.pair(OP, "12ab", CancellationToken::new()).await,
        Err(BridgeError::Validation(_))
    ));

    seed_account(&h.catalog, &h.paths, OP, "6281").await;
    assert!(matches!(
        boot.pair(OP, "6289999999", CancellationToken::new()).await,
        Err(BridgeError::Validation(_))
    ));
    assert_eq!(h.factory.created(), 0);
}

// --- Operator context ---

#[tokio::test]
async fn test_context_resolves_owned_account_only() {
    let h = harness().await;
    let (a, b) = two_accounts(&h).await;
    let mine = OperatorContext::new(h.manager.clone(), OP);
    let stranger = OperatorContext::new(h.manager.clone(), 999);

    assert_eq!(mine.target().await.unwrap().account.id, a);
    assert!(stranger.target().await.is_err());
    assert!(matches!(
        stranger.switch(b).await,
        Err(BridgeError::Validation(_))
    ));

    mine.switch(b).await.unwrap();
    assert_eq!(mine.target().await.unwrap().account.id, b);
    assert_eq!(mine.accounts().await.len(), 2);
}

// --- Bulk executor ---

#[derive(Default)]
struct TickLog(Mutex<Vec<BulkProgress>>);

#[async_trait]
impl ProgressSink for TickLog {
    async fn progress(&self, progress: BulkProgress) {
        self.0.lock().unwrap().push(progress);
    }
}

fn fast_bulk() -> BulkConfig {
    BulkConfig {
        max_concurrency: 5,
        batch_size: 10,
        per_item_timeout: Duration::from_millis(500),
        inter_batch_delay: Duration::from_millis(50),
        retry_attempts: 3,
        backoff_base: Duration::from_millis(5),
        progress_interval: Duration::from_millis(20),
        progress_every: 5,
    }
}

#[tokio::test]
async fn test_bulk_rename_summary() {
    let ticks = Arc::new(TickLog::default());
    let executor = BulkExecutor::new(fast_bulk(), ticks.clone());
    let attempts: Arc<Mutex<HashMap<usize, usize>>> = Arc::default();

    let seen = attempts.clone();
    let summary = executor
        .run(
            (0..23).collect(),
            move |item: usize, _cancel| {
                let seen = seen.clone();
                async move {
                    let n = {
                        let mut map = seen.lock().unwrap();
                        let n = map.entry(item).or_insert(0);
                        *n += 1;
                        *n
                    };
                    match item {
                        3 | 7 if n == 1 => Err(BridgeError::Upstream("429 rate-overlimit".into())),
                        12 => Err(BridgeError::Upstream("not participating".into())),
                        _ => Ok(()),
                    }
                }
            },
            CancellationToken::new(),
        )
        .await;

    assert_eq!(summary.processed, 23);
    assert_eq!(summary.updated, 22);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].0, 12);
    assert!(!summary.cancelled);
    assert!(summary.elapsed >= Duration::from_millis(100));
    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts[&3], 2);
    assert_eq!(attempts[&12], 1);

    let ticks = ticks.0.lock().unwrap();
    assert!(ticks
        .iter()
        .all(|t| t.updated + t.failed == t.current && t.current <= t.total));
    assert_eq!(ticks.last().unwrap().current, 23);
}

#[tokio::test]
async fn test_bulk_rate_limit_gives_up_after_third_attempt() {
    let executor = BulkExecutor::new(fast_bulk(), Arc::new(NoProgress));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let summary = executor
        .run(
            vec!["g1"],
            move |_item, _cancel| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(BridgeError::Upstream("rate limit exceeded".into()))
                }
            },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 1);
}

#[tokio::test]
async fn test_bulk_item_timeout_fails_item() {
    let config = BulkConfig {
        per_item_timeout: Duration::from_millis(20),
        ..fast_bulk()
    };
    let executor = BulkExecutor::new(config, Arc::new(NoProgress));
    let summary = executor
        .run(
            vec![0u8, 1],
            |item, _cancel| async move {
                if item == 1 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(())
            },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_bulk_bad_input_is_not_auth_fatal() {
    let fatal = Arc::new(AtomicUsize::new(0));
    let hook = fatal.clone();
    let executor = BulkExecutor::new(fast_bulk(), Arc::new(NoProgress)).on_auth_fatal(move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    });
    let summary = executor
        .run(
            vec!["1404@g.us", "2@g.us"],
            |jid, _cancel| async move {
                if jid.starts_with("1404") {
                    Err(BridgeError::Validation(format!("invalid JID '{jid}'")))
                } else {
                    Ok(())
                }
            },
            CancellationToken::new(),
        )
        .await;
    assert!(summary.auth_fatal.is_none());
    assert!(!summary.cancelled);
    assert_eq!((summary.updated, summary.failed), (1, 1));
    assert_eq!(fatal.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bulk_cancelled_before_start() {
    let executor = BulkExecutor::new(fast_bulk(), Arc::new(NoProgress));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = executor
        .run(vec![1, 2, 3], |_item: i32, _cancel| async { Ok(()) }, cancel)
        .await;
    assert_eq!(summary.processed, 0);
    assert!(summary.cancelled);
    assert_eq!(summary.skipped(), 3);
}

#[tokio::test]
async fn test_bulk_sequential_preserves_order() {
    let executor = BulkExecutor::new(fast_bulk().sequential(), Arc::new(NoProgress));
    let order: Arc<Mutex<Vec<usize>>> = Arc::default();
    let sink = order.clone();
    executor
        .run(
            (0..12).collect(),
            move |item: usize, _cancel| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(item);
                    Ok(())
                }
            },
            CancellationToken::new(),
        )
        .await;
    assert_eq!(*order.lock().unwrap(), (0..12).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_bulk_auth_fatal_abandons_account_only() {
    let h = harness().await;
    let (a, b) = two_accounts(&h).await;
    let _loop = h.manager.spawn_intent_loop(CancellationToken::new()).unwrap();
    let ctx = OperatorContext::new(h.manager.clone(), OP);
    let root = CancellationToken::new();

    let a_client = h.manager.client(a).await.unwrap();
    let b_client = h.manager.client(b).await.unwrap();
    h.factory
        .client_for(&h.upstream("6281"))
        .unwrap()
        .fail_next("set_group_name", "g1@g.us", "401 unauthorized");

    let groups: Vec<String> = (0..5).map(|i| format!("g{i}@g.us")).collect();
    let rename = |client: Arc<dyn WaClient>| {
        move |jid: String, _cancel: CancellationToken| {
            let client = client.clone();
            async move { client.set_group_name(&jid, "Renamed").await }
        }
    };

    let intents = h.manager.intents();
    let a_exec = BulkExecutor::new(fast_bulk().sequential(), Arc::new(NoProgress)).on_auth_fatal(
        move |reason| {
            let _ = intents.send(Intent::AuthFatal {
                account_id: a,
                reason,
            });
        },
    );
    let b_exec = BulkExecutor::new(fast_bulk().sequential(), Arc::new(NoProgress));

    let a_token = ctx.work_token(a, &root).await;
    let b_token = ctx.work_token(b, &root).await;
    let (a_sum, b_sum) = tokio::join!(
        a_exec.run(groups.clone(), rename(a_client), a_token),
        b_exec.run(groups.clone(), rename(b_client), b_token),
    );

    assert!(a_sum.auth_fatal.is_some());
    assert_eq!(a_sum.processed, 2);
    assert_eq!(a_sum.updated, 1);
    assert!(a_sum.cancelled);
    assert_eq!(b_sum.updated, 5);
    assert!(!b_sum.cancelled);

    let catalog = h.catalog.clone();
    assert!(eventually(WAIT, || async { catalog.get(a).await.unwrap().is_none() }).await);
    assert!(h.catalog.get(b).await.unwrap().is_some());
    assert!(h.files_gone("6281"));
}
