use std::sync::Arc;
use std::time::Duration;

use wabridge_accounts::{
    testing::{eventually, seed_account, MockBehavior, MockFactory, RecordingNotifier},
    AccountManager, BulkSummary, ManagerDeps, OperatorContext, Timings,
};
use wabridge_core::{
    config::Config,
    message::{CallbackInfo, IncomingMessage},
    paths::{DbKind, PathResolver},
};
use wabridge_store::{bot_data::CachedGroup, BotStore, Catalog};

use super::bulk_ops::{plan, render_summary, resolve_group, BulkItem, BulkParam};
use super::routing::parse_account_id;
use super::*;
use crate::commands::{BulkKind, Command};

const OP: i64 = 111;
const OTHER: i64 = 222;

struct Harness {
    _tmp: tempfile::TempDir,
    paths: Arc<PathResolver>,
    catalog: Catalog,
    factory: Arc<MockFactory>,
    notifier: Arc<RecordingNotifier>,
    gw: Arc<Gateway>,
}

async fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let paths = Arc::new(PathResolver::new(tmp.path()));
    let catalog = Catalog::open(&paths.master_db_path()).await.unwrap();
    let factory = Arc::new(MockFactory::new(MockBehavior::default()));
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = AccountManager::new(ManagerDeps {
        catalog: catalog.clone(),
        paths: paths.clone(),
        factory: factory.clone(),
        notifier: notifier.clone(),
        timings: Timings::fast(),
        max_accounts: 10,
    });
    let config = Config {
        telegram_token: "123456:test".into(),
        admin_ids: vec![OP],
        allowed_user_ids: vec![OP, OTHER],
        ..Default::default()
    };
    let mut gw = Gateway::new(config, manager, notifier.clone(), None);
    gw.bulk.inter_batch_delay = Duration::from_millis(1);
    Harness {
        _tmp: tmp,
        paths,
        catalog,
        factory,
        notifier,
        gw: Arc::new(gw),
    }
}

fn message(operator_id: i64, text: &str) -> IncomingMessage {
    IncomingMessage {
        operator_id,
        chat_id: operator_id,
        text: text.into(),
        callback: None,
    }
}

/// One connected, current account with two cached groups.
async fn connected_account(h: &Harness) -> i64 {
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    let store = BotStore::open(&h.paths.db_path(OP, "6281", DbKind::BotData))
        .await
        .unwrap();
    store.upsert_group("100@g.us", "Alpha").await.unwrap();
    store.upsert_group("200@g.us", "Beta").await.unwrap();
    store.close().await;
    h.gw.manager.startup().await;
    assert_eq!(h.gw.manager.current().await, Some(id));
    id
}

async fn last_text_contains(h: &Harness, needle: &str) -> bool {
    let needle = needle.to_string();
    let notifier = h.notifier.clone();
    eventually(Duration::from_secs(2), move || {
        let notifier = notifier.clone();
        let needle = needle.clone();
        async move { notifier.texts_to(OP).iter().any(|t| t.contains(&needle)) }
    })
    .await
}

fn cached(name: &str, jid: &str) -> CachedGroup {
    CachedGroup {
        group_jid: jid.into(),
        group_name: name.into(),
        updated_at: String::new(),
    }
}

// --- Dispatch ---

#[tokio::test]
async fn test_unauthorized_user_is_refused() {
    let h = harness().await;
    h.gw.dispatch(message(999, "/accounts")).await;
    let texts = h.notifier.texts_to(999);
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("not allowed"));
}

#[tokio::test]
async fn test_help_and_unknown_command() {
    let h = harness().await;
    h.gw.dispatch(message(OP, "/help")).await;
    h.gw.dispatch(message(OP, "hello")).await;
    let texts = h.notifier.texts_to(OP);
    assert!(texts[0].contains("/pair <phone>"));
    assert!(texts[1].contains("Unknown command"));
}

#[tokio::test]
async fn test_accounts_lists_only_own_accounts() {
    let h = harness().await;
    let id = connected_account(&h).await;
    seed_account(&h.catalog, &h.paths, OTHER, "6299").await;
    h.gw.manager.load_all().await.unwrap();

    h.gw.dispatch(message(OP, "/accounts")).await;
    let text = h.notifier.texts_to(OP).pop().unwrap();
    assert!(text.contains(&format!("#{id} +6281")));
    assert!(text.contains("⭐"));
    assert!(!text.contains("6299"));
}

#[tokio::test]
async fn test_switch_to_foreign_account_is_rejected() {
    let h = harness().await;
    connected_account(&h).await;
    let foreign = seed_account(&h.catalog, &h.paths, OTHER, "6299").await;
    h.gw.manager.load_all().await.unwrap();

    h.gw.dispatch(message(OP, &format!("/switch {foreign}"))).await;
    let text = h.notifier.texts_to(OP).pop().unwrap();
    assert!(text.contains("does not belong to you"));

    h.gw.dispatch(message(OP, "/switch abc")).await;
    let text = h.notifier.texts_to(OP).pop().unwrap();
    assert!(text.contains("not an account id"));
}

#[tokio::test]
async fn test_remove_command_deletes_account() {
    let h = harness().await;
    let id = connected_account(&h).await;
    h.gw.dispatch(message(OP, &format!("/remove #{id}"))).await;
    assert!(h.notifier.texts_to(OP).pop().unwrap().contains("removed"));
    assert!(h.catalog.get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_groups_lists_cache_with_query() {
    let h = harness().await;
    connected_account(&h).await;
    h.gw.dispatch(message(OP, "/groups alp")).await;
    let text = h.notifier.texts_to(OP).pop().unwrap();
    assert!(text.contains("Alpha"));
    assert!(!text.contains("Beta"));
}

#[tokio::test]
async fn test_groups_without_account_reports_error() {
    let h = harness().await;
    h.gw.dispatch(message(OP, "/groups")).await;
    let text = h.notifier.texts_to(OP).pop().unwrap();
    assert!(text.starts_with("❌"));
    assert!(text.contains("/pair"));
}

#[tokio::test]
async fn test_backup_writes_snapshot() {
    let h = harness().await;
    let id = connected_account(&h).await;
    h.gw.dispatch(message(OP, "/backup")).await;
    let text = h.notifier.texts_to(OP).pop().unwrap();
    assert!(text.contains(&format!("account_6281_{id}_")), "{text}");
    let files: Vec<_> = std::fs::read_dir(h.paths.backup_dir()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn test_cancel_without_job() {
    let h = harness().await;
    h.gw.dispatch(message(OP, "/cancel")).await;
    assert!(h.notifier.texts_to(OP).pop().unwrap().contains("Nothing to cancel"));
}

#[tokio::test]
async fn test_cancel_callback_stops_job() {
    let h = harness().await;
    let token = h.gw.begin_job(OP, JobKind::Bulk).unwrap();
    assert!(h.gw.begin_job(OP, JobKind::Pairing).is_none());

    let mut incoming = message(OP, "cancel");
    incoming.callback = Some(CallbackInfo {
        id: "cb1".into(),
        message_id: Some(9),
    });
    h.gw.dispatch(incoming).await;
    assert!(token.is_cancelled());
    h.gw.end_job(OP);
    assert!(h.gw.begin_job(OP, JobKind::Pairing).is_some());
}

#[tokio::test]
async fn test_startup_without_account_prompts_every_operator() {
    let h = harness().await;
    let report = h.gw.start_sessions().await;
    assert!(report.current.is_none());
    for operator_id in [OP, OTHER] {
        let texts = h.notifier.texts_to(operator_id);
        assert!(texts.iter().any(|t| t.contains("/pair <phone>")), "{texts:?}");
    }
}

#[tokio::test]
async fn test_startup_with_account_sends_no_prompt() {
    let h = harness().await;
    let id = seed_account(&h.catalog, &h.paths, OP, "6281").await;
    let report = h.gw.start_sessions().await;
    assert_eq!(report.current, Some(id));
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_sync_reports_active_accounts() {
    let h = harness().await;
    connected_account(&h).await;
    h.gw.dispatch(message(OP, "/sync")).await;
    let reply = h.notifier.texts_to(OP).pop().unwrap();
    assert!(reply.starts_with("🔄 1 account(s) active"), "{reply}");
}

#[tokio::test]
async fn test_callback_is_answered_through_telegram() {
    let mut server = mockito::Server::new_async().await;
    let answered = server
        .mock("POST", "/answerCallbackQuery")
        .match_body(mockito::Matcher::PartialJsonString(
            r#"{"callback_query_id":"cb7"}"#.into(),
        ))
        .with_status(200)
        .with_body(r#"{"ok":true,"result":true}"#)
        .create_async()
        .await;

    let h = harness().await;
    let telegram = Arc::new(TelegramChannel::with_base_url(server.url()));
    let gw = Arc::new(Gateway::new(
        h.gw.config.clone(),
        h.gw.manager.clone(),
        h.notifier.clone(),
        Some(telegram),
    ));

    let mut incoming = message(OP, "cancel");
    incoming.callback = Some(CallbackInfo {
        id: "cb7".into(),
        message_id: Some(3),
    });
    gw.dispatch(incoming).await;

    answered.assert_async().await;
    assert!(h
        .notifier
        .texts_to(OP)
        .iter()
        .any(|t| t.contains("Nothing to cancel")));
}

#[tokio::test]
async fn test_pair_command_registers_account() {
    let h = harness().await;
    h.gw.dispatch(message(OP, "/pair +62 812-3456-7890")).await;
    assert!(last_text_contains(&h, "paired as account #1").await);
    assert!(h.catalog.get_by_phone("6281234567890").await.unwrap().is_some());
    let gw = h.gw.clone();
    assert!(
        eventually(Duration::from_secs(1), move || {
            let gw = gw.clone();
            async move {
                let idle = gw.lock_jobs().is_empty();
                idle
            }
        })
        .await
    );
}

// --- Bulk ---

#[tokio::test]
async fn test_bulk_rename_runs_against_target_account() {
    let h = harness().await;
    connected_account(&h).await;
    let client = h
        .factory
        .client_for(&h.paths.db_path(OP, "6281", DbKind::Upstream))
        .unwrap();
    client.fail_next("set_group_name", "200@g.us", "403 forbidden");

    let ctx = OperatorContext::new(h.gw.manager.clone(), OP);
    h.gw.run_bulk(
        ctx,
        OP,
        BulkKind::Rename,
        String::new(),
        vec!["Alpha | One".into(), "200 | Two".into(), "nope | x".into()],
    )
    .await;

    let report = h.notifier.texts_to(OP).pop().unwrap();
    assert!(report.contains("2/2 processed, 1 updated, 1 failed"), "{report}");
    assert!(report.contains("200@g.us"));
    assert!(report.contains("Ignored 1 line"));
    let calls = client.calls();
    assert!(calls.contains(&"set_group_name:100@g.us".to_string()));
    assert!(calls.contains(&"set_group_name:200@g.us".to_string()));
    assert!(h.gw.lock_jobs().is_empty());
}

#[tokio::test]
async fn test_bulk_links_defaults_to_all_cached_groups() {
    let h = harness().await;
    connected_account(&h).await;
    let ctx = OperatorContext::new(h.gw.manager.clone(), OP);
    h.gw.run_bulk(ctx, OP, BulkKind::Links, String::new(), Vec::new())
        .await;
    let report = h.notifier.texts_to(OP).pop().unwrap();
    assert!(report.contains("https://chat.whatsapp.com/100"));
    assert!(report.contains("https://chat.whatsapp.com/200"));
}

#[tokio::test]
async fn test_bulk_refused_while_job_running() {
    let h = harness().await;
    connected_account(&h).await;
    let _token = h.gw.begin_job(OP, JobKind::Pairing).unwrap();
    let ctx = OperatorContext::new(h.gw.manager.clone(), OP);
    h.gw.run_bulk(ctx, OP, BulkKind::Leave, String::new(), vec!["100".into()])
        .await;
    assert!(h
        .notifier
        .texts_to(OP)
        .pop()
        .unwrap()
        .contains("already running"));
}

#[test]
fn test_resolve_group_forms() {
    let groups = vec![cached("Team Alpha", "1@g.us")];
    assert_eq!(resolve_group("1203-99", &groups).unwrap(), "1203-99@g.us");
    assert_eq!(resolve_group("5@g.us", &groups).unwrap(), "5@g.us");
    assert_eq!(resolve_group("team alpha", &groups).unwrap(), "1@g.us");
    assert!(resolve_group("62812@s.whatsapp.net", &groups).is_err());
    assert!(resolve_group("Unknown", &groups).is_err());
}

#[test]
fn test_plan_members_and_toggles() {
    let p = plan(BulkKind::Add, "+628123456789, 628987654321", &["1".into()], &[]).unwrap();
    assert_eq!(
        p.param,
        BulkParam::Members(vec![
            "628123456789@s.whatsapp.net".into(),
            "628987654321@s.whatsapp.net".into()
        ])
    );
    assert_eq!(p.items, vec![BulkItem::Group("1@g.us".into())]);

    assert!(plan(BulkKind::Kick, "", &["1".into()], &[]).is_err());
    assert!(plan(BulkKind::Lock, "sometimes", &[], &[]).is_err());

    let groups = vec![cached("A", "1@g.us"), cached("B", "2@g.us")];
    let p = plan(BulkKind::Announce, "on", &[], &groups).unwrap();
    assert_eq!(p.param, BulkParam::Toggle(true));
    assert_eq!(p.items.len(), 2);
}

#[test]
fn test_plan_join_and_leave() {
    let p = plan(
        BulkKind::Join,
        "",
        &[
            "https://chat.whatsapp.com/AbCdEfGhIjKl".into(),
            "https://example.com/x".into(),
        ],
        &[],
    )
    .unwrap();
    assert_eq!(p.items, vec![BulkItem::Invite("AbCdEfGhIjKl".into())]);
    assert_eq!(p.rejected.len(), 1);

    // Leave never defaults to every group.
    assert!(plan(BulkKind::Leave, "", &[], &[cached("A", "1@g.us")]).is_err());
    assert!(plan(BulkKind::Broadcast, "", &[], &[]).is_err());
}

#[test]
fn test_render_summary_reports_failures_and_links() {
    let p = plan(BulkKind::Links, "", &["1".into(), "2".into()], &[]).unwrap();
    let summary = BulkSummary {
        total: 2,
        processed: 2,
        updated: 1,
        failed: 1,
        failures: vec![(1, "403 forbidden".into())],
        ..Default::default()
    };
    let text = render_summary(
        &p,
        &summary,
        &[("1@g.us".into(), "https://chat.whatsapp.com/abc".into())],
    );
    assert!(text.starts_with("✅ Invite links finished: 2/2 processed"));
    assert!(text.contains("• 2@g.us: 403 forbidden"));
    assert!(text.contains("1@g.us: https://chat.whatsapp.com/abc"));
}

#[test]
fn test_parse_account_id_accepts_hash() {
    assert_eq!(parse_account_id(" #12 ").unwrap(), 12);
    assert!(parse_account_id("x").is_err());
    assert_eq!(Command::parse("/switch #3"), Some(Command::Switch("#3".into())));
}
