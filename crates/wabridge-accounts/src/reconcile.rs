//! Startup reconciliation of disk and catalog.
//!
//! Runs four fixed steps: migrate legacy root-level files, register valid
//! stores found on disk, prune catalog rows that fail validation, and
//! delete canonical files no row references. Each step records its own
//! errors and the next step still runs. Running it twice yields the same
//! state as running it once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use wabridge_core::{
    paths::{
        move_db_files, parse_db_file_name, parse_db_path, path_string, remove_db_files, DbKind,
        PathResolver,
    },
    AccountId, OperatorId,
};
use wabridge_store::{validate_device_store, Catalog};

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Legacy files moved into operator folders.
    pub migrated: Vec<String>,
    /// Phones newly registered from disk.
    pub registered: Vec<String>,
    /// Accounts whose stored paths were rewritten.
    pub repathed: Vec<AccountId>,
    /// Accounts removed because their device store failed validation.
    pub pruned: Vec<(AccountId, String)>,
    /// Orphaned files deleted.
    pub orphans_removed: Vec<String>,
    pub errors: Vec<String>,
    /// Set by the manager after election.
    pub current: Option<AccountId>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.migrated.is_empty()
            && self.registered.is_empty()
            && self.repathed.is_empty()
            && self.pruned.is_empty()
            && self.orphans_removed.is_empty()
    }
}

pub struct Reconciler<'a> {
    catalog: &'a Catalog,
    paths: &'a PathResolver,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a Catalog, paths: &'a PathResolver) -> Self {
        Self { catalog, paths }
    }

    /// Steps 1 to 4.
    pub async fn run(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.migrate_legacy(&mut report).await;
        self.register_from_disk(&mut report).await;
        self.prune_invalid(&mut report).await;
        self.delete_orphans(&mut report).await;
        info!(
            "reconcile: {} migrated, {} registered, {} repathed, {} pruned, {} orphan file(s) removed, {} error(s)",
            report.migrated.len(),
            report.registered.len(),
            report.repathed.len(),
            report.pruned.len(),
            report.orphans_removed.len(),
            report.errors.len()
        );
        report
    }

    /// Step 1: move root-level `whatsmeow-*` / `bot_data-*` files into their
    /// operator folders, then repoint catalog rows whose stored file is gone
    /// but whose canonical file exists.
    async fn migrate_legacy(&self, report: &mut ReconcileReport) {
        for legacy in self.paths.legacy_root_files() {
            let target =
                self.paths
                    .db_path(legacy.name.operator_id, &legacy.name.phone, legacy.name.kind);
            if target.exists() {
                report.errors.push(format!(
                    "migrate {}: {} already exists",
                    legacy.path.display(),
                    target.display()
                ));
                continue;
            }
            if let Err(e) = self.paths.ensure_user_folder(legacy.name.operator_id) {
                report.errors.push(format!("migrate {}: {e}", legacy.path.display()));
                continue;
            }
            match move_db_files(&legacy.path, &target) {
                Ok(()) => {
                    info!("migrated {} -> {}", legacy.path.display(), target.display());
                    report.migrated.push(path_string(&target));
                }
                Err(e) => report
                    .errors
                    .push(format!("migrate {}: {e}", legacy.path.display())),
            }
        }

        let accounts = match self.catalog.list().await {
            Ok(a) => a,
            Err(e) => {
                report.errors.push(format!("migrate: list catalog: {e}"));
                return;
            }
        };
        for account in accounts {
            let upstream = self.repoint(&account.upstream_db_path);
            let bot = self.repoint(&account.bot_db_path);
            if upstream.is_none() && bot.is_none() {
                continue;
            }
            let upstream = upstream.unwrap_or_else(|| PathBuf::from(&account.upstream_db_path));
            let bot = bot.unwrap_or_else(|| PathBuf::from(&account.bot_db_path));
            match self.catalog.update_paths(account.id, &upstream, &bot).await {
                Ok(()) => report.repathed.push(account.id),
                Err(e) => report
                    .errors
                    .push(format!("migrate: repath account {}: {e}", account.id)),
            }
        }
    }

    /// Canonical location for `stored` when the stored file is missing and
    /// the canonical one exists.
    fn repoint(&self, stored: &str) -> Option<PathBuf> {
        let stored_path = Path::new(stored);
        let name = parse_db_path(stored_path)?;
        let canonical = self.paths.db_path(name.operator_id, &name.phone, name.kind);
        if canonical == stored_path || stored_path.exists() || !canonical.exists() {
            return None;
        }
        Some(canonical)
    }

    /// Step 2: ensure a catalog row for every valid canonical store on disk.
    async fn register_from_disk(&self, report: &mut ReconcileReport) {
        for found in self.paths.scan_user_folders() {
            let validation = validate_device_store(&found.upstream_db_path).await;
            if !validation.is_valid() {
                info!(
                    "skipping {}: {validation}",
                    found.upstream_db_path.display()
                );
                continue;
            }
            let existing = match self.catalog.get_by_phone(&found.phone).await {
                Ok(row) => row,
                Err(e) => {
                    report.errors.push(format!("register +{}: {e}", found.phone));
                    continue;
                }
            };
            let upstream = path_string(&found.upstream_db_path);
            let bot = path_string(&found.bot_db_path);
            match existing {
                None => match self
                    .catalog
                    .add(&found.phone, &found.upstream_db_path, &found.bot_db_path)
                    .await
                {
                    Ok(id) => {
                        info!("registered +{} from disk as account {id}", found.phone);
                        report.registered.push(found.phone.clone());
                    }
                    Err(e) => report.errors.push(format!("register +{}: {e}", found.phone)),
                },
                Some(row) if row.upstream_db_path != upstream || row.bot_db_path != bot => {
                    match self
                        .catalog
                        .update_paths(row.id, &found.upstream_db_path, &found.bot_db_path)
                        .await
                    {
                        Ok(()) => report.repathed.push(row.id),
                        Err(e) => report.errors.push(format!("register +{}: {e}", found.phone)),
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Step 3: drop every row whose device store fails validation, with its
    /// files.
    async fn prune_invalid(&self, report: &mut ReconcileReport) {
        let accounts = match self.catalog.list().await {
            Ok(a) => a,
            Err(e) => {
                report.errors.push(format!("prune: list catalog: {e}"));
                return;
            }
        };
        for account in accounts {
            let validation = validate_device_store(Path::new(&account.upstream_db_path)).await;
            if validation.is_valid() {
                continue;
            }
            warn!(
                "pruning account {} (+{}): {validation}",
                account.id, account.phone
            );
            if let Err(e) = self.catalog.remove(account.id).await {
                report.errors.push(format!("prune {}: {e}", account.id));
                continue;
            }
            for path in [&account.upstream_db_path, &account.bot_db_path] {
                if let Err(e) = remove_db_files(Path::new(path)) {
                    report.errors.push(format!("prune {}: {e}", account.id));
                }
            }
            report.pruned.push((account.id, validation.to_string()));
        }
    }

    /// Step 4: delete canonical files that no catalog row references.
    /// Files are matched by `(kind, operator, phone)` so a row stored with
    /// a differently rooted path still protects its files.
    async fn delete_orphans(&self, report: &mut ReconcileReport) {
        let accounts = match self.catalog.list().await {
            Ok(a) => a,
            Err(e) => {
                // Without the catalog every file would look orphaned.
                report.errors.push(format!("orphans: list catalog: {e}"));
                return;
            }
        };
        let referenced: HashSet<(DbKind, OperatorId, String)> = accounts
            .iter()
            .flat_map(|a| [&a.upstream_db_path, &a.bot_db_path])
            .filter_map(|p| parse_db_path(Path::new(p)))
            .map(|n| (n.kind, n.operator_id, n.phone))
            .collect();

        for file in self.paths.canonical_files() {
            let Some(name) = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .and_then(|n| {
                    let base = n
                        .strip_suffix("-shm")
                        .or_else(|| n.strip_suffix("-wal"))
                        .unwrap_or(n.as_str())
                        .to_string();
                    parse_db_file_name(&base)
                })
            else {
                continue;
            };
            if referenced.contains(&(name.kind, name.operator_id, name.phone.clone())) {
                continue;
            }
            match std::fs::remove_file(&file) {
                Ok(()) => {
                    info!("removed orphan {}", file.display());
                    report.orphans_removed.push(path_string(&file));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => report
                    .errors
                    .push(format!("orphan {}: {e}", file.display())),
            }
        }
    }
}
