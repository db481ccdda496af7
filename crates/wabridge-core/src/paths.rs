//! Deterministic on-disk layout for per-account databases.
//!
//! ```text
//! <root>/
//!   bot_data.db                                   master catalog
//!   DB USER TELEGRAM/<op>/whatsmeow-<op>-<phone>.db
//!   DB USER TELEGRAM/<op>/bot_data-<op>-<phone>.db
//!   backup/
//! ```
//!
//! Every database comes with `-shm` / `-wal` siblings which always travel
//! with it on move and delete.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::message::OperatorId;

/// Folder holding one sub-folder per operator.
pub const USER_DB_DIR: &str = "DB USER TELEGRAM";
/// Master catalog file name, shared by all operators.
pub const MASTER_DB_FILE: &str = "bot_data.db";
/// Backup folder name.
pub const BACKUP_DIR: &str = "backup";
/// Upstream store written by a fresh, not-yet-paired client.
pub const STAGING_UPSTREAM_FILE: &str = "whatsapp.db";
/// Bot-data store of a fresh, not-yet-paired client.
pub const STAGING_BOT_FILE: &str = "bot_data.db";
/// SQLite sidecar suffixes.
pub const SIDECAR_SUFFIXES: [&str; 2] = ["-shm", "-wal"];

/// The two per-account database kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbKind {
    /// The upstream client's device store.
    Upstream,
    /// The bot's auxiliary store (group cache, activity log).
    BotData,
}

impl DbKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Upstream => "whatsmeow",
            Self::BotData => "bot_data",
        }
    }
}

/// A database file name decoded back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFileName {
    pub kind: DbKind,
    pub operator_id: OperatorId,
    pub phone: String,
}

/// A canonical account found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAccount {
    pub operator_id: OperatorId,
    pub phone: String,
    pub upstream_db_path: PathBuf,
    pub bot_db_path: PathBuf,
}

/// A database file sitting in the root folder from the old flat layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFile {
    pub path: PathBuf,
    pub name: DbFileName,
}

/// The account whose bot-data store backs operator-initiated operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentAccount {
    pub operator_id: OperatorId,
    pub phone: String,
}

/// Maps `(operator, phone)` to file paths and tracks the current account.
#[derive(Debug)]
pub struct PathResolver {
    root: PathBuf,
    current: RwLock<Option<CurrentAccount>>,
}

impl PathResolver {
    /// Resolver rooted at `root`. A root of `.` yields relative paths.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current: RwLock::new(None),
        }
    }

    fn base(&self) -> PathBuf {
        if self.root.as_os_str().is_empty() || self.root == Path::new(".") {
            PathBuf::new()
        } else {
            self.root.clone()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder that holds every operator folder.
    pub fn users_dir(&self) -> PathBuf {
        self.base().join(USER_DB_DIR)
    }

    pub fn user_folder(&self, operator_id: OperatorId) -> PathBuf {
        self.users_dir().join(operator_id.to_string())
    }

    /// Canonical `<root>/<op>/<kind>-<op>-<phone>.db`.
    pub fn db_path(&self, operator_id: OperatorId, phone: &str, kind: DbKind) -> PathBuf {
        self.user_folder(operator_id)
            .join(db_file_name(operator_id, phone, kind))
    }

    pub fn master_db_path(&self) -> PathBuf {
        self.base().join(MASTER_DB_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base().join(BACKUP_DIR)
    }

    /// Default-named databases a fresh client writes to before pairing.
    pub fn staging_paths(&self, operator_id: OperatorId) -> (PathBuf, PathBuf) {
        let folder = self.user_folder(operator_id);
        (
            folder.join(STAGING_UPSTREAM_FILE),
            folder.join(STAGING_BOT_FILE),
        )
    }

    /// Create the operator folder (`mkdir -p`).
    pub fn ensure_user_folder(&self, operator_id: OperatorId) -> Result<PathBuf, BridgeError> {
        let folder = self.user_folder(operator_id);
        ensure_dir(&folder)?;
        Ok(folder)
    }

    /// Make `(operator, phone)` current. Pool consumers swap on next access.
    pub fn set_current(&self, operator_id: OperatorId, phone: &str) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(CurrentAccount {
            operator_id,
            phone: phone.to_string(),
        });
    }

    pub fn clear_current(&self) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = None;
    }

    pub fn current(&self) -> Option<CurrentAccount> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bot-data path of the current account, if any.
    pub fn current_bot_db_path(&self) -> Option<PathBuf> {
        self.current()
            .map(|c| self.db_path(c.operator_id, &c.phone, DbKind::BotData))
    }

    /// Upstream path of the current account, if any.
    pub fn current_upstream_db_path(&self) -> Option<PathBuf> {
        self.current()
            .map(|c| self.db_path(c.operator_id, &c.phone, DbKind::Upstream))
    }

    /// Every canonical upstream store under the operator folders whose
    /// operator id matches its folder, paired with its bot-data sibling.
    /// Sorted by `(operator, phone)` so results are stable.
    pub fn scan_user_folders(&self) -> Vec<DiscoveredAccount> {
        let mut found = Vec::new();
        for (operator_id, folder) in self.operator_folders() {
            let entries = match std::fs::read_dir(&folder) {
                Ok(e) => e,
                Err(e) => {
                    warn!("cannot read {}: {e}", folder.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let Some(parsed) = parse_db_file_name(&file_name) else {
                    continue;
                };
                if parsed.kind != DbKind::Upstream || parsed.operator_id != operator_id {
                    continue;
                }
                found.push(DiscoveredAccount {
                    operator_id,
                    upstream_db_path: entry.path(),
                    bot_db_path: self.db_path(operator_id, &parsed.phone, DbKind::BotData),
                    phone: parsed.phone,
                });
            }
        }
        found.sort_by(|a, b| (a.operator_id, &a.phone).cmp(&(b.operator_id, &b.phone)));
        found
    }

    /// First canonical account on disk whose bot-data sibling also exists.
    pub fn discover(&self) -> Option<(PathBuf, PathBuf)> {
        self.scan_user_folders()
            .into_iter()
            .find(|acc| acc.bot_db_path.exists())
            .map(|acc| (acc.upstream_db_path, acc.bot_db_path))
    }

    /// Every file in every operator folder whose name carries a canonical
    /// prefix (`whatsmeow-` / `bot_data-`), sidecars included.
    pub fn canonical_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for (_, folder) in self.operator_folders() {
            let Ok(entries) = std::fs::read_dir(&folder) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let base = strip_sidecar(&name);
                if parse_db_file_name(base).is_some() {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        files
    }

    /// Root-level databases left over from the flat layout.
    pub fn legacy_root_files(&self) -> Vec<LegacyFile> {
        let dir = if self.base().as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            self.base()
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<LegacyFile> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                parse_db_file_name(&name).map(|parsed| LegacyFile {
                    path: self.base().join(&name),
                    name: parsed,
                })
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    fn operator_folders(&self) -> Vec<(OperatorId, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(self.users_dir()) else {
            return Vec::new();
        };
        let mut folders: Vec<(OperatorId, PathBuf)> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let id = e.file_name().to_string_lossy().parse::<OperatorId>().ok()?;
                Some((id, self.user_folder(id)))
            })
            .collect();
        folders.sort();
        folders
    }
}

/// `<kind>-<op>-<phone>.db`.
pub fn db_file_name(operator_id: OperatorId, phone: &str, kind: DbKind) -> String {
    format!("{}-{operator_id}-{phone}.db", kind.prefix())
}

/// Decode `whatsmeow-<op>-<phone>.db` or `bot_data-<op>-<phone>.db`.
pub fn parse_db_file_name(name: &str) -> Option<DbFileName> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix("whatsmeow-") {
        (DbKind::Upstream, rest)
    } else if let Some(rest) = name.strip_prefix("bot_data-") {
        (DbKind::BotData, rest)
    } else {
        return None;
    };
    let stem = rest.strip_suffix(".db")?;
    let (op, phone) = stem.split_once('-')?;
    let operator_id = op.parse::<OperatorId>().ok()?;
    if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(DbFileName {
        kind,
        operator_id,
        phone: phone.to_string(),
    })
}

/// Decode a stored catalog path; `None` if its file name is not canonical.
pub fn parse_db_path(path: &Path) -> Option<DbFileName> {
    let name = path.file_name()?.to_string_lossy().to_string();
    parse_db_file_name(&name)
}

/// Replace characters that are unsafe in file names with `_`.
pub fn sanitize(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// `mkdir -p` that reports failures as [`BridgeError::Fs`].
pub fn ensure_dir(dir: &Path) -> Result<(), BridgeError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BridgeError::Fs(format!("cannot create {}: {e}", dir.display())))
}

/// The database file followed by its `-shm` and `-wal` siblings.
pub fn with_sidecars(path: &Path) -> [PathBuf; 3] {
    let base = path.as_os_str().to_string_lossy().to_string();
    [
        path.to_path_buf(),
        PathBuf::from(format!("{base}{}", SIDECAR_SUFFIXES[0])),
        PathBuf::from(format!("{base}{}", SIDECAR_SUFFIXES[1])),
    ]
}

fn strip_sidecar(name: &str) -> &str {
    SIDECAR_SUFFIXES
        .iter()
        .find_map(|s| name.strip_suffix(s))
        .unwrap_or(name)
}

/// Delete a database and its sidecars. Missing files are not an error.
/// Returns how many files were actually removed.
pub fn remove_db_files(path: &Path) -> Result<usize, BridgeError> {
    let mut removed = 0;
    for file in with_sidecars(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => {
                debug!("removed {}", file.display());
                removed += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BridgeError::Fs(format!(
                    "cannot remove {}: {e}",
                    file.display()
                )))
            }
        }
    }
    Ok(removed)
}

/// Move a database and its sidecars. The destination folder is created
/// first; missing sidecars are skipped. Fails if `from` itself is missing.
pub fn move_db_files(from: &Path, to: &Path) -> Result<(), BridgeError> {
    if !from.exists() {
        return Err(BridgeError::Fs(format!("{} does not exist", from.display())));
    }
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    for (src, dst) in with_sidecars(from).iter().zip(with_sidecars(to).iter()) {
        if !src.exists() {
            continue;
        }
        std::fs::rename(src, dst).map_err(|e| {
            BridgeError::Fs(format!(
                "cannot move {} to {}: {e}",
                src.display(),
                dst.display()
            ))
        })?;
    }
    Ok(())
}

/// Lossy string form used when paths are stored in the catalog.
pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
