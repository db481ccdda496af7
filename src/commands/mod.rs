//! Bot commands: parsing and help text.
//!
//! A command is the first word of a message. Bulk commands carry their
//! items on the following lines, one per line.

#[cfg(test)]
mod tests;

/// Bulk operations over groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkKind {
    Rename,
    Describe,
    Join,
    Leave,
    Broadcast,
    Add,
    Kick,
    Promote,
    Demote,
    Announce,
    Lock,
    Links,
}

impl BulkKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rename => "Rename",
            Self::Describe => "Set description",
            Self::Join => "Join",
            Self::Leave => "Leave",
            Self::Broadcast => "Broadcast",
            Self::Add => "Add members",
            Self::Kick => "Remove members",
            Self::Promote => "Promote",
            Self::Demote => "Demote",
            Self::Announce => "Announce-only",
            Self::Lock => "Lock info",
            Self::Links => "Invite links",
        }
    }

    /// Activity-log action name.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Rename => "bulk_rename",
            Self::Describe => "bulk_description",
            Self::Join => "bulk_join",
            Self::Leave => "bulk_leave",
            Self::Broadcast => "bulk_broadcast",
            Self::Add => "bulk_add",
            Self::Kick => "bulk_kick",
            Self::Promote => "bulk_promote",
            Self::Demote => "bulk_demote",
            Self::Announce => "bulk_announce",
            Self::Lock => "bulk_lock",
            Self::Links => "bulk_links",
        }
    }

    /// Whether an empty item list means "every cached group".
    pub fn defaults_to_all_groups(&self) -> bool {
        matches!(self, Self::Broadcast | Self::Announce | Self::Lock | Self::Links)
    }
}

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Pair(String),
    Cancel,
    Accounts,
    Switch(String),
    Remove(String),
    Sync,
    Groups(Option<String>),
    Logs,
    Backup,
    Bulk {
        kind: BulkKind,
        /// Text after the command word on the first line.
        args: String,
        /// Remaining non-empty lines, trimmed.
        items: Vec<String>,
    },
}

impl Command {
    /// Parse message text. `None` when it is not a known command.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.trim().lines();
        let first = lines.next()?.trim();
        let (word, args) = match first.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (first, ""),
        };
        // "/help@wabridge_bot" → "/help".
        let word = word.split('@').next().unwrap_or(word).to_lowercase();
        let items: Vec<String> = lines
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let arg = || args.to_string();

        let bulk = |kind| {
            Some(Self::Bulk {
                kind,
                args: args.to_string(),
                items: items.clone(),
            })
        };

        match word.as_str() {
            "/start" => Some(Self::Start),
            "/help" => Some(Self::Help),
            "/status" => Some(Self::Status),
            "/pair" => Some(Self::Pair(arg())),
            "/cancel" => Some(Self::Cancel),
            "/accounts" => Some(Self::Accounts),
            "/switch" => Some(Self::Switch(arg())),
            "/remove" => Some(Self::Remove(arg())),
            "/sync" => Some(Self::Sync),
            "/groups" => Some(Self::Groups((!args.is_empty()).then(arg))),
            "/logs" => Some(Self::Logs),
            "/backup" => Some(Self::Backup),
            "/rename" => bulk(BulkKind::Rename),
            "/desc" => bulk(BulkKind::Describe),
            "/join" => bulk(BulkKind::Join),
            "/leave" => bulk(BulkKind::Leave),
            "/broadcast" => bulk(BulkKind::Broadcast),
            "/add" => bulk(BulkKind::Add),
            "/kick" => bulk(BulkKind::Kick),
            "/promote" => bulk(BulkKind::Promote),
            "/demote" => bulk(BulkKind::Demote),
            "/announce" => bulk(BulkKind::Announce),
            "/lock" => bulk(BulkKind::Lock),
            "/links" => bulk(BulkKind::Links),
            _ => None,
        }
    }
}

/// Parse `on` / `off` style switches.
pub fn parse_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_lowercase().as_str() {
        "on" | "yes" | "true" | "1" => Some(true),
        "off" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Split `<target> | <value>` item lines.
pub fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (left, right) = line.split_once('|')?;
    let (left, right) = (left.trim(), right.trim());
    (!left.is_empty()).then_some((left, right))
}

/// Commands registered with Telegram's command menu.
pub const BOT_COMMANDS: &[(&str, &str)] = &[
    ("help", "Show commands"),
    ("pair", "Pair a WhatsApp account: /pair <phone>"),
    ("accounts", "List your accounts"),
    ("switch", "Switch current account: /switch <id>"),
    ("remove", "Remove an account: /remove <id>"),
    ("sync", "Refresh account status and groups"),
    ("groups", "List cached groups: /groups [query]"),
    ("rename", "Bulk rename groups"),
    ("desc", "Bulk set group descriptions"),
    ("join", "Join groups by invite link"),
    ("leave", "Leave groups"),
    ("broadcast", "Send a message to groups"),
    ("add", "Add members to groups"),
    ("kick", "Remove members from groups"),
    ("promote", "Promote members to admin"),
    ("demote", "Demote admins"),
    ("announce", "Only admins can send: on|off"),
    ("lock", "Only admins can edit info: on|off"),
    ("links", "Export invite links"),
    ("logs", "Recent activity"),
    ("backup", "Back up the current account"),
    ("status", "Bridge status"),
    ("cancel", "Cancel pairing or a running bulk job"),
];

pub fn help_text() -> String {
    "🤖 *WhatsApp bridge*\n\n\
     *Accounts*\n\
     /pair <phone> — link a WhatsApp account\n\
     /accounts — list your accounts\n\
     /switch <id> — make an account current\n\
     /remove <id> — unlink and delete an account\n\
     /sync — refresh status and group cache\n\
     /backup — snapshot the current account\n\n\
     *Groups* (items one per line after the command)\n\
     /groups [query] — cached groups\n\
     /rename — `<group> | <new name>`\n\
     /desc — `<group> | <description>`\n\
     /join — invite links\n\
     /leave — groups\n\
     /broadcast <text> — groups (default: all)\n\
     /add, /kick, /promote, /demote <phones> — groups\n\
     /announce on|off — groups (default: all)\n\
     /lock on|off — groups (default: all)\n\
     /links — groups (default: all)\n\n\
     /logs — recent activity\n\
     /status — bridge status\n\
     /cancel — stop pairing or a bulk job"
        .to_string()
}
