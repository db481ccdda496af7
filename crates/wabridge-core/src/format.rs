//! User-facing text: the fixed error template, progress lines, and the
//! pairing code card.

use crate::error::BridgeError;

/// Longest error detail shown to an operator.
pub const MAX_DETAIL_CHARS: usize = 100;

/// Collapse whitespace, mask bot tokens, drop directory components, and cap
/// the result at [`MAX_DETAIL_CHARS`].
pub fn sanitize_detail(detail: &str) -> String {
    let words: Vec<String> = detail
        .split_whitespace()
        .map(|w| {
            if looks_like_bot_token(w) {
                "[token]".to_string()
            } else if w.contains('/') && (w.ends_with(".db") || w.contains(".db-")) {
                w.rsplit('/').next().unwrap_or(w).to_string()
            } else {
                w.to_string()
            }
        })
        .collect();
    truncate_chars(&words.join(" "), MAX_DETAIL_CHARS)
}

fn looks_like_bot_token(word: &str) -> bool {
    match word.split_once(':') {
        Some((id, secret)) => {
            id.len() >= 6 && id.chars().all(|c| c.is_ascii_digit()) && secret.len() >= 20
        }
        None => false,
    }
}

/// Truncate on a char boundary, appending `…` when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Render the fixed error template.
pub fn render_error(title: &str, context: &str, detail: &str, remedies: &[&str]) -> String {
    let mut out = format!("❌ {title}\n\n{context}\n\nDetail: {}", sanitize_detail(detail));
    if !remedies.is_empty() {
        out.push_str("\n\nWhat you can do:");
        for remedy in remedies {
            out.push_str(&format!("\n• {remedy}"));
        }
    }
    out
}

/// Render a [`BridgeError`] with its own title and remedies.
pub fn render_bridge_error(context: &str, err: &BridgeError) -> String {
    render_error(err.title(), context, &err.to_string(), err.remedies())
}

/// Progress line for a running bulk operation.
pub fn render_progress(label: &str, current: usize, total: usize, updated: usize, failed: usize) -> String {
    let pct = if total == 0 { 100 } else { current * 100 / total };
    format!("⏳ {label}: {current}/{total} ({pct}%)\n✅ {updated}  ❌ {failed}")
}

/// The pairing code card. The code is split in the middle the way the phone
/// displays it (`ABCD-EFGH`).
pub fn render_pairing_code(phone: &str, code: &str) -> String {
    let display = if code.len() == 8 && !code.contains('-') {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code.to_string()
    };
    format!(
        "🔑 Pairing code for +{phone}\n\n`{display}`\n\n\
         1. Open WhatsApp on the phone\n\
         2. Linked devices > Link a device\n\
         3. Link with phone number instead\n\
         4. Enter the code above\n\n\
         Waiting up to 2 minutes for confirmation…"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_is_capped() {
        let long = "x".repeat(500);
        let out = sanitize_detail(&long);
        assert_eq!(out.chars().count(), MAX_DETAIL_CHARS);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn test_detail_masks_token_and_paths() {
        let out = sanitize_detail(
            "failed 123456789:AAbbCCddEEffGGhhIIjjKKll at DB USER TELEGRAM/1/whatsmeow-1-2.db",
        );
        assert!(!out.contains("AAbb"));
        assert!(out.contains("[token]"));
        assert!(out.contains("whatsmeow-1-2.db"));
        assert!(!out.contains("TELEGRAM/1/"));
    }

    #[test]
    fn test_render_error_layout() {
        let text = render_error("Title", "While doing X", "boom", &["Retry"]);
        assert!(text.starts_with("❌ Title"));
        assert!(text.contains("While doing X"));
        assert!(text.contains("Detail: boom"));
        assert!(text.contains("• Retry"));
    }

    #[test]
    fn test_render_progress() {
        let line = render_progress("Rename", 5, 20, 4, 1);
        assert!(line.contains("5/20 (25%)"));
        assert!(line.contains("✅ 4"));
    }

    #[test]
    fn test_pairing_code_split() {
        let card = render_pairing_code("628123", "ABCDEFGH");
        assert!(card.contains("`ABCD-EFGH`"));
    }
}
