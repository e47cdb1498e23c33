// Keystone Engine — History Review
// Rewrites the recent session window before it is used anywhere in the
// pipeline. Rule-based regex filters flag fabrication signals in assistant
// messages; correction/acknowledgment pairs are compressed to one note so
// the model doesn't relearn the mistake from its own transcript.
//
// Review failure is non-fatal by design: callers fall back to the raw
// window.

use crate::atoms::config::HistoryReviewConfig;
use crate::engine::sessions::StoredMessage;
use chrono::Utc;
use log::debug;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

pub const REDACTED_PLACEHOLDER: &str =
    "[message redacted: contained unverifiable references]";
pub const ANNOTATION_SUFFIX: &str = " [note: contains an unverified reference]";

/// Domains that only ever appear in fabricated citations.
const FABRICATED_DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "yourdomain.com",
    "placeholder.com",
    "website.com",
];

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[\s(`])(/[\w][\w.\-/]*\.[A-Za-z0-9]{1,6})").unwrap())
}

fn citation_quote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A blockquote styled as a citation: quoted text with an attribution
    // dash or a bare year in parens.
    RE.get_or_init(|| Regex::new(r#"(?m)^>\s.*(—|--|\(\d{4}\))"#).unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://([\w.\-]+)").unwrap())
}

fn correction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(no[,.]|that'?s (wrong|incorrect|not right)|actually[, ]|wrong[,.]|incorrect)")
            .unwrap()
    })
}

fn acknowledgment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(you'?re right|my mistake|i apologi|sorry|i was wrong|good catch)").unwrap()
    })
}

pub struct HistoryReviewer {
    cfg: HistoryReviewConfig,
}

impl HistoryReviewer {
    pub fn new(cfg: HistoryReviewConfig) -> Self {
        HistoryReviewer { cfg }
    }

    /// Review a window of messages. Paths that appeared in tool output are
    /// verified; everything else an assistant message cites counts against
    /// it.
    pub fn review(&self, messages: &[StoredMessage]) -> Vec<StoredMessage> {
        if !self.cfg.enabled {
            return messages.to_vec();
        }
        let window_start = messages.len().saturating_sub(self.cfg.max_messages);
        let window = &messages[window_start..];

        // Paths a tool actually returned are verified for the whole window.
        let verified_paths = collect_verified_paths(window);

        let mut reviewed: Vec<StoredMessage> = Vec::with_capacity(window.len());
        for msg in window {
            if msg.role != "assistant" {
                reviewed.push(msg.clone());
                continue;
            }
            let signals = fabrication_signals(&msg.content, &verified_paths);
            if signals >= self.cfg.violation_threshold {
                debug!("[history] redacting message with {} fabrication signals", signals);
                let mut redacted = msg.clone();
                redacted.content = REDACTED_PLACEHOLDER.to_string();
                reviewed.push(redacted);
            } else if signals == 1 {
                let mut annotated = msg.clone();
                annotated.content.push_str(ANNOTATION_SUFFIX);
                reviewed.push(annotated);
            } else {
                reviewed.push(msg.clone());
            }
        }

        compress_correction_pairs(reviewed)
    }
}

/// Paths mentioned by tool-role messages (i.e. actually read or written).
fn collect_verified_paths(messages: &[StoredMessage]) -> HashSet<String> {
    let mut verified = HashSet::new();
    for msg in messages.iter().filter(|m| m.role == "tool") {
        for cap in path_re().captures_iter(&msg.content) {
            verified.insert(cap[1].to_string());
        }
    }
    verified
}

/// Count fabrication signals in one assistant message.
fn fabrication_signals(content: &str, verified_paths: &HashSet<String>) -> usize {
    let mut signals = 0;

    // File paths with no verified tool call behind them
    if path_re()
        .captures_iter(content)
        .any(|cap| !verified_paths.contains(&cap[1]))
    {
        signals += 1;
    }

    // Blockquotes styled as citations
    if citation_quote_re().is_match(content) {
        signals += 1;
    }

    // URLs on known-fabricated domains
    for cap in url_re().captures_iter(content) {
        let host = cap[1].to_lowercase();
        if FABRICATED_DOMAINS.iter().any(|d| host == *d || host.ends_with(&format!(".{d}"))) {
            signals += 1;
            break;
        }
    }

    signals
}

/// Collapse user-correction → assistant-acknowledgment pairs into a single
/// summary note.
fn compress_correction_pairs(messages: Vec<StoredMessage>) -> Vec<StoredMessage> {
    let mut out: Vec<StoredMessage> = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let is_pair = i + 1 < messages.len()
            && messages[i].role == "user"
            && messages[i + 1].role == "assistant"
            && correction_re().is_match(messages[i].content.trim())
            && acknowledgment_re().is_match(&messages[i + 1].content);
        if is_pair {
            let gist: String = messages[i].content.chars().take(80).collect();
            out.push(StoredMessage {
                role: "system".to_string(),
                content: format!("[correction noted: {gist}]"),
                timestamp: Utc::now(),
            });
            i += 2;
        } else {
            out.push(messages[i].clone());
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> StoredMessage {
        StoredMessage { role: role.into(), content: content.into(), timestamp: Utc::now() }
    }

    fn reviewer() -> HistoryReviewer {
        HistoryReviewer::new(HistoryReviewConfig::default())
    }

    #[test]
    fn test_two_signals_redact() {
        let messages = vec![msg(
            "assistant",
            "See /etc/secret/notes.txt for details.\n> \"Knowledge is power\" — Francis Bacon (1597)",
        )];
        let out = reviewer().review(&messages);
        assert_eq!(out[0].content, REDACTED_PLACEHOLDER);
    }

    #[test]
    fn test_one_signal_annotates() {
        let messages = vec![msg("assistant", "The config lives at /opt/app/config.yaml now.")];
        let out = reviewer().review(&messages);
        assert!(out[0].content.ends_with(ANNOTATION_SUFFIX));
        assert!(out[0].content.starts_with("The config lives"));
    }

    #[test]
    fn test_tool_verified_path_is_clean() {
        let messages = vec![
            msg("tool", "read_file ok: /opt/app/config.yaml (212 bytes)"),
            msg("assistant", "The config lives at /opt/app/config.yaml now."),
        ];
        let out = reviewer().review(&messages);
        assert_eq!(out[1].content, "The config lives at /opt/app/config.yaml now.");
    }

    #[test]
    fn test_fabricated_domain_counts() {
        let messages = vec![msg(
            "assistant",
            "Sources: https://example.com/raven and /library/poe/raven.txt",
        )];
        let out = reviewer().review(&messages);
        assert_eq!(out[0].content, REDACTED_PLACEHOLDER);
    }

    #[test]
    fn test_correction_pair_compressed() {
        let messages = vec![
            msg("user", "No, the meeting was on Tuesday."),
            msg("assistant", "You're right, my mistake — Tuesday it was."),
            msg("user", "What else is scheduled?"),
        ];
        let out = reviewer().review(&messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, "system");
        assert!(out[0].content.contains("Tuesday"));
        assert_eq!(out[1].content, "What else is scheduled?");
    }

    #[test]
    fn test_disabled_passes_through() {
        let cfg = HistoryReviewConfig { enabled: false, ..Default::default() };
        let messages = vec![msg("assistant", "See /fake/path.txt\n> quote — author (1800)")];
        let out = HistoryReviewer::new(cfg).review(&messages);
        assert_eq!(out[0].content, messages[0].content);
    }

    #[test]
    fn test_user_messages_never_redacted() {
        let messages =
            vec![msg("user", "Check /my/file.txt and https://example.com please\n> x — y (1999)")];
        let out = reviewer().review(&messages);
        assert_eq!(out[0].content, messages[0].content);
    }
}
