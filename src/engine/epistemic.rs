// Keystone Engine — Epistemic Post-Processing
// Cleans raw generation output before it can reach a user or the session
// history: think-tag stripping (with model-variant tolerance), stray CJK
// artifact removal, and whitespace normalization.
//
// The two-stage empty-response recovery (retry without tags, then present
// extracted reasoning) is driven by the pipeline; this module supplies the
// text operations it composes.

use crate::atoms::config::EpistemicConfig;
use regex::Regex;
use std::sync::OnceLock;

fn think_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Tag name variants seen across model families; non-greedy body.
    RE.get_or_init(|| {
        Regex::new(r"(?s)<(think|thinking|thought|reasoning)>.*?</(think|thinking|thought|reasoning)>")
            .unwrap()
    })
}

fn open_think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // An opening tag with no close swallows the rest of the text — models
    // sometimes never close the tag before running out of tokens.
    RE.get_or_init(|| Regex::new(r"(?s)<(think|thinking|thought|reasoning)>.*$").unwrap())
}

/// Remove reasoning blocks wherever a model variant put them.
pub fn strip_think_tags(text: &str) -> String {
    let stripped = think_block_re().replace_all(text, "");
    let stripped = open_think_re().replace_all(&stripped, "");
    stripped.trim().to_string()
}

/// Pull the reasoning content OUT of the tags, for the second recovery
/// stage ("Based on my analysis: …") when the visible channel was empty.
pub fn extract_think_content(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?s)<(?:think|thinking|thought|reasoning)>(.*?)(?:</(?:think|thinking|thought|reasoning)>|$)")
            .unwrap()
    });
    let mut parts = Vec::new();
    for cap in re.captures_iter(text) {
        let body = cap[1].trim();
        if !body.is_empty() {
            parts.push(body.to_string());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Remove short CJK runs (artifacts of multilingual token bleed). Runs
/// longer than `max_len` are intentional content and stay.
pub fn remove_stray_cjk(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = String::new();
    for ch in text.chars() {
        if is_cjk(ch) {
            run.push(ch);
        } else {
            if !run.is_empty() {
                if run.chars().count() > max_len {
                    out.push_str(&run);
                }
                run.clear();
            }
            out.push(ch);
        }
    }
    if !run.is_empty() && run.chars().count() > max_len {
        out.push_str(&run);
    }
    out
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // Extension A
        | 0x3040..=0x30FF    // Hiragana + Katakana
        | 0xAC00..=0xD7AF    // Hangul syllables
    )
}

/// Collapse runs of spaces left behind by the removals above.
pub fn collapse_spaces(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"  +").unwrap());
    re.replace_all(text, " ").to_string()
}

/// Full post-processing pass. Returns the cleaned text; empty output means
/// the pipeline should run its recovery stages.
pub fn postprocess(text: &str, cfg: &EpistemicConfig) -> String {
    if !cfg.enabled {
        return text.trim().to_string();
    }
    let cleaned = strip_think_tags(text);
    let cleaned = remove_stray_cjk(&cleaned, cfg.max_stray_cjk_chars);
    collapse_spaces(&cleaned).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_closed_tags() {
        let out = strip_think_tags("<think>hmm, tricky</think>The answer is 4.");
        assert_eq!(out, "The answer is 4.");
    }

    #[test]
    fn test_strip_variant_tags() {
        let out = strip_think_tags("<thinking>let me see</thinking>Done.");
        assert_eq!(out, "Done.");
        let out = strip_think_tags("<reasoning>because</reasoning>Sure.");
        assert_eq!(out, "Sure.");
    }

    #[test]
    fn test_strip_unclosed_tag_swallows_tail() {
        let out = strip_think_tags("Partial answer. <think>and then the model ran out");
        assert_eq!(out, "Partial answer.");
    }

    #[test]
    fn test_extract_think_content_for_recovery() {
        let text = "<think>The capital of France is Paris.</think>";
        assert!(strip_think_tags(text).is_empty());
        let extracted = extract_think_content(text).unwrap();
        assert!(extracted.contains("Paris"));
    }

    #[test]
    fn test_short_cjk_run_removed_long_preserved() {
        let short = "The word 你好 means hello.";
        assert_eq!(remove_stray_cjk(short, 10), "The word  means hello.");

        let long = "Here is the requested passage: 春眠不觉晓处处闻啼鸟夜来风雨声花落知多少";
        let kept = remove_stray_cjk(long, 10);
        assert!(kept.contains("春眠不觉晓"), "intentional CJK block must be preserved");
    }

    #[test]
    fn test_collapse_spaces() {
        assert_eq!(collapse_spaces("a  b   c"), "a b c");
    }

    #[test]
    fn test_postprocess_composes() {
        let cfg = EpistemicConfig::default();
        let out = postprocess("<think>x</think>Result 好  here.", &cfg);
        assert_eq!(out, "Result here.");
    }
}
