// Keystone Engine — Loop Detection
// Five parallel detectors vote on whether a session is stuck: tool-call
// repetition, output similarity, state oscillation, error cycling, and
// token patterns. The aggregator fires on one strong vote, two moderate
// votes, or a weighted blend.
//
// Recovery is warn-then-block: the first trigger attaches a warning, the
// next fires a reset that preserves history and objectives but injects a
// <loop-recovery> block naming the pattern. The escalation ladder hardens
// the constraint with each reset and asks for user intervention at three.

use crate::atoms::config::LoopDetectionConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

// ── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct ToolCallRecord {
    name: String,
    params: String,
    result: String,
}

#[derive(Debug, Default)]
struct SessionLoopState {
    tool_calls: Vec<ToolCallRecord>,
    outputs: Vec<String>,
    exec_states: Vec<String>,
    errors: Vec<String>,
    warned: bool,
    reset_count: u32,
}

const HISTORY_CAP: usize = 24;

fn push_capped<T>(v: &mut Vec<T>, item: T) {
    v.push(item);
    if v.len() > HISTORY_CAP {
        v.remove(0);
    }
}

// ── Verdict ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DetectorScores {
    pub tool_repetition: f64,
    pub output_similarity: f64,
    pub state_oscillation: f64,
    pub error_cycle: f64,
    pub token_pattern: f64,
}

impl DetectorScores {
    fn all(&self) -> [f64; 5] {
        [
            self.tool_repetition,
            self.output_similarity,
            self.state_oscillation,
            self.error_cycle,
            self.token_pattern,
        ]
    }

    fn dominant_pattern(&self) -> &'static str {
        let scores = self.all();
        let names = [
            "tool-call repetition",
            "output similarity",
            "state oscillation",
            "error cycle",
            "token pattern",
        ];
        let mut best = 0;
        for (i, s) in scores.iter().enumerate() {
            if *s > scores[best] {
                best = i;
            }
        }
        names[best]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopVerdict {
    pub triggered: bool,
    pub pattern: String,
    pub scores: DetectorScores,
}

/// What the pipeline should do after a trigger.
#[derive(Debug, Clone)]
pub enum LoopAction {
    /// First trigger: attach a note, let the turn stand.
    Warn { note: String },
    /// Subsequent trigger: halt the attempt, inject recovery context.
    Reset { recovery_context: String, reset_count: u32, request_user: bool },
}

// ── Detector ───────────────────────────────────────────────────────────────

pub struct LoopDetector {
    cfg: LoopDetectionConfig,
    sessions: Mutex<HashMap<String, SessionLoopState>>,
}

impl LoopDetector {
    pub fn new(cfg: LoopDetectionConfig) -> Self {
        LoopDetector { cfg, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn record_tool_call(&self, session: &str, name: &str, params: &str, result: &str) {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session.to_string()).or_default();
        push_capped(
            &mut state.tool_calls,
            ToolCallRecord {
                name: name.to_string(),
                params: params.to_string(),
                result: result.chars().take(200).collect(),
            },
        );
    }

    pub fn record_output(&self, session: &str, text: &str) {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session.to_string()).or_default();
        push_capped(&mut state.outputs, text.to_string());
    }

    pub fn record_exec_state(&self, session: &str, exec_state: &str) {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session.to_string()).or_default();
        push_capped(&mut state.exec_states, exec_state.to_string());
    }

    pub fn record_error(&self, session: &str, error: &str) {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session.to_string()).or_default();
        push_capped(&mut state.errors, error.to_string());
    }

    pub fn reset_count(&self, session: &str) -> u32 {
        self.sessions.lock().get(session).map(|s| s.reset_count).unwrap_or(0)
    }

    /// Run all five detectors and aggregate.
    pub fn evaluate(&self, session: &str) -> LoopVerdict {
        let sessions = self.sessions.lock();
        let Some(state) = sessions.get(session) else {
            return LoopVerdict {
                triggered: false,
                pattern: String::new(),
                scores: DetectorScores {
                    tool_repetition: 0.0,
                    output_similarity: 0.0,
                    state_oscillation: 0.0,
                    error_cycle: 0.0,
                    token_pattern: 0.0,
                },
            };
        };

        let scores = DetectorScores {
            tool_repetition: score_tool_repetition(&state.tool_calls),
            output_similarity: score_output_similarity(&state.outputs, &self.cfg),
            state_oscillation: score_oscillation(&state.exec_states),
            error_cycle: score_error_cycle(&state.errors),
            token_pattern: state
                .outputs
                .last()
                .map(|o| score_token_pattern(o))
                .unwrap_or(0.0),
        };

        let all = scores.all();
        let any_strong = all.iter().any(|s| *s >= self.cfg.single_detector_trigger);
        let moderate = all.iter().filter(|s| **s >= self.cfg.pair_detector_trigger).count() >= 2;
        let weighted = all.iter().sum::<f64>() / all.len() as f64 >= self.cfg.weighted_trigger;
        let triggered = self.cfg.enabled && (any_strong || moderate || weighted);

        LoopVerdict {
            triggered,
            pattern: if triggered { scores.dominant_pattern().to_string() } else { String::new() },
            scores,
        }
    }

    /// Apply the warn-then-block policy for a triggered verdict.
    pub fn on_trigger(&self, session: &str, verdict: &LoopVerdict) -> LoopAction {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session.to_string()).or_default();
        if !state.warned {
            state.warned = true;
            return LoopAction::Warn {
                note: format!("[loop warning: {} detected]", verdict.pattern),
            };
        }
        state.reset_count += 1;
        let reset_count = state.reset_count;
        // Reset is non-destructive: history and objectives stay; only the
        // repetition records clear so the next attempt is judged fresh.
        state.tool_calls.clear();
        state.outputs.clear();
        state.errors.clear();
        state.warned = false;

        let constraint = constraint_for(reset_count, &verdict.pattern, &state.exec_states);
        LoopAction::Reset {
            recovery_context: format!(
                "<loop-recovery>\nPattern detected: {}.\n{}\n</loop-recovery>",
                verdict.pattern, constraint
            ),
            reset_count,
            request_user: reset_count >= 3,
        }
    }
}

fn constraint_for(reset_count: u32, pattern: &str, _states: &[String]) -> String {
    match reset_count {
        1 => format!("Try a different approach than the one that produced the {pattern}."),
        2 => format!(
            "Do NOT repeat the actions involved in the {pattern}. Choose a structurally different strategy or state what is blocking you."
        ),
        _ => "Stop and ask the user how to proceed; automated recovery has been exhausted."
            .to_string(),
    }
}

// ── Individual detectors ───────────────────────────────────────────────────

fn score_tool_repetition(calls: &[ToolCallRecord]) -> f64 {
    if calls.len() < 3 {
        return 0.0;
    }
    let tail = &calls[calls.len().saturating_sub(4)..];

    // Exact repetition: same call 3+ times running
    let last = &calls[calls.len() - 1];
    let exact_run = calls
        .iter()
        .rev()
        .take_while(|c| c.name == last.name && c.params == last.params)
        .count();
    if exact_run >= 3 {
        return 1.0;
    }

    // Ping-pong: A-B-A-B over the last four calls
    if tail.len() == 4 {
        let sig = |c: &ToolCallRecord| (c.name.clone(), c.params.clone());
        if sig(&tail[0]) == sig(&tail[2]) && sig(&tail[1]) == sig(&tail[3]) && sig(&tail[0]) != sig(&tail[1])
        {
            return 0.95;
        }
    }

    // Same result 3+ times running regardless of call shape
    let result_run = calls
        .iter()
        .rev()
        .take_while(|c| !c.result.is_empty() && c.result == last.result)
        .count();
    if result_run >= 3 {
        return 0.85;
    }
    0.0
}

fn score_output_similarity(outputs: &[String], cfg: &LoopDetectionConfig) -> f64 {
    if outputs.len() < 2 {
        return 0.0;
    }
    let last = &outputs[outputs.len() - 1];
    let mut verbatim = 0usize;
    let mut paraphrase = 0usize;
    for prev in outputs.iter().rev().skip(1).take(5) {
        let sim = text_similarity(last, prev);
        if sim >= cfg.verbatim_similarity {
            verbatim += 1;
        } else if sim >= cfg.paraphrase_similarity {
            paraphrase += 1;
        }
    }
    if verbatim >= 1 {
        return 1.0;
    }
    if paraphrase >= 2 {
        return 0.8;
    }
    0.0
}

fn score_oscillation(states: &[String]) -> f64 {
    if states.len() < 4 {
        return 0.0;
    }
    let tail = &states[states.len() - 4..];
    if tail[0] == tail[2] && tail[1] == tail[3] && tail[0] != tail[1] {
        0.8
    } else {
        0.0
    }
}

fn score_error_cycle(errors: &[String]) -> f64 {
    if errors.len() < 3 {
        return 0.0;
    }
    let last = &errors[errors.len() - 1];
    let run = errors.iter().rev().take_while(|e| *e == last).count();
    if run >= 3 {
        return 0.9;
    }
    // Whack-a-mole: fixing A surfaces B, fixing B surfaces A again
    let tail = &errors[errors.len() - 3..];
    if tail[0] == tail[2] && tail[0] != tail[1] {
        return 0.7;
    }
    0.0
}

pub(crate) fn score_token_pattern(output: &str) -> f64 {
    // Character degeneration: one character repeated at length
    let mut run_char = ' ';
    let mut run_len = 0usize;
    for ch in output.chars() {
        if ch == run_char && !ch.is_whitespace() {
            run_len += 1;
            if run_len >= 20 {
                return 1.0;
            }
        } else {
            run_char = ch;
            run_len = 1;
        }
    }
    // Identical phrase 3+ times
    let words: Vec<&str> = output.split_whitespace().collect();
    if words.len() >= 12 {
        for window in 3..=6 {
            if words.len() < window * 3 {
                continue;
            }
            for start in 0..words.len() - window * 3 + 1 {
                let a = &words[start..start + window];
                let b = &words[start + window..start + window * 2];
                let c = &words[start + window * 2..start + window * 3];
                if a == b && b == c {
                    return 0.9;
                }
            }
        }
    }
    0.0
}

// ── Similarity ─────────────────────────────────────────────────────────────

/// Blend of word-level Jaccard, character trigram overlap, and structural
/// shape. Each alone misclassifies; together they separate verbatim,
/// paraphrase, and unrelated reliably enough for thresholding.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let jaccard = {
        let wa: HashSet<&str> = a.split_whitespace().collect();
        let wb: HashSet<&str> = b.split_whitespace().collect();
        let inter = wa.intersection(&wb).count() as f64;
        let union = wa.union(&wb).count() as f64;
        if union == 0.0 { 0.0 } else { inter / union }
    };
    let trigram = {
        let grams = |s: &str| -> HashSet<String> {
            let chars: Vec<char> = s.chars().collect();
            chars.windows(3).map(|w| w.iter().collect()).collect()
        };
        let ga = grams(a);
        let gb = grams(b);
        let inter = ga.intersection(&gb).count() as f64;
        let union = ga.union(&gb).count() as f64;
        if union == 0.0 { 0.0 } else { inter / union }
    };
    let structural = {
        let la = a.lines().count() as f64;
        let lb = b.lines().count() as f64;
        let lines = 1.0 - ((la - lb).abs() / la.max(lb).max(1.0));
        let ca = a.len() as f64;
        let cb = b.len() as f64;
        let chars = 1.0 - ((ca - cb).abs() / ca.max(cb));
        (lines + chars) / 2.0
    };
    0.45 * jaccard + 0.35 * trigram + 0.2 * structural
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> LoopDetector {
        LoopDetector::new(LoopDetectionConfig::default())
    }

    #[test]
    fn test_exact_tool_repetition() {
        let d = detector();
        for _ in 0..3 {
            d.record_tool_call("s", "read_file", r#"{"path":"a"}"#, "contents");
        }
        let v = d.evaluate("s");
        assert!(v.triggered);
        assert!(v.scores.tool_repetition >= 0.9);
        assert_eq!(v.pattern, "tool-call repetition");
    }

    #[test]
    fn test_ping_pong_detection() {
        let d = detector();
        d.record_tool_call("s", "read_file", r#"{"path":"a"}"#, "r1");
        d.record_tool_call("s", "write_file", r#"{"path":"b"}"#, "r2");
        d.record_tool_call("s", "read_file", r#"{"path":"a"}"#, "r1");
        d.record_tool_call("s", "write_file", r#"{"path":"b"}"#, "r2");
        let v = d.evaluate("s");
        assert!(v.scores.tool_repetition >= 0.9, "got {:?}", v.scores);
        assert!(v.triggered);
    }

    #[test]
    fn test_verbatim_output_similarity() {
        let d = detector();
        let text = "I will now check the configuration file for errors and report back.";
        d.record_output("s", text);
        d.record_output("s", text);
        let v = d.evaluate("s");
        assert!(v.scores.output_similarity >= 0.9);
        assert!(v.triggered);
    }

    #[test]
    fn test_error_cycle() {
        let d = detector();
        for _ in 0..3 {
            d.record_error("s", "permission denied: /etc/shadow");
        }
        let v = d.evaluate("s");
        assert!(v.scores.error_cycle >= 0.9);
    }

    #[test]
    fn test_state_oscillation() {
        let d = detector();
        for s in ["PENDING", "SKIPPED", "PENDING", "SKIPPED"] {
            d.record_exec_state("s", s);
        }
        let v = d.evaluate("s");
        assert!(v.scores.state_oscillation >= 0.7);
    }

    #[test]
    fn test_char_degeneration() {
        assert_eq!(score_token_pattern(&"z".repeat(40)), 1.0);
        assert_eq!(score_token_pattern("a normal sentence with no loops"), 0.0);
    }

    #[test]
    fn test_phrase_repetition() {
        let looped = "let me check that again let me check that again let me check that again ok";
        assert!(score_token_pattern(looped) >= 0.9);
    }

    #[test]
    fn test_no_trigger_on_healthy_session() {
        let d = detector();
        d.record_tool_call("s", "read_file", r#"{"path":"a"}"#, "r1");
        d.record_tool_call("s", "web_search", r#"{"query":"x"}"#, "r2");
        d.record_output("s", "Here is the summary of the file.");
        d.record_output("s", "The search returned three relevant pages about lighthouses.");
        let v = d.evaluate("s");
        assert!(!v.triggered, "{:?}", v.scores);
    }

    #[test]
    fn test_warn_then_reset_escalation() {
        let d = detector();
        for _ in 0..3 {
            d.record_tool_call("s", "read_file", r#"{"path":"a"}"#, "same");
        }
        let v = d.evaluate("s");
        assert!(v.triggered);

        // First trigger warns
        match d.on_trigger("s", &v) {
            LoopAction::Warn { note } => assert!(note.contains("loop warning")),
            other => panic!("expected warn, got {other:?}"),
        }

        // Second trigger resets with recovery context
        match d.on_trigger("s", &v) {
            LoopAction::Reset { recovery_context, reset_count, request_user } => {
                assert!(recovery_context.starts_with("<loop-recovery>"));
                assert!(recovery_context.contains("tool-call repetition"));
                assert_eq!(reset_count, 1);
                assert!(!request_user);
            }
            other => panic!("expected reset, got {other:?}"),
        }

        // Drive two more resets to reach the user-intervention rung
        d.on_trigger("s", &v); // warn again (flag cleared on reset)
        match d.on_trigger("s", &v) {
            LoopAction::Reset { reset_count, .. } => assert_eq!(reset_count, 2),
            other => panic!("expected reset, got {other:?}"),
        }
        d.on_trigger("s", &v);
        match d.on_trigger("s", &v) {
            LoopAction::Reset { request_user, reset_count, recovery_context } => {
                assert_eq!(reset_count, 3);
                assert!(request_user);
                assert!(recovery_context.contains("ask the user"));
            }
            other => panic!("expected reset, got {other:?}"),
        }
    }

    #[test]
    fn test_similarity_separates_cases() {
        let a = "The quick brown fox jumps over the lazy dog near the river.";
        let b = "The quick brown fox jumps over the lazy dog near the river.";
        let c = "A swift auburn fox leaps above a sleepy hound by the stream.";
        assert!(text_similarity(a, b) >= 0.99);
        assert!(text_similarity(a, c) < 0.5);
    }
}
