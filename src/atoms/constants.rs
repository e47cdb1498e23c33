// ── Keystone Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Packet / tool routing ──────────────────────────────────────────────────
// A tool result re-entering the pipeline counts as one reinjection.  The cap
// keeps a confused selector from cycling tool calls forever; hitting it
// forces execution_status = SKIPPED.
pub const DEFAULT_MAX_REINJECTIONS: u32 = 3;

/// Composite selector+review confidence required to approve a tool call.
pub const TOOL_APPROVAL_THRESHOLD: f64 = 0.70;

/// Sampling temperature for the tool selector (Lite, near-deterministic).
pub const TOOL_SELECTOR_TEMPERATURE: f64 = 0.15;

/// Sampling temperature for the tool review pass (Prime).
pub const TOOL_REVIEW_TEMPERATURE: f64 = 0.3;

// ── Semantic probe ─────────────────────────────────────────────────────────
pub const PROBE_SIMILARITY_THRESHOLD: f32 = 0.40;
pub const PROBE_MAX_PHRASES: usize = 8;
pub const PROBE_MIN_PHRASE_LEN: usize = 3;
pub const PROBE_CACHE_MAX_AGE_TURNS: u64 = 20;

// ── Intent detection ───────────────────────────────────────────────────────
pub const EMBED_INTENT_THRESHOLD: f32 = 0.45;
pub const EMBED_INTENT_TOP_K: usize = 3;

// ── History review ─────────────────────────────────────────────────────────
// 2+ fabrication signals in one message ⇒ full redaction; exactly 1 ⇒ the
// message is kept but annotated.
pub const HISTORY_VIOLATION_THRESHOLD: usize = 2;
pub const HISTORY_MAX_MESSAGES: usize = 40;

// ── Knowledge ingestion ────────────────────────────────────────────────────
/// Similarity at or above this against an existing document counts as a
/// near-duplicate and suppresses the save.
pub const KNOWLEDGE_DUPLICATE_THRESHOLD: f32 = 0.85;
/// Only the head of the content is embedded for the duplicate check.
pub const KNOWLEDGE_DUPLICATE_PROBE_CHARS: usize = 500;

// ── Observer ───────────────────────────────────────────────────────────────
pub const OBSERVER_MIN_INTERVAL_SECS: u64 = 15;
pub const OBSERVER_MAX_INVOCATIONS: u32 = 6;

// ── Generation clamps ──────────────────────────────────────────────────────
pub const MAX_TOKENS_FLOOR: u32 = 1;
pub const MAX_TOKENS_CEILING: u32 = 32_768;

// ── Sleep / wake ───────────────────────────────────────────────────────────
/// Anchor line written at the top of the prime checkpoint when sleep begins.
/// Wake uses it to decide which council notes are unseen.
pub const SLEEP_ANCHOR_PREFIX: &str = "Sleep Started: ";

/// Gateway polls `/sleep/status` at this interval while holding a queued
/// message for a sleeping engine.
pub const SLEEP_POLL_INTERVAL_SECS: u64 = 5;
pub const SLEEP_QUEUE_WAIT_SECS: u64 = 120;

// ── Orchestrator ───────────────────────────────────────────────────────────
/// GPU is considered released once device memory drops below this.
pub const VRAM_RELEASED_MIB: u64 = 500;
pub const HANDOFF_HEALTH_TIMEOUT_SECS: u64 = 120;
pub const HANDOFF_HEALTH_INTERVAL_SECS: u64 = 3;
pub const WATCHDOG_INTERVAL_SECS: u64 = 30;
pub const GPU_WAIT_MAX_SECS: u64 = 60;

// ── Timeouts ───────────────────────────────────────────────────────────────
pub const TOOL_RPC_TIMEOUT_SECS: u64 = 30;
pub const WEB_FETCH_TIMEOUT_SECS: u64 = 15;

// ── Web research limits ────────────────────────────────────────────────────
pub const WEB_SEARCH_HOURLY_LIMIT: u32 = 20;
pub const WEB_FETCH_HOURLY_LIMIT: u32 = 50;
pub const WEB_FETCH_MAX_BYTES: usize = 500 * 1024;
pub const WEB_SEARCH_MAX_RESULTS: usize = 10;

// ── Loop detection ─────────────────────────────────────────────────────────
pub const LOOP_TRIGGER_SINGLE: f64 = 0.9;
pub const LOOP_TRIGGER_PAIR: f64 = 0.7;
pub const LOOP_TRIGGER_WEIGHTED: f64 = 0.6;
pub const LOOP_VERBATIM_SIMILARITY: f64 = 0.95;
pub const LOOP_PARAPHRASE_SIMILARITY: f64 = 0.85;

// ── Council ────────────────────────────────────────────────────────────────
pub const COUNCIL_NOTE_TTL_HOURS: i64 = 72;
pub const COUNCIL_PENDING_CAP: usize = 50;
/// Prompts longer than this are a complexity signal on their own.
pub const COUNCIL_LONG_PROMPT_CHARS: usize = 600;

// ── User-visible failure strings ───────────────────────────────────────────
// Stable phrasing; never interpolate internal detail into these.
pub const CATASTROPHIC_FAILURE_MESSAGE: &str = "I encountered an issue handling that.";
pub const EMPTY_PROMPT_DECLINE: &str = "I didn't receive anything to respond to.";
pub const OBSERVER_BLOCK_MESSAGE: &str =
    "I stopped that response because it was going somewhere unreliable. Could you rephrase?";

// ── Session history ────────────────────────────────────────────────────────
pub const SESSION_WINDOW_MESSAGES: usize = 60;

// ── Prompt assembly ────────────────────────────────────────────────────────
/// Prefill injected as the final assistant message after a tool executed, so
/// the model synthesizes from results instead of echoing the call.
pub const TOOL_RESULT_PREFILL: &str = "Based on the results,";

/// Inputs below this word count take the slim prompt path.
pub const SLIM_PROMPT_MAX_WORDS: usize = 4;
