// Keystone Engine — Sleep/Wake Manager & Cognitive Checkpoints
// The engine's lifecycle state machine: AWAKE → ENTERING_SLEEP → SLEEPING →
// WAKING → AWAKE. Transitions are mutex-guarded and non-reentrant; callers
// get a State error instead of a double transition.
//
// Checkpoints are not memory serialization. prime.md and the lite journal
// hold self-narrated summaries written at sleep or graceful shutdown; the
// prime checkpoint carries the sleep anchor that wake uses to pick up
// unseen council notes.

use crate::atoms::constants::SLEEP_ANCHOR_PREFIX;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::council::{CouncilNote, CouncilStore};
use crate::shared::layout::SharedVolume;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

// ── State machine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SleepState {
    Awake,
    EnteringSleep,
    Sleeping,
    Waking,
}

#[derive(Debug, Clone, Serialize)]
pub struct SleepStatus {
    pub state: SleepState,
    pub slept_at: Option<DateTime<Utc>>,
    pub woke_at: Option<DateTime<Utc>>,
}

/// Everything wake gathers for injection into the first post-wake turns.
#[derive(Debug, Clone)]
pub struct WakeContext {
    pub anchor: Option<DateTime<Utc>>,
    pub council_notes: Vec<CouncilNote>,
    pub prime_checkpoint: Option<String>,
    pub lite_journal: Option<String>,
}

pub struct SleepManager {
    status: Mutex<SleepStatus>,
    volume: SharedVolume,
}

impl SleepManager {
    pub fn new(volume: SharedVolume) -> Self {
        SleepManager {
            status: Mutex::new(SleepStatus { state: SleepState::Awake, slept_at: None, woke_at: None }),
            volume,
        }
    }

    pub fn state(&self) -> SleepState {
        self.status.lock().state
    }

    pub fn status(&self) -> SleepStatus {
        self.status.lock().clone()
    }

    fn transition(&self, from: SleepState, to: SleepState) -> EngineResult<()> {
        let mut status = self.status.lock();
        if status.state != from {
            return Err(EngineError::State(format!(
                "cannot move to {:?} while {:?} (expected {:?})",
                to, status.state, from
            )));
        }
        info!("[sleep] {:?} → {:?}", status.state, to);
        status.state = to;
        Ok(())
    }

    /// AWAKE → ENTERING_SLEEP. The caller drains the request queue and
    /// notifies the orchestrator between this and `complete_sleep`.
    pub fn begin_entering_sleep(&self) -> EngineResult<()> {
        self.transition(SleepState::Awake, SleepState::EnteringSleep)
    }

    /// Write both checkpoints and commit ENTERING_SLEEP → SLEEPING.
    /// Returns the anchor timestamp recorded in prime.md.
    pub fn complete_sleep(
        &self,
        prime_narrative: &str,
        lite_entry: &str,
    ) -> EngineResult<DateTime<Utc>> {
        let anchor = Utc::now();
        write_prime_checkpoint(&self.volume, prime_narrative, Some(anchor))?;
        append_lite_journal(&self.volume, lite_entry)?;
        self.transition(SleepState::EnteringSleep, SleepState::Sleeping)?;
        self.status.lock().slept_at = Some(anchor);
        Ok(anchor)
    }

    /// SLEEPING → WAKING. The caller asks the orchestrator to reclaim the
    /// GPU and waits for generation-backend health between this and
    /// `complete_wake`.
    pub fn begin_wake(&self) -> EngineResult<()> {
        self.transition(SleepState::Sleeping, SleepState::Waking)
    }

    /// Load checkpoints and all unseen council notes (newer than the prime
    /// anchor), archive them, and commit WAKING → AWAKE.
    pub fn complete_wake(&self, council: &CouncilStore) -> EngineResult<WakeContext> {
        let prime_checkpoint = read_file_opt(&self.volume.prime_checkpoint());
        let lite_journal = read_file_opt(&self.volume.lite_journal());
        let anchor = prime_checkpoint.as_deref().and_then(parse_sleep_anchor);

        let mut notes = Vec::new();
        if let Some(anchor_ts) = anchor {
            for (path, note) in council.pending_since(anchor_ts)? {
                if let Err(e) = council.archive(&path) {
                    warn!("[sleep] could not archive {}: {}", path.display(), e);
                    continue;
                }
                notes.push(note);
            }
        }

        self.transition(SleepState::Waking, SleepState::Awake)?;
        self.status.lock().woke_at = Some(Utc::now());
        info!("[sleep] wake complete, {} council note(s) consumed", notes.len());
        Ok(WakeContext { anchor, council_notes: notes, prime_checkpoint, lite_journal })
    }

    /// Synchronous checkpoint used by the SIGTERM handler: no state change,
    /// just persist the narratives inside the stop-grace window.
    pub fn checkpoint_now(&self, prime_narrative: &str, lite_entry: &str) -> EngineResult<()> {
        let anchor = self.status.lock().slept_at;
        write_prime_checkpoint(&self.volume, prime_narrative, anchor)?;
        append_lite_journal(&self.volume, lite_entry)?;
        Ok(())
    }
}

// ── Checkpoint files ───────────────────────────────────────────────────────

/// Write prime.md. The anchor line precedes the narrative so wake can parse
/// it without reading the whole file semantically.
pub fn write_prime_checkpoint(
    volume: &SharedVolume,
    narrative: &str,
    anchor: Option<DateTime<Utc>>,
) -> EngineResult<()> {
    let path = volume.prime_checkpoint();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = String::from("# Prime Checkpoint\n\n");
    if let Some(ts) = anchor {
        body.push_str(&format!(
            "{}{}\n\n",
            SLEEP_ANCHOR_PREFIX,
            ts.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }
    body.push_str(narrative);
    body.push('\n');
    std::fs::write(&path, body)?;
    Ok(())
}

/// Append a timestamped entry to the lite journal.
pub fn append_lite_journal(volume: &SharedVolume, entry: &str) -> EngineResult<()> {
    if entry.trim().is_empty() {
        return Ok(());
    }
    let path = volume.lite_journal();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut existing = std::fs::read_to_string(&path).unwrap_or_default();
    existing.push_str(&format!(
        "\n## {}\n\n{}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        entry.trim()
    ));
    std::fs::write(&path, existing)?;
    Ok(())
}

/// Parse the sleep anchor out of a prime checkpoint body.
pub fn parse_sleep_anchor(body: &str) -> Option<DateTime<Utc>> {
    body.lines()
        .find_map(|line| line.trim().strip_prefix(SLEEP_ANCHOR_PREFIX))
        .and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn read_file_opt(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::config::CouncilConfig;

    fn setup() -> (tempfile::TempDir, SleepManager, CouncilStore) {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();
        let manager = SleepManager::new(volume.clone());
        let council = CouncilStore::new(volume, CouncilConfig::default());
        (tmp, manager, council)
    }

    #[test]
    fn test_full_cycle() {
        let (_tmp, manager, council) = setup();
        assert_eq!(manager.state(), SleepState::Awake);

        manager.begin_entering_sleep().unwrap();
        let anchor = manager
            .complete_sleep("Spent the evening discussing poetry.", "Quiet shift.")
            .unwrap();
        assert_eq!(manager.state(), SleepState::Sleeping);

        manager.begin_wake().unwrap();
        let ctx = manager.complete_wake(&council).unwrap();
        assert_eq!(manager.state(), SleepState::Awake);
        // Anchor written at sleep matches the one read at wake (±1s after
        // second-precision serialization)
        let parsed = ctx.anchor.expect("anchor must round-trip");
        assert!((parsed.timestamp() - anchor.timestamp()).abs() <= 1);
        assert!(ctx.prime_checkpoint.unwrap().contains("poetry"));
    }

    #[test]
    fn test_transitions_are_non_reentrant() {
        let (_tmp, manager, _council) = setup();
        manager.begin_entering_sleep().unwrap();
        let err = manager.begin_entering_sleep().unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
        // Waking from ENTERING_SLEEP is also illegal
        assert!(manager.begin_wake().is_err());
    }

    #[test]
    fn test_wake_consumes_only_notes_after_anchor() {
        let (_tmp, manager, council) = setup();

        // Note from before this sleep cycle
        let stale = CouncilNote {
            timestamp: Utc::now() - chrono::Duration::hours(5),
            user_prompt: "old".into(),
            lite_quick_take: "old".into(),
            escalation_reason: "old".into(),
            confidence: 0.5,
        };
        council.write_note(&stale).unwrap();

        manager.begin_entering_sleep().unwrap();
        manager.complete_sleep("narrative", "entry").unwrap();

        // Note written while sleeping
        let fresh = CouncilNote {
            timestamp: Utc::now() + chrono::Duration::seconds(2),
            user_prompt: "what is consciousness?".into(),
            lite_quick_take: "answered briefly".into(),
            escalation_reason: "philosophical".into(),
            confidence: 0.8,
        };
        council.write_note(&fresh).unwrap();

        manager.begin_wake().unwrap();
        let ctx = manager.complete_wake(&council).unwrap();
        assert_eq!(ctx.council_notes.len(), 1);
        assert_eq!(ctx.council_notes[0].user_prompt, "what is consciousness?");

        // Consumed exactly once: a second wake cycle sees nothing pending
        manager.begin_entering_sleep().unwrap();
        manager.complete_sleep("n2", "e2").unwrap();
        manager.begin_wake().unwrap();
        let ctx2 = manager.complete_wake(&council).unwrap();
        assert!(ctx2.council_notes.is_empty());
    }

    #[test]
    fn test_prime_checkpoint_round_trip_lossless() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        let narrative = "Talked with K. about The Raven.\nHelped debug a failing sync.";
        write_prime_checkpoint(&volume, narrative, None).unwrap();
        let body = std::fs::read_to_string(volume.prime_checkpoint()).unwrap();
        assert!(body.contains(narrative));
        assert!(parse_sleep_anchor(&body).is_none());
    }

    #[test]
    fn test_anchor_parses() {
        let body = "# Prime Checkpoint\n\nSleep Started: 2026-08-01T10:00:00Z\n\nnarrative";
        let anchor = parse_sleep_anchor(body).unwrap();
        assert_eq!(anchor.to_rfc3339_opts(SecondsFormat::Secs, true), "2026-08-01T10:00:00Z");
    }

    #[test]
    fn test_checkpoint_now_is_sigterm_safe() {
        let (_tmp, manager, _council) = setup();
        manager.checkpoint_now("interrupted mid-conversation", "flushed").unwrap();
        assert_eq!(manager.state(), SleepState::Awake, "checkpoint_now must not change state");
    }
}
