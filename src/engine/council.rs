// Keystone Engine — Council Protocol
// Lite→Prime handoff notes. When Lite answers while Prime sleeps and the
// prompt looks like it deserved the heavier model, Lite leaves a note;
// Prime consumes every note newer than its sleep anchor on wake, exactly
// once, via atomic rename into the archive.
//
// Note filenames carry microsecond precision so two escalations in the
// same second never collide.

use crate::atoms::config::CouncilConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::shared::layout::SharedVolume;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Note model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilNote {
    pub timestamp: DateTime<Utc>,
    pub user_prompt: String,
    pub lite_quick_take: String,
    pub escalation_reason: String,
    pub confidence: f64,
}

impl CouncilNote {
    fn to_markdown(&self) -> String {
        format!(
            "# Council Note\n\n- Timestamp: {}\n- Confidence: {:.2}\n\n## User Prompt\n\n{}\n\n## Lite Quick Take\n\n{}\n\n## Escalation Reason\n\n{}\n",
            self.timestamp.to_rfc3339(),
            self.confidence,
            self.user_prompt,
            self.lite_quick_take,
            self.escalation_reason,
        )
    }

    fn from_markdown(raw: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut confidence = 0.0;
        for line in raw.lines() {
            if let Some(ts) = line.strip_prefix("- Timestamp: ") {
                timestamp = DateTime::parse_from_rfc3339(ts.trim())
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            } else if let Some(c) = line.strip_prefix("- Confidence: ") {
                confidence = c.trim().parse().unwrap_or(0.0);
            }
        }
        let section = |header: &str| -> String {
            raw.split(&format!("## {header}\n"))
                .nth(1)
                .map(|rest| rest.split("\n## ").next().unwrap_or("").trim().to_string())
                .unwrap_or_default()
        };
        Some(CouncilNote {
            timestamp: timestamp?,
            user_prompt: section("User Prompt"),
            lite_quick_take: section("Lite Quick Take"),
            escalation_reason: section("Escalation Reason"),
            confidence,
        })
    }
}

// ── Store ──────────────────────────────────────────────────────────────────

pub struct CouncilStore {
    volume: SharedVolume,
    cfg: CouncilConfig,
}

impl CouncilStore {
    pub fn new(volume: SharedVolume, cfg: CouncilConfig) -> Self {
        CouncilStore { volume, cfg }
    }

    /// Write a pending note. Filename is the microsecond ISO timestamp.
    pub fn write_note(&self, note: &CouncilNote) -> EngineResult<PathBuf> {
        if !self.cfg.enabled {
            return Err(EngineError::Config("council is disabled".into()));
        }
        let dir = self.volume.council_notes_dir();
        std::fs::create_dir_all(&dir)?;
        let name = format!("{}.md", note.timestamp.format("%Y-%m-%dT%H-%M-%S%.6f"));
        let path = dir.join(name);
        std::fs::write(&path, note.to_markdown())?;
        info!("[council] note written: {}", path.display());
        Ok(path)
    }

    /// All pending notes strictly newer than `anchor`, oldest first.
    pub fn pending_since(&self, anchor: DateTime<Utc>) -> EngineResult<Vec<(PathBuf, CouncilNote)>> {
        let dir = self.volume.council_notes_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut notes = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "md").unwrap_or(true) {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            match CouncilNote::from_markdown(&raw) {
                Some(note) if note.timestamp > anchor => notes.push((path, note)),
                Some(_) => {}
                None => warn!("[council] unparseable note skipped: {}", path.display()),
            }
        }
        notes.sort_by_key(|(_, n)| n.timestamp);
        Ok(notes)
    }

    /// Move a consumed note into the archive. Atomic rename; consuming the
    /// same note twice is an error the caller may ignore.
    pub fn archive(&self, path: &Path) -> EngineResult<PathBuf> {
        let archive_dir = self.volume.council_archive_dir();
        std::fs::create_dir_all(&archive_dir)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| EngineError::Other(format!("bad note path {}", path.display())))?;
        let dest = archive_dir.join(file_name);
        std::fs::rename(path, &dest)?;
        Ok(dest)
    }

    /// TTL eviction plus the pending cap. Called from the scheduler tick;
    /// oldest notes go first when over cap.
    pub fn evict_expired(&self) -> EngineResult<usize> {
        let dir = self.volume.council_notes_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::hours(self.cfg.note_ttl_hours);
        let mut all: Vec<(PathBuf, DateTime<Utc>)> = Vec::new();
        let mut evicted = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let raw = std::fs::read_to_string(&path).unwrap_or_default();
            match CouncilNote::from_markdown(&raw) {
                Some(note) if note.timestamp < cutoff => {
                    std::fs::remove_file(&path)?;
                    evicted += 1;
                }
                Some(note) => all.push((path, note.timestamp)),
                None => {}
            }
        }
        if all.len() > self.cfg.pending_cap {
            all.sort_by_key(|(_, ts)| *ts);
            let excess = all.len() - self.cfg.pending_cap;
            for (path, _) in all.into_iter().take(excess) {
                std::fs::remove_file(&path)?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("[council] evicted {} note(s)", evicted);
        }
        Ok(evicted)
    }
}

// ── Complexity assessment ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityAssessment {
    pub escalate: bool,
    pub reason: String,
    pub confidence: f64,
}

const EMOTIONAL_SIGNALS: &[&str] = &[
    "feel", "feeling", "lonely", "grief", "anxious", "anxiety", "depressed", "love", "afraid",
    "scared", "meaning of", "purpose", "why do we", "consciousness", "mortality", "ethics",
    "moral", "philosophy", "philosophical",
];

const SYSTEM_INTERNAL_SIGNALS: &[&str] = &[
    "gpu", "handoff", "orchestrator", "checkpoint", "council", "sleep state", "vram",
    "failover", "maintenance mode", "session sync", "model pool", "your memory",
    "your architecture",
];

/// Post-response check run only when Lite answered with Prime asleep.
/// Keyword-tiered rather than model-scored so it costs nothing.
pub fn assess_complexity(
    prompt: &str,
    _response: &str,
    cfg: &CouncilConfig,
) -> ComplexityAssessment {
    let lower = prompt.to_lowercase();

    if let Some(hit) = EMOTIONAL_SIGNALS.iter().find(|s| lower.contains(*s)) {
        return ComplexityAssessment {
            escalate: true,
            reason: format!("emotional/philosophical content ('{hit}')"),
            confidence: 0.8,
        };
    }
    if let Some(hit) = SYSTEM_INTERNAL_SIGNALS.iter().find(|s| lower.contains(*s)) {
        return ComplexityAssessment {
            escalate: true,
            reason: format!("system-internal topic ('{hit}')"),
            confidence: 0.75,
        };
    }
    if prompt.chars().count() > cfg.long_prompt_chars {
        return ComplexityAssessment {
            escalate: true,
            reason: format!("long prompt (> {} chars)", cfg.long_prompt_chars),
            confidence: 0.6,
        };
    }
    ComplexityAssessment { escalate: false, reason: "routine".into(), confidence: 0.9 }
}

/// Which tier produced a response; rendered as a visible prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouncilTier {
    Lite,
    Prime,
}

impl CouncilTier {
    pub fn tag(&self) -> &'static str {
        match self {
            CouncilTier::Lite => "[Lite]",
            CouncilTier::Prime => "[Prime]",
        }
    }

    pub fn tag_response(&self, text: &str) -> String {
        format!("{} {}", self.tag(), text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CouncilStore) {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();
        (tmp, CouncilStore::new(volume, CouncilConfig::default()))
    }

    fn note_at(ts: DateTime<Utc>) -> CouncilNote {
        CouncilNote {
            timestamp: ts,
            user_prompt: "what is the meaning of life?".into(),
            lite_quick_take: "gave a short answer".into(),
            escalation_reason: "philosophical".into(),
            confidence: 0.8,
        }
    }

    #[test]
    fn test_note_markdown_round_trip() {
        let note = note_at(Utc::now());
        let parsed = CouncilNote::from_markdown(&note.to_markdown()).unwrap();
        assert_eq!(parsed.user_prompt, note.user_prompt);
        assert_eq!(parsed.lite_quick_take, note.lite_quick_take);
        assert_eq!(parsed.escalation_reason, note.escalation_reason);
        assert!((parsed.confidence - note.confidence).abs() < 0.01);
    }

    #[test]
    fn test_pending_since_anchor_filters() {
        let (_tmp, store) = store();
        let old = Utc::now() - Duration::hours(2);
        let new = Utc::now();
        store.write_note(&note_at(old)).unwrap();
        store.write_note(&note_at(new)).unwrap();

        let anchor = Utc::now() - Duration::hours(1);
        let pending = store.pending_since(anchor).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.timestamp.timestamp(), new.timestamp());
    }

    #[test]
    fn test_archive_moves_exactly_once() {
        let (_tmp, store) = store();
        let path = store.write_note(&note_at(Utc::now())).unwrap();
        let archived = store.archive(&path).unwrap();
        assert!(archived.exists());
        assert!(!path.exists());
        // Second consume of the same path fails — it's gone
        assert!(store.archive(&path).is_err());
    }

    #[test]
    fn test_same_second_notes_do_not_collide() {
        let (_tmp, store) = store();
        let base = Utc::now();
        let a = store.write_note(&note_at(base)).unwrap();
        let b = store
            .write_note(&note_at(base + Duration::microseconds(1)))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ttl_eviction() {
        let (_tmp, store) = store();
        let stale = Utc::now() - Duration::hours(COUNCIL_TTL_PLUS_ONE);
        store.write_note(&note_at(stale)).unwrap();
        store.write_note(&note_at(Utc::now())).unwrap();
        let evicted = store.evict_expired().unwrap();
        assert_eq!(evicted, 1);
        let remaining = store.pending_since(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    const COUNCIL_TTL_PLUS_ONE: i64 = crate::atoms::constants::COUNCIL_NOTE_TTL_HOURS + 1;

    #[test]
    fn test_assess_complexity_tiers() {
        let cfg = CouncilConfig::default();
        assert!(assess_complexity("why do we dream? what is consciousness?", "", &cfg).escalate);
        assert!(assess_complexity("how does your gpu handoff work?", "", &cfg).escalate);
        let long = "a ".repeat(400);
        assert!(assess_complexity(&long, "", &cfg).escalate);
        assert!(!assess_complexity("what time is it?", "", &cfg).escalate);
    }

    #[test]
    fn test_tier_tags() {
        assert_eq!(CouncilTier::Lite.tag_response("hi"), "[Lite] hi");
        assert_eq!(CouncilTier::Prime.tag_response("hi"), "[Prime] hi");
    }
}
