// Keystone Shared — shared-volume layout.
// One struct owns every path under the shared filesystem volume so no
// service hard-codes a location. The same layout is used for the live and
// candidate volumes; the orchestrator's sync copies between two of these.
//
//   /shared/
//     sessions.json
//     session_vectors/<session_id>.json
//     sleep_state/prime.md
//     lite_journal/Lite.md
//     council/notes/<ISO-microsec>.md
//     council/archive/<ISO-microsec>.md
//     ha_maintenance

use crate::atoms::error::EngineResult;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SharedVolume {
    root: PathBuf,
}

impl SharedVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SharedVolume { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create every directory the layout needs. Idempotent.
    pub fn ensure_dirs(&self) -> EngineResult<()> {
        for dir in [
            self.root.clone(),
            self.session_vectors_dir(),
            self.knowledge_vectors_dir(),
            self.sleep_state_dir(),
            self.lite_journal_dir(),
            self.council_notes_dir(),
            self.council_archive_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn session_vectors_dir(&self) -> PathBuf {
        self.root.join("session_vectors")
    }

    pub fn session_vector_file(&self, session_id: &str) -> PathBuf {
        self.session_vectors_dir().join(format!("{session_id}.json"))
    }

    /// Knowledge-base collection indices, one per KB. Written by the
    /// training service, read by the engine's probe.
    pub fn knowledge_vectors_dir(&self) -> PathBuf {
        self.root.join("knowledge_vectors")
    }

    pub fn knowledge_vector_file(&self, kb_name: &str) -> PathBuf {
        self.knowledge_vectors_dir().join(format!("{kb_name}.json"))
    }

    fn sleep_state_dir(&self) -> PathBuf {
        self.root.join("sleep_state")
    }

    /// Prime's self-narrated checkpoint, anchor line included.
    pub fn prime_checkpoint(&self) -> PathBuf {
        self.sleep_state_dir().join("prime.md")
    }

    fn lite_journal_dir(&self) -> PathBuf {
        self.root.join("lite_journal")
    }

    /// Lite's running journal, flushed on sleep and shutdown.
    pub fn lite_journal(&self) -> PathBuf {
        self.lite_journal_dir().join("Lite.md")
    }

    pub fn council_notes_dir(&self) -> PathBuf {
        self.root.join("council").join("notes")
    }

    pub fn council_archive_dir(&self) -> PathBuf {
        self.root.join("council").join("archive")
    }

    /// Sentinel file; presence disables automatic failover routing.
    pub fn maintenance_flag(&self) -> PathBuf {
        self.root.join("ha_maintenance")
    }
}
