// Keystone Orchestrator — HA Session Sync
// One-way replication, live → candidate, on the watchdog cycle: the
// session table, per-session vector indices, and both cognitive
// checkpoints. Council archive and history directories are deliberately
// excluded — the standby needs working state, not the museum.
//
// The copy is a handful of small files and runs in milliseconds, which
// bounds failover staleness at one sync interval plus one copy.

use crate::atoms::error::EngineResult;
use crate::shared::layout::SharedVolume;
use crate::shared::maintenance::maintenance_active;
use log::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub files_copied: usize,
    pub skipped: bool,
}

/// Run one replication pass. Skips entirely when the maintenance flag is
/// present on the live volume.
pub fn sync_session_state(live: &SharedVolume, candidate: &SharedVolume) -> EngineResult<SyncReport> {
    if maintenance_active(live) {
        debug!("[sync] maintenance flag present — skipping replication");
        return Ok(SyncReport { files_copied: 0, skipped: true });
    }
    candidate.ensure_dirs()?;
    let mut copied = 0usize;

    // Session table
    copied += copy_if_exists(&live.sessions_file(), &candidate.sessions_file())?;

    // Per-session vector indices (flat files only; no recursion into
    // anything that looks like history)
    let src_dir = live.session_vectors_dir();
    if src_dir.is_dir() {
        for entry in std::fs::read_dir(&src_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Some(name) = path.file_name() else { continue };
            copied += copy_if_exists(&path, &candidate.session_vectors_dir().join(name))?;
        }
    }

    // Cognitive checkpoints
    copied += copy_if_exists(&live.prime_checkpoint(), &candidate.prime_checkpoint())?;
    copied += copy_if_exists(&live.lite_journal(), &candidate.lite_journal())?;

    debug!("[sync] replicated {} file(s) to candidate", copied);
    Ok(SyncReport { files_copied: copied, skipped: false })
}

fn copy_if_exists(src: &std::path::Path, dest: &std::path::Path) -> EngineResult<usize> {
    if !src.exists() {
        return Ok(0);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::copy(src, dest) {
        Ok(_) => Ok(1),
        Err(e) => {
            warn!("[sync] could not copy {}: {}", src.display(), e);
            Ok(0)
        }
    }
}
