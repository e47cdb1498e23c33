// Keystone Tool Server — Approval Queue
// Sensitive tool calls park here until a human resolves them. The queue
// persists as JSON on the shared volume so a tool-server restart loses
// nothing. Resolution marks the entry; the caller re-dispatches approved
// work with the entry id as its ticket.

use crate::atoms::error::{EngineError, EngineResult};
use crate::shared::layout::SharedVolume;
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub id: String,
    pub tool: String,
    pub params: Value,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

pub struct ApprovalQueue {
    path: PathBuf,
    entries: Mutex<Vec<ApprovalEntry>>,
}

impl ApprovalQueue {
    pub fn open(volume: &SharedVolume) -> EngineResult<Self> {
        let path = volume.root().join("approvals.json");
        let entries = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        Ok(ApprovalQueue { path, entries: Mutex::new(entries) })
    }

    pub fn submit(&self, tool: &str, params: Value, session_id: &str) -> EngineResult<ApprovalEntry> {
        let entry = ApprovalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            params,
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            status: ApprovalStatus::Pending,
        };
        {
            let mut entries = self.entries.lock();
            entries.push(entry.clone());
        }
        self.persist()?;
        info!("[tools] approval queued: {} for {}", entry.id, entry.tool);
        Ok(entry)
    }

    pub fn list(&self, status: Option<ApprovalStatus>) -> Vec<ApprovalEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Resolve a pending entry. Resolving twice is a State error.
    pub fn resolve(&self, id: &str, approve: bool) -> EngineResult<ApprovalEntry> {
        let resolved = {
            let mut entries = self.entries.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| EngineError::Other(format!("no approval entry {id}")))?;
            if entry.status != ApprovalStatus::Pending {
                return Err(EngineError::State(format!(
                    "approval {id} already {:?}",
                    entry.status
                )));
            }
            entry.status = if approve { ApprovalStatus::Approved } else { ApprovalStatus::Denied };
            entry.clone()
        };
        self.persist()?;
        info!("[tools] approval {} → {:?}", id, resolved.status);
        Ok(resolved)
    }

    /// Whether a call carrying this ticket may run a sensitive tool.
    pub fn is_approved(&self, id: &str, tool: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.id == id && e.tool == tool && e.status == ApprovalStatus::Approved)
    }

    fn persist(&self) -> EngineResult<()> {
        let entries = self.entries.lock();
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&*entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> (tempfile::TempDir, ApprovalQueue) {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();
        (tmp, ApprovalQueue::open(&volume).unwrap())
    }

    #[test]
    fn test_submit_list_resolve() {
        let (_tmp, q) = queue();
        let entry = q
            .submit("write_file", json!({"path": "/knowledge/x.txt"}), "web_a")
            .unwrap();
        assert_eq!(q.list(Some(ApprovalStatus::Pending)).len(), 1);

        let resolved = q.resolve(&entry.id, true).unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(q.is_approved(&entry.id, "write_file"));
        assert!(!q.is_approved(&entry.id, "run_shell"), "ticket is tool-scoped");
        assert!(q.list(Some(ApprovalStatus::Pending)).is_empty());
    }

    #[test]
    fn test_double_resolution_rejected() {
        let (_tmp, q) = queue();
        let entry = q.submit("run_shell", json!({"command": "ls"}), "web_a").unwrap();
        q.resolve(&entry.id, false).unwrap();
        assert!(matches!(q.resolve(&entry.id, true), Err(EngineError::State(_))));
        assert!(!q.is_approved(&entry.id, "run_shell"));
    }

    #[test]
    fn test_queue_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let volume = SharedVolume::new(tmp.path());
        volume.ensure_dirs().unwrap();
        let id = {
            let q = ApprovalQueue::open(&volume).unwrap();
            q.submit("write_file", json!({}), "web_a").unwrap().id
        };
        let q = ApprovalQueue::open(&volume).unwrap();
        assert_eq!(q.list(None).len(), 1);
        q.resolve(&id, true).unwrap();
        assert!(q.is_approved(&id, "write_file"));
    }
}
