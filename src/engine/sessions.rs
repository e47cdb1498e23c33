// Keystone Engine — Session Manager
// Sessions live in `sessions.json` on the shared volume so the HA sync can
// replicate them wholesale. Message history is append-only and capped by a
// sliding window; retrieval over older turns goes through the per-session
// vector index instead.
//
// Session ids are surface-scoped: `discord_dm_<user>`, `web_<uuid>`,
// `cli_<ts>`.

use crate::atoms::constants::SESSION_WINDOW_MESSAGES;
use crate::atoms::error::EngineResult;
use crate::engine::epistemic::strip_think_tags;
use crate::shared::layout::SharedVolume;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub turn_count: u64,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

/// Thread-safe session table. The in-memory map is the source of truth;
/// every mutation rewrites sessions.json (small at the window cap, and the
/// HA sync wants a single file to copy).
pub struct SessionStore {
    volume: SharedVolume,
    sessions: Mutex<BTreeMap<String, SessionRecord>>,
    /// Per-session turn serialization: two requests on the same session
    /// queue FIFO on this lock; different sessions run in parallel.
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    window: usize,
}

impl SessionStore {
    /// Open the store, loading any existing session table.
    pub fn open(volume: SharedVolume) -> EngineResult<Self> {
        volume.ensure_dirs()?;
        let path = volume.sessions_file();
        let sessions = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    // A torn table is recoverable; history retrieval falls
                    // back to the vector index.
                    warn!("[sessions] could not parse {}: {} — starting empty", path.display(), e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        info!("[sessions] opened store with {} session(s)", sessions.len());
        Ok(SessionStore {
            volume,
            sessions: Mutex::new(sessions),
            turn_locks: Mutex::new(HashMap::new()),
            window: SESSION_WINDOW_MESSAGES,
        })
    }

    /// The FIFO lock for a session. Hold it for the whole turn.
    pub fn turn_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.turn_locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Create the session if it doesn't exist; bump its turn counter either
    /// way. Returns the new turn number.
    pub fn begin_turn(&self, session_id: &str) -> EngineResult<u64> {
        let turn = {
            let mut sessions = self.sessions.lock();
            let now = Utc::now();
            let rec = sessions.entry(session_id.to_string()).or_insert_with(|| SessionRecord {
                id: session_id.to_string(),
                created_at: now,
                last_active: now,
                turn_count: 0,
                messages: Vec::new(),
            });
            rec.turn_count += 1;
            rec.last_active = now;
            rec.turn_count
        };
        self.persist()?;
        Ok(turn)
    }

    /// Append a message. Think tags are stripped before persistence and
    /// empty results are skipped entirely.
    pub fn append_message(&self, session_id: &str, role: &str, content: &str) -> EngineResult<()> {
        let clean = strip_think_tags(content);
        let clean = clean.trim();
        if clean.is_empty() {
            return Ok(());
        }
        {
            let mut sessions = self.sessions.lock();
            let now = Utc::now();
            let rec = sessions.entry(session_id.to_string()).or_insert_with(|| SessionRecord {
                id: session_id.to_string(),
                created_at: now,
                last_active: now,
                turn_count: 0,
                messages: Vec::new(),
            });
            rec.messages.push(StoredMessage {
                role: role.to_string(),
                content: clean.to_string(),
                timestamp: now,
            });
            rec.last_active = now;
            // Sliding window: drop from the front, never reorder.
            if rec.messages.len() > self.window {
                let excess = rec.messages.len() - self.window;
                rec.messages.drain(0..excess);
            }
        }
        self.persist()
    }

    /// The most recent `limit` messages, oldest first.
    pub fn history(&self, session_id: &str, limit: usize) -> Vec<StoredMessage> {
        let sessions = self.sessions.lock();
        match sessions.get(session_id) {
            Some(rec) => {
                let start = rec.messages.len().saturating_sub(limit);
                rec.messages[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Current turn number without bumping (0 for unknown sessions).
    pub fn turn_count(&self, session_id: &str) -> u64 {
        self.sessions.lock().get(session_id).map(|r| r.turn_count).unwrap_or(0)
    }

    /// The previous user prompt, for the probe's duplicate-turn skip rule.
    pub fn previous_user_prompt(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.lock();
        let rec = sessions.get(session_id)?;
        rec.messages.iter().rev().find(|m| m.role == "user").map(|m| m.content.clone())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn volume(&self) -> &SharedVolume {
        &self.volume
    }

    fn persist(&self) -> EngineResult<()> {
        let sessions = self.sessions.lock();
        let path = self.volume.sessions_file();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&*sessions)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
