// ── Keystone Atoms: Cognition Packet ───────────────────────────────────────
// The canonical request/response envelope between gateway and engine.
// A packet is created once per turn, mutated only by the engine pipeline,
// and consumed by the gateway's output router on return.
//
// Back-references between groups (a reflection entry citing a sketchpad
// slot, a data field citing a probe hit) are lookups by key, never pointers,
// so the structure stays an acyclic serde tree.

use crate::atoms::constants::DEFAULT_MAX_REINJECTIONS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Header ─────────────────────────────────────────────────────────────────

/// Where the packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketOrigin {
    User,
    System,
    Autonomous,
}

/// Primary destination plus optional fan-out list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRouting {
    pub primary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fan_out: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Globally unique, set on creation, never mutated.
    pub packet_id: String,
    pub session_id: String,
    /// Role tag adopted for this turn ("archivist", "navigator", …).
    #[serde(default)]
    pub persona: String,
    pub origin: PacketOrigin,
    pub output_routing: OutputRouting,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

// ── Content ────────────────────────────────────────────────────────────────

/// Type tag for a data field. Readers must tolerate tags they don't know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFieldKind {
    Text,
    ProbeResult,
    RetrievedDocument,
    ToolResult,
    CouncilNote,
    Checkpoint,
    SystemHint,
    WorldState,
    #[serde(other)]
    Unknown,
}

/// One entry in the extensible slot list for RAG hits, probe results, tool
/// results, and system hints. Insertion order is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataField {
    pub key: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: DataFieldKind,
    /// Which pipeline step or service produced this entry.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketContent {
    /// Immutable after creation.
    pub original_prompt: String,
    #[serde(default)]
    pub data_fields: Vec<DataField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_history_reference: Option<String>,
}

// ── Intent ─────────────────────────────────────────────────────────────────

/// Closed intent set. `Other` is the explicit bucket, not a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedIntent {
    Chat,
    Recite,
    FileRead,
    FileWrite,
    Shell,
    Search,
    KnowledgeSave,
    KnowledgeUpdate,
    Introspect,
    Reflection,
    Other,
}

impl DetectedIntent {
    /// Whether this intent can mutate anything outside the conversation.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            DetectedIntent::FileWrite
                | DetectedIntent::Shell
                | DetectedIntent::KnowledgeSave
                | DetectedIntent::KnowledgeUpdate
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentBlock {
    #[serde(default)]
    pub primary_goal: String,
    pub detected_intent: DetectedIntent,
    pub read_only: bool,
}

// ── Context ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBlock {
    /// Filtered tool catalog the selector is allowed to pick from.
    #[serde(default)]
    pub available_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_state_snapshot: Option<Value>,
}

// ── Reasoning ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub step: String,
    pub summary: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningBlock {
    /// Append-only; entries may cite sketchpad slots by name.
    #[serde(default)]
    pub reflection_log: Vec<ReflectionEntry>,
    /// Named slots of intermediate text.
    #[serde(default)]
    pub sketchpad: BTreeMap<String, String>,
}

// ── Tool routing ───────────────────────────────────────────────────────────

/// Tool-execution state machine. Driven only by the engine's tool-routing
/// loop; `Executed` is sticky for the rest of the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    AwaitingConfidence,
    Approved,
    Executed,
    Failed,
    Skipped,
    UserDenied,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Executed
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::UserDenied
        )
    }

    /// Legal transitions for the success path plus terminal alternates.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, AwaitingConfidence) | (Pending, Skipped) => true,
            (AwaitingConfidence, Approved)
            | (AwaitingConfidence, Skipped)
            | (AwaitingConfidence, UserDenied) => true,
            (Approved, Executed) | (Approved, Failed) | (Approved, UserDenied) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedTool {
    pub name: String,
    pub params: Value,
    pub selection_reasoning: String,
    pub selection_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRouting {
    pub needs_tool: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_tool: Option<SelectedTool>,
    #[serde(default)]
    pub alternative_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reasoning: Option<String>,
    pub execution_status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    pub reinjection_count: u32,
    pub max_reinjections: u32,
}

impl Default for ToolRouting {
    fn default() -> Self {
        ToolRouting {
            needs_tool: false,
            selected_tool: None,
            alternative_tools: Vec::new(),
            review_confidence: None,
            review_reasoning: None,
            execution_status: ExecutionStatus::Pending,
            execution_result: None,
            reinjection_count: 0,
            max_reinjections: DEFAULT_MAX_REINJECTIONS,
        }
    }
}

impl ToolRouting {
    /// Count one reinjection. Exceeding the cap forces SKIPPED and reports
    /// false so the routing loop stops re-entering the selector.
    pub fn record_reinjection(&mut self) -> bool {
        if self.reinjection_count >= self.max_reinjections {
            self.execution_status = ExecutionStatus::Skipped;
            return false;
        }
        self.reinjection_count += 1;
        true
    }
}

// ── Response ───────────────────────────────────────────────────────────────

/// A parsed post-generation `EXECUTE:` directive awaiting the safety gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarAction {
    pub tool: String,
    pub params: Value,
    /// The directive line as emitted, for audit logs.
    pub raw: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseBlock {
    /// Final user-visible text. Empty ⇒ the engine must not emit the packet
    /// downstream; the pipeline substitutes a decline or error message.
    #[serde(default)]
    pub candidate: String,
    #[serde(default)]
    pub sidecar_actions: Vec<SidecarAction>,
}

// ── Metrics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeMetrics {
    pub phrases_extracted: usize,
    pub cache_hits: usize,
    pub lookup_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub probe: ProbeMetrics,
    /// Per-step wall-clock timings in milliseconds, keyed by step name.
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u64>,
}

// ── Loop state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    pub reset_count: u32,
    #[serde(default)]
    pub previous_attempts: Vec<String>,
}

// ── The packet ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitionPacket {
    pub header: PacketHeader,
    pub content: PacketContent,
    pub intent: IntentBlock,
    #[serde(default)]
    pub context: ContextBlock,
    #[serde(default)]
    pub reasoning: ReasoningBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_routing: Option<ToolRouting>,
    #[serde(default)]
    pub response: ResponseBlock,
    #[serde(default)]
    pub metrics: PacketMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
}

impl CognitionPacket {
    /// Create a fresh packet for a user turn. The packet_id is minted here
    /// and never changes.
    pub fn new(session_id: &str, prompt: &str, origin: PacketOrigin, destination: &str) -> Self {
        CognitionPacket {
            header: PacketHeader {
                packet_id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                persona: String::new(),
                origin,
                output_routing: OutputRouting {
                    primary: destination.to_string(),
                    fan_out: Vec::new(),
                },
                version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: Utc::now(),
            },
            content: PacketContent {
                original_prompt: prompt.to_string(),
                data_fields: Vec::new(),
                chat_history_reference: None,
            },
            intent: IntentBlock {
                primary_goal: String::new(),
                detected_intent: DetectedIntent::Chat,
                read_only: true,
            },
            context: ContextBlock::default(),
            reasoning: ReasoningBlock::default(),
            tool_routing: None,
            response: ResponseBlock::default(),
            metrics: PacketMetrics::default(),
            loop_state: None,
        }
    }

    /// Append a data field, preserving insertion order.
    pub fn push_data_field(&mut self, key: &str, kind: DataFieldKind, value: Value, source: &str) {
        self.content.data_fields.push(DataField {
            key: key.to_string(),
            value,
            kind,
            source: source.to_string(),
        });
    }

    /// Look up a data field by key (first match wins).
    pub fn data_field(&self, key: &str) -> Option<&DataField> {
        self.content.data_fields.iter().find(|f| f.key == key)
    }

    /// Append a reflection entry.
    pub fn reflect(&mut self, step: &str, summary: &str, confidence: f64) {
        self.reasoning.reflection_log.push(ReflectionEntry {
            step: step.to_string(),
            summary: summary.to_string(),
            confidence,
        });
    }

    /// Lazily create the tool_routing block.
    pub fn tool_routing_mut(&mut self) -> &mut ToolRouting {
        self.tool_routing.get_or_insert_with(ToolRouting::default)
    }

    /// True once a tool has executed this turn (the sticky state that makes
    /// duplicate EXECUTE directives drop).
    pub fn tool_executed(&self) -> bool {
        self.tool_routing
            .as_ref()
            .map(|tr| tr.execution_status == ExecutionStatus::Executed)
            .unwrap_or(false)
    }

    /// The already-executed tool's (name, params), if any.
    pub fn executed_tool(&self) -> Option<(&str, &Value)> {
        let tr = self.tool_routing.as_ref()?;
        if tr.execution_status != ExecutionStatus::Executed {
            return None;
        }
        let sel = tr.selected_tool.as_ref()?;
        Some((sel.name.as_str(), &sel.params))
    }
}
