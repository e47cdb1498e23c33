// Keystone Engine — Tool Routing
// Pre-generation: Lite proposes a tool as strict JSON, Prime reviews it,
// and a composite-confidence gate decides APPROVED or SKIPPED. Approved
// calls dispatch locally when the engine knows the tool, otherwise relay
// to the tool server as JSON-RPC.
//
// Post-generation: EXECUTE directives are parsed out of the response,
// duplicates of the already-executed tool are dropped, and the tiered
// safety gate routes the rest.

use crate::atoms::constants::{
    TOOL_APPROVAL_THRESHOLD, TOOL_REVIEW_TEMPERATURE, TOOL_SELECTOR_TEMPERATURE,
    TOOL_RPC_TIMEOUT_SECS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::packet::{ExecutionResult, SelectedTool, SidecarAction};
use crate::engine::providers::{ChatMessage, ChatRequest, ModelBackend};
use crate::shared::registry::ToolRegistry;
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

// ── Tool relay ─────────────────────────────────────────────────────────────

/// How the engine reaches tools it doesn't dispatch in-process. The HTTP
/// implementation speaks the tool server's JSON-RPC endpoint; tests inject
/// scripted relays.
#[async_trait]
pub trait ToolRelay: Send + Sync {
    /// Invoke a tool. A Security error means the server answered 403
    /// (sensitive tool, needs approval).
    async fn call(&self, tool: &str, params: &Value) -> EngineResult<Value>;
}

pub struct HttpToolRelay {
    client: reqwest::Client,
    rpc_url: String,
}

impl HttpToolRelay {
    pub fn new(tool_server_url: &str) -> Self {
        HttpToolRelay {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(TOOL_RPC_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            rpc_url: format!("{}/rpc", tool_server_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ToolRelay for HttpToolRelay {
    async fn call(&self, tool: &str, params: &Value) -> EngineResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": tool,
            "params": params,
        });
        let response = self.client.post(&self.rpc_url).json(&body).send().await?;
        if response.status().as_u16() == 403 {
            return Err(EngineError::Security(format!("{tool} requires approval")));
        }
        if !response.status().is_success() {
            return Err(EngineError::tool(tool, format!("HTTP {}", response.status().as_u16())));
        }
        let v: Value = response.json().await?;
        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            return Err(EngineError::tool(tool, err["message"].as_str().unwrap_or("rpc error")));
        }
        Ok(v.get("result").cloned().unwrap_or(Value::Null))
    }
}

// ── Selector JSON parsing ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SelectorDecision {
    pub selected_tool: Option<String>,
    pub params: Value,
    pub reasoning: String,
    pub confidence: f64,
    pub alternatives: Vec<String>,
}

/// Extract the first JSON object from model output. Non-greedy first so
/// trailing prose doesn't poison the parse; greedy as a second chance for
/// nested params.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    static NON_GREEDY: OnceLock<Regex> = OnceLock::new();
    static GREEDY: OnceLock<Regex> = OnceLock::new();
    let ng = NON_GREEDY.get_or_init(|| Regex::new(r"(?s)\{.*?\}").unwrap());
    let g = GREEDY.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap());

    for re in [ng, g] {
        if let Some(m) = re.find(raw) {
            if let Ok(v) = serde_json::from_str::<Value>(m.as_str()) {
                return Some(v);
            }
        }
    }
    None
}

/// Malformed selector output means "no tool selected" — the pipeline
/// continues without routing, never crashes.
pub fn parse_selector_output(raw: &str) -> SelectorDecision {
    let none = SelectorDecision {
        selected_tool: None,
        params: Value::Null,
        reasoning: String::new(),
        confidence: 0.0,
        alternatives: Vec::new(),
    };
    let Some(v) = extract_json_object(raw) else {
        debug!("[tools] selector output had no parseable JSON");
        return none;
    };
    let selected_tool = v["selected_tool"].as_str().filter(|s| !s.is_empty()).map(String::from);
    SelectorDecision {
        selected_tool,
        params: v.get("params").cloned().unwrap_or(Value::Null),
        reasoning: v["reasoning"].as_str().unwrap_or("").to_string(),
        confidence: v["confidence"].as_f64().unwrap_or(0.0),
        alternatives: v["alternatives"]
            .as_array()
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default(),
    }
}

// ── Selection & review ─────────────────────────────────────────────────────

/// Ask Lite to pick a tool (or null) for this prompt.
pub async fn select_tool(
    lite: &Arc<dyn ModelBackend>,
    prompt: &str,
    catalog: &[String],
    registry: &ToolRegistry,
) -> EngineResult<SelectorDecision> {
    let mut tool_help = String::new();
    for name in catalog {
        if let Some(spec) = registry.get(name) {
            tool_help.push_str(&format!("- {}: {}\n", spec.name, spec.description));
        }
    }
    let req = ChatRequest {
        messages: vec![
            ChatMessage::system(format!(
                "You route user requests to capability tools. Available tools:\n{tool_help}\n\
                 Respond with ONLY a JSON object:\n\
                 {{\"selected_tool\": <name or null>, \"params\": {{...}}, \
                 \"reasoning\": \"...\", \"confidence\": 0.0-1.0, \"alternatives\": []}}\n\
                 Use null when no tool is needed."
            )),
            ChatMessage::user(prompt),
        ],
        temperature: Some(TOOL_SELECTOR_TEMPERATURE),
        top_p: None,
        max_tokens: Some(400),
    };
    let raw = lite.chat(req).await?;
    Ok(parse_selector_output(&raw))
}

#[derive(Debug, Clone)]
pub struct ToolReview {
    pub approved: bool,
    pub confidence: f64,
    pub reasoning: String,
}

/// Prime's second opinion on a proposed call.
pub async fn review_tool(
    prime: &Arc<dyn ModelBackend>,
    prompt: &str,
    selection: &SelectorDecision,
) -> EngineResult<ToolReview> {
    let tool = selection.selected_tool.as_deref().unwrap_or("none");
    let req = ChatRequest {
        messages: vec![
            ChatMessage::system(
                "Review this proposed tool call for necessity and safety. Respond with ONLY \
                 a JSON object: {\"approved\": true|false, \"confidence\": 0.0-1.0, \
                 \"reasoning\": \"...\"}",
            ),
            ChatMessage::user(format!(
                "User request: {prompt}\nProposed call: {tool} {}\nSelector reasoning: {}",
                selection.params, selection.reasoning
            )),
        ],
        temperature: Some(TOOL_REVIEW_TEMPERATURE),
        top_p: None,
        max_tokens: Some(200),
    };
    let raw = prime.chat(req).await?;
    let Some(v) = extract_json_object(&raw) else {
        // Unreviewable proposal is an unapproved proposal
        return Ok(ToolReview { approved: false, confidence: 0.0, reasoning: "unparseable review".into() });
    };
    Ok(ToolReview {
        approved: v["approved"].as_bool().unwrap_or(false),
        confidence: v["confidence"].as_f64().unwrap_or(0.0),
        reasoning: v["reasoning"].as_str().unwrap_or("").to_string(),
    })
}

/// The approval gate: reviewer assent plus composite confidence.
pub fn gate_approves(selection_confidence: f64, review: &ToolReview) -> bool {
    if !review.approved {
        return false;
    }
    let composite = (selection_confidence + review.confidence) / 2.0;
    composite >= TOOL_APPROVAL_THRESHOLD
}

// ── Execution ──────────────────────────────────────────────────────────────

/// Outcome of dispatching an approved call.
#[derive(Debug)]
pub enum DispatchOutcome {
    Done(ExecutionResult),
    /// Tool server said 403; the action went to the approval queue.
    PendingApproval { ack: String },
}

pub async fn dispatch(
    relay: &dyn ToolRelay,
    selected: &SelectedTool,
) -> DispatchOutcome {
    let started = Instant::now();
    match relay.call(&selected.name, &selected.params).await {
        Ok(result) => {
            let output = match &result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            info!("[tools] {} executed in {}ms", selected.name, started.elapsed().as_millis());
            DispatchOutcome::Done(ExecutionResult {
                success: true,
                output,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        Err(EngineError::Security(_)) => {
            info!("[tools] {} is sensitive — queued for approval", selected.name);
            DispatchOutcome::PendingApproval {
                ack: format!(
                    "I've queued the {} action for approval; it will run once it's cleared.",
                    selected.name
                ),
            }
        }
        Err(e) => {
            warn!("[tools] {} failed: {}", selected.name, e);
            DispatchOutcome::Done(ExecutionResult {
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
    }
}

// ── EXECUTE directive parsing (post-generation) ────────────────────────────

fn execute_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*EXECUTE:\s*([A-Za-z_][\w]*)\s*(.*)$").unwrap())
}

/// Parse EXECUTE directives from generated text. JSON args become
/// structured params; bare args become a command string. Returns the
/// response text with directive lines removed, plus the parsed actions.
pub fn parse_execute_directives(text: &str) -> (String, Vec<SidecarAction>) {
    let mut actions = Vec::new();
    for cap in execute_line_re().captures_iter(text) {
        let tool = cap[1].to_string();
        let rest = cap[2].trim();
        let params = if rest.starts_with('{') {
            extract_json_object(rest).unwrap_or_else(|| json!({ "command": rest }))
        } else if rest.is_empty() {
            json!({})
        } else {
            json!({ "command": rest })
        };
        actions.push(SidecarAction { tool, params, raw: cap[0].trim().to_string() });
    }
    let cleaned = execute_line_re().replace_all(text, "").trim().to_string();
    (cleaned, actions)
}

/// Drop directives duplicating the tool that already ran this turn.
/// EXECUTED is sticky: the same call never re-queues.
pub fn drop_duplicates(
    actions: Vec<SidecarAction>,
    executed: Option<(&str, &Value)>,
) -> Vec<SidecarAction> {
    let Some((name, params)) = executed else { return actions };
    actions
        .into_iter()
        .filter(|a| {
            let dup = a.tool == name && &a.params == params;
            if dup {
                debug!("[tools] dropping duplicate EXECUTE for {}", a.tool);
            }
            !dup
        })
        .collect()
}

// ── Tiered safety gate ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    NeedsApproval,
}

/// Classify sidecar actions. Tier (a): explicit governance allow with a
/// whitelisted id passes. Tier (b): when every action sits in the safe set,
/// all pass. Tier (c): anything else goes to the approval queue.
pub fn gate_sidecar_actions(
    actions: &[SidecarAction],
    registry: &ToolRegistry,
    safe_tools: &[String],
    governance_allow: bool,
    whitelist: &[String],
) -> Vec<(SidecarAction, GateDecision)> {
    let all_safe = actions.iter().all(|a| safe_tools.contains(&a.tool));
    actions
        .iter()
        .map(|a| {
            let decision = if governance_allow && whitelist.contains(&a.tool) {
                GateDecision::Pass
            } else if all_safe && !registry.is_sensitive(&a.tool) {
                GateDecision::Pass
            } else {
                GateDecision::NeedsApproval
            };
            (a.clone(), decision)
        })
        .collect()
}
