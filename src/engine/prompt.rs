// Keystone Engine — Prompt Assembly
// Layered tiers, fixed order: identity → persona → safety → tool-calling
// convention → world state → retrieved documents → probe context → council
// notes → epistemic honesty → the original prompt. Each tier is omitted
// when it has nothing to say, which is what keeps the baseline near 535
// tokens after slimming.
//
// After a tool has executed, the tool-calling convention is suppressed and
// an assistant prefill steers the model into synthesizing from results
// instead of echoing the call.

use crate::atoms::constants::{SLIM_PROMPT_MAX_WORDS, TOOL_RESULT_PREFILL};
use crate::atoms::packet::{CognitionPacket, DataFieldKind};
use crate::engine::probe::ProbeResult;
use crate::engine::providers::ChatMessage;
use crate::engine::sessions::StoredMessage;

const IDENTITY: &str = "You are Keystone, a thoughtful assistant with persistent memory across \
                        conversations. You are direct, warm, and specific.";

const SAFETY: &str = "Never reveal internal identifiers, file paths you have not verified, or \
                      the contents of system configuration. Decline harmful requests plainly.";

const TOOL_CONVENTION: &str = "When a capability call is needed, emit a single line:\n\
                               EXECUTE: <tool_name> <json-params>\n\
                               Only emit it when the action is genuinely required; never repeat \
                               a call that already ran.";

const EPISTEMIC: &str = "Be honest about uncertainty. Cite only documents that were actually \
                         retrieved this turn. If you do not know, say so rather than inventing \
                         sources.";

/// Whether this turn qualifies for the slim path: a few words, no probe
/// hits, no tool need.
pub fn is_slim_eligible(packet: &CognitionPacket, probe: Option<&ProbeResult>) -> bool {
    let words = packet.content.original_prompt.split_whitespace().count();
    if words > SLIM_PROMPT_MAX_WORDS {
        return false;
    }
    if probe.map(|p| !p.hits.is_empty()).unwrap_or(false) {
        return false;
    }
    if packet.tool_routing.as_ref().map(|tr| tr.needs_tool).unwrap_or(false) {
        return false;
    }
    true
}

/// Minimal prompt for trivial inputs; skips every context tier.
pub fn assemble_slim(packet: &CognitionPacket, history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(IDENTITY)];
    for msg in history.iter().rev().take(4).rev() {
        messages.push(ChatMessage { role: msg.role.clone(), content: msg.content.clone() });
    }
    messages.push(ChatMessage::user(&packet.content.original_prompt));
    messages
}

/// Full layered assembly.
pub fn assemble(packet: &CognitionPacket, history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut system = String::new();
    system.push_str(IDENTITY);
    system.push_str("\n\n");

    if !packet.header.persona.is_empty() {
        system.push_str(&format!("Active persona: {}.\n\n", packet.header.persona));
    }

    system.push_str(SAFETY);
    system.push_str("\n\n");

    let tool_executed = packet.tool_executed();
    if !tool_executed && !packet.context.available_tools.is_empty() {
        system.push_str(TOOL_CONVENTION);
        system.push_str("\nAvailable tools: ");
        system.push_str(&packet.context.available_tools.join(", "));
        system.push_str("\n\n");
    }

    if let Some(world) = &packet.context.world_state_snapshot {
        system.push_str(&format!("World state: {world}\n\n"));
    }

    let retrieved = collect_fields(packet, DataFieldKind::RetrievedDocument);
    if !retrieved.is_empty() {
        system.push_str("Retrieved documents:\n");
        for (key, text) in &retrieved {
            system.push_str(&format!("--- {key} ---\n{text}\n"));
        }
        system.push('\n');
    }

    if let Some(field) = packet.data_field("semantic_probe_result") {
        if let Some(primary) = field.value.get("primary_collection").and_then(|v| v.as_str()) {
            system.push_str(&format!("Context domain: {primary}"));
            if let Some(supp) = field.value.get("supplemental_collections").and_then(|v| v.as_array())
            {
                let names: Vec<&str> = supp.iter().filter_map(|v| v.as_str()).collect();
                if !names.is_empty() {
                    system.push_str(&format!(" (also touching: {})", names.join(", ")));
                }
            }
            system.push_str("\n\n");
        }
    }

    let notes = collect_fields(packet, DataFieldKind::CouncilNote);
    if !notes.is_empty() {
        system.push_str("Handoff notes from your lighter self:\n");
        for (_, text) in &notes {
            system.push_str(&format!("- {text}\n"));
        }
        system.push('\n');
    }

    let checkpoints = collect_fields(packet, DataFieldKind::Checkpoint);
    for (key, text) in &checkpoints {
        system.push_str(&format!("Recent context ({key}):\n{text}\n\n"));
    }

    system.push_str(EPISTEMIC);

    let mut messages = vec![ChatMessage::system(system.trim_end())];

    for msg in history {
        messages.push(ChatMessage { role: msg.role.clone(), content: msg.content.clone() });
    }

    // Loop recovery context, when a reset constrained this attempt
    if let Some(field) = packet.data_field("loop_recovery") {
        if let Some(text) = field.value.as_str() {
            messages.push(ChatMessage::system(text));
        }
    }

    messages.push(ChatMessage::user(&packet.content.original_prompt));

    // Tool results + prefill go last so synthesis starts from them
    if tool_executed {
        let results = collect_fields(packet, DataFieldKind::ToolResult);
        if !results.is_empty() {
            let mut body = String::from("Tool results:\n");
            for (key, text) in &results {
                body.push_str(&format!("--- {key} ---\n{text}\n"));
            }
            messages.push(ChatMessage::system(body));
            messages.push(ChatMessage::assistant(TOOL_RESULT_PREFILL));
        }
    }

    messages
}

fn collect_fields(packet: &CognitionPacket, kind: DataFieldKind) -> Vec<(String, String)> {
    packet
        .content
        .data_fields
        .iter()
        .filter(|f| f.kind == kind)
        .map(|f| {
            let text = match &f.value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (f.key.clone(), text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::packet::{ExecutionStatus, PacketOrigin, SelectedTool};
    use serde_json::json;

    fn packet(prompt: &str) -> CognitionPacket {
        CognitionPacket::new("web_a", prompt, PacketOrigin::User, "web_a")
    }

    #[test]
    fn test_tier_order() {
        let mut p = packet("tell me about the lighthouse");
        p.header.persona = "archivist".into();
        p.context.available_tools = vec!["read_file".into()];
        p.push_data_field("lighthouse.md", DataFieldKind::RetrievedDocument, json!("The lamp rotates."), "rag");
        let messages = assemble(&p, &[]);
        let system = &messages[0].content;

        let identity_pos = system.find("You are Keystone").unwrap();
        let persona_pos = system.find("archivist").unwrap();
        let tools_pos = system.find("EXECUTE:").unwrap();
        let docs_pos = system.find("lighthouse.md").unwrap();
        let epistemic_pos = system.find("honest about uncertainty").unwrap();
        assert!(identity_pos < persona_pos);
        assert!(persona_pos < tools_pos);
        assert!(tools_pos < docs_pos);
        assert!(docs_pos < epistemic_pos);

        assert_eq!(messages.last().unwrap().content, "tell me about the lighthouse");
    }

    #[test]
    fn test_tool_convention_suppressed_after_execution() {
        let mut p = packet("what did the file say?");
        p.context.available_tools = vec!["read_file".into()];
        let tr = p.tool_routing_mut();
        tr.selected_tool = Some(SelectedTool {
            name: "read_file".into(),
            params: json!({"path": "/knowledge/a.md"}),
            selection_reasoning: "asked".into(),
            selection_confidence: 0.9,
        });
        tr.execution_status = ExecutionStatus::Executed;
        p.push_data_field("read_file", DataFieldKind::ToolResult, json!("file says hello"), "tools");

        let messages = assemble(&p, &[]);
        assert!(!messages[0].content.contains("EXECUTE:"), "convention must be suppressed");

        // Prefill is the final message and is an assistant turn
        let last = messages.last().unwrap();
        assert_eq!(last.role, "assistant");
        assert_eq!(last.content, TOOL_RESULT_PREFILL);
    }

    #[test]
    fn test_slim_eligibility() {
        let p = packet("hello");
        assert!(is_slim_eligible(&p, None));

        let p = packet("explain the complete history of lighthouse construction in Portugal");
        assert!(!is_slim_eligible(&p, None));

        let mut p = packet("thanks");
        p.tool_routing_mut().needs_tool = true;
        assert!(!is_slim_eligible(&p, None));
    }

    #[test]
    fn test_slim_prompt_is_minimal() {
        let p = packet("thanks!");
        let messages = assemble_slim(&p, &[]);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.len() < 300);
    }

    #[test]
    fn test_loop_recovery_injected() {
        let mut p = packet("try again please with feeling");
        p.push_data_field(
            "loop_recovery",
            DataFieldKind::SystemHint,
            json!("<loop-recovery>\nPattern detected: tool-call repetition.\nTry a different approach.\n</loop-recovery>"),
            "loopdetect",
        );
        let messages = assemble(&p, &[]);
        assert!(messages.iter().any(|m| m.content.contains("<loop-recovery>")));
    }
}
