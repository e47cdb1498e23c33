// Keystone Engine — Per-Turn Pipeline
// The fixed step sequence a packet traverses: history review, semantic
// probe, persona, intent, sleep gate, tool routing, council selection,
// retrieval, ingestion, prompt assembly, observed generation, loop
// detection, sidecar parsing, safety gating, epistemic cleanup, persist,
// escalation.
//
// Steps enrich the packet and may short-circuit; the driver checks typed
// outcomes rather than unwinding through errors. Probe, history-review,
// retrieval, and ingestion failures are all non-fatal.

use crate::atoms::constants::{
    CATASTROPHIC_FAILURE_MESSAGE, EMPTY_PROMPT_DECLINE, OBSERVER_BLOCK_MESSAGE,
};
use crate::atoms::error::EngineResult;
use crate::atoms::packet::{
    CognitionPacket, DataFieldKind, DetectedIntent, ExecutionStatus, SelectedTool,
};
use crate::engine::council::{assess_complexity, CouncilNote, CouncilTier};
use crate::engine::epistemic::{extract_think_content, postprocess};
use crate::engine::knowledge::{self, IngestionDecision};
use crate::engine::loopdetect::LoopAction;
use crate::engine::observer::{ObserverVerdict, StreamObserver};
use crate::engine::probe::ProbeResult;
use crate::engine::prompt;
use crate::engine::providers::{ChatMessage, ChatRequest, ModelBackend, StreamChunk, TokenUsage};
use crate::engine::sleep::SleepState;
use crate::engine::tool_routing::{
    self, dispatch, gate_approves, gate_sidecar_actions, DispatchOutcome, GateDecision,
};
use crate::engine::vectors::VectorIndex;
use crate::engine::Engine;
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// What generation produced, before epistemic cleanup.
struct GenerationOutcome {
    model_name: String,
    text: String,
    annotations: Vec<String>,
    blocked: bool,
    usage: TokenUsage,
}

impl Engine {
    /// Run the full pipeline for one packet. Turns on the same session are
    /// serialized FIFO; different sessions run concurrently.
    ///
    /// Explicitly boxed (rather than `async fn`) to break the process_packet
    /// ↔ wake future-type cycle: wake() spawns a boxed future that awaits
    /// process_packet, and process_packet's sleep gate spawns a task that
    /// awaits wake(), which the compiler cannot resolve through two mutually
    /// recursive opaque `impl Future` types.
    pub fn process_packet<'a>(
        self: &'a Arc<Self>,
        mut packet: CognitionPacket,
    ) -> futures::future::BoxFuture<'a, EngineResult<CognitionPacket>> {
        Box::pin(async move {
        let prompt_text = packet.content.original_prompt.clone();
        let session_id = packet.header.session_id.clone();

        // Empty prompt: decline with no model call at all
        if prompt_text.trim().is_empty() {
            packet.response.candidate = EMPTY_PROMPT_DECLINE.to_string();
            return Ok(packet);
        }

        // ── Sleep gate ─────────────────────────────────────────────────────
        if self.sleep.state() != SleepState::Awake {
            info!("[engine] {} arrived while {:?} — queueing", packet.header.packet_id, self.sleep.state());
            let ack = "I'm waking up — I'll get to this in just a moment.".to_string();
            self.sleep_queue.lock().push(packet.clone());
            if self.sleep.state() == SleepState::Sleeping {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.wake().await {
                        warn!("[engine] wake failed: {e}");
                    }
                });
            }
            packet.response.candidate = ack;
            packet.push_data_field("sleep_ack", DataFieldKind::SystemHint, json!(true), "sleep_gate");
            return Ok(packet);
        }

        let lock = self.sessions.turn_lock(&session_id);
        let _turn_guard = lock.lock().await;
        let turn = self.sessions.begin_turn(&session_id)?;
        let turn_started = Instant::now();

        // Wake context waiting from the last wake cycle rides along on the
        // first turns that follow it.
        for field in self.wake_fields.lock().drain(..) {
            packet.content.data_fields.push(field);
        }

        // ── Step 1: history review ─────────────────────────────────────────
        let raw_history = self.sessions.history(&session_id, self.cfg.history_review.max_messages);
        let history = self.history.review(&raw_history);

        // ── Step 2: semantic probe ─────────────────────────────────────────
        let probe_result = self.run_probe(&mut packet, &session_id, turn).await;

        // ── Step 3: persona / KB selection ─────────────────────────────────
        if let Some((kb, persona)) =
            knowledge::select_persona(probe_result.as_ref(), &prompt_text, &self.cfg.knowledge_bases)
        {
            packet.header.persona = persona;
            packet.context.knowledge_base_name = Some(kb);
        }

        // ── Step 4: intent detection ───────────────────────────────────────
        let embedder = self.pool.embedder();
        let lite_backend = self.pool.candidates_for_role("lite").into_iter().next().map(|(_, b)| b);
        packet.intent = self
            .intent
            .detect(
                &prompt_text,
                probe_result.as_ref(),
                embedder.as_ref().map(|e| &**e),
                lite_backend.clone(),
            )
            .await;
        packet.context.available_tools = self.registry.catalog_for(packet.intent.read_only);
        packet.reflect(
            "intent",
            &format!("detected {:?}", packet.intent.detected_intent),
            0.7,
        );

        // ── Step 6: pre-generation tool routing ────────────────────────────
        if let Some(ack) = self.route_tools(&mut packet, &prompt_text, &session_id).await {
            // Sensitive tool went to the approval queue; turn ends with the ack
            packet.response.candidate = ack;
            self.persist_turn(&session_id, &prompt_text, &packet.response.candidate);
            return Ok(packet);
        }

        // ── Step 7: council / model selection ──────────────────────────────
        let prime_available =
            self.sleep.state() == SleepState::Awake && !self.pool.snapshot().gpu_released;
        let mut tier = if prime_available { CouncilTier::Prime } else { CouncilTier::Lite };
        let mut role = if prime_available { "prime" } else { "lite" };

        // ── Slim prompt fallback ───────────────────────────────────────────
        if prompt::is_slim_eligible(&packet, probe_result.as_ref()) {
            debug!("[engine] slim path for '{}'", prompt_text);
            let messages = prompt::assemble_slim(&packet, &history);
            let outcome = self.generate(role, messages, vec![], false).await;
            return self.finish_turn(packet, outcome, tier, &session_id, &prompt_text, turn_started);
        }

        // ── Step 8: RAG enrichment ─────────────────────────────────────────
        let kb_name = packet.context.knowledge_base_name.clone();
        let mut retrieved_files: Vec<String> = Vec::new();
        match knowledge::enrich_retrieval(
            probe_result.as_ref(),
            kb_name.as_deref(),
            &prompt_text,
            &*self.relay,
            self.cfg.semantic_probe.top_k_per_phrase,
        )
        .await
        {
            Ok(docs) => {
                for doc in docs {
                    retrieved_files.push(doc.file.clone());
                    packet.push_data_field(
                        &doc.file,
                        DataFieldKind::RetrievedDocument,
                        json!(doc.content),
                        "rag",
                    );
                }
            }
            Err(e) => debug!("[engine] retrieval unavailable: {e}"),
        }

        // Recitation requests with no local source go to the web
        if packet.intent.detected_intent == DetectedIntent::Recite
            && retrieved_files.is_empty()
            && !packet.tool_executed()
        {
            let phrases = probe_result.as_ref().map(|p| p.phrases.clone()).unwrap_or_default();
            match crate::engine::recite::fetch_source(&*self.relay, &prompt_text, &phrases).await {
                Ok(Some(source)) => {
                    retrieved_files.push("recitation_source".to_string());
                    packet.push_data_field(
                        "recitation_source",
                        DataFieldKind::RetrievedDocument,
                        json!(source),
                        "recite",
                    );
                }
                Ok(None) => debug!("[engine] no usable recitation source found"),
                Err(e) => debug!("[engine] recitation lookup unavailable: {e}"),
            }
        }

        // ── Step 9: knowledge ingestion detection ──────────────────────────
        match knowledge::detect_ingestion(&prompt_text, kb_name.as_deref(), &*self.relay).await {
            Ok(IngestionDecision::SaveNow { category }) => {
                match knowledge::save_knowledge(&prompt_text, &category, &*self.relay).await {
                    Ok(path) => packet.push_data_field(
                        "knowledge_saved",
                        DataFieldKind::ToolResult,
                        json!(path),
                        "ingestion",
                    ),
                    Err(e) => warn!("[engine] explicit save failed: {e}"),
                }
            }
            Ok(IngestionDecision::OfferSave { category }) => {
                packet.push_data_field(
                    "offer_knowledge_save",
                    DataFieldKind::SystemHint,
                    json!(format!(
                        "This looks worth remembering (category: {category}). Offer to save it."
                    )),
                    "ingestion",
                );
            }
            Ok(IngestionDecision::None) => {}
            Err(e) => debug!("[engine] ingestion detection unavailable: {e}"),
        }

        // Prime-during-reflection promotion: if Lite was slated but Prime
        // became available before generation, Prime speaks.
        if tier == CouncilTier::Lite {
            let prime_now =
                self.sleep.state() == SleepState::Awake && !self.pool.snapshot().gpu_released;
            if prime_now {
                info!("[engine] promoting responder to Prime before generation");
                tier = CouncilTier::Prime;
                role = "prime";
            }
        }

        // ── Step 10: prompt assembly ───────────────────────────────────────
        let messages = prompt::assemble(&packet, &history);

        // ── Steps 11–12: generation with observer + loop detection ─────────
        let mut outcome = self.generate(role, messages, retrieved_files.clone(), true).await;

        let loop_action = match &outcome {
            Ok(gen) if !gen.blocked => {
                self.loops.record_output(&session_id, &gen.text);
                let verdict = self.loops.evaluate(&session_id);
                verdict.triggered.then(|| self.loops.on_trigger(&session_id, &verdict))
            }
            _ => None,
        };
        match loop_action {
            None => {}
            Some(LoopAction::Warn { note }) => {
                if let Ok(gen) = &mut outcome {
                    gen.annotations.push(note);
                }
            }
            Some(LoopAction::Reset { recovery_context, reset_count, request_user }) => {
                info!("[engine] loop reset #{} for {}", reset_count, session_id);
                packet.loop_state.get_or_insert_with(Default::default).reset_count = reset_count;
                if request_user {
                    outcome = Ok(GenerationOutcome {
                        model_name: "loop-guard".into(),
                        text: "I keep circling on this one. Could you steer me — what should \
                               I try differently?"
                            .into(),
                        annotations: vec![],
                        blocked: false,
                        usage: TokenUsage::default(),
                    });
                } else {
                    packet.push_data_field(
                        "loop_recovery",
                        DataFieldKind::SystemHint,
                        json!(recovery_context),
                        "loopdetect",
                    );
                    let retry_messages = prompt::assemble(&packet, &history);
                    outcome =
                        self.generate(role, retry_messages, retrieved_files.clone(), true).await;
                }
            }
        }

        self.finish_turn(packet, outcome, tier, &session_id, &prompt_text, turn_started)
        })
    }

    // ── Probe wrapper (non-fatal) ──────────────────────────────────────────

    async fn run_probe(
        &self,
        packet: &mut CognitionPacket,
        session_id: &str,
        turn: u64,
    ) -> Option<ProbeResult> {
        let embedder = self.pool.embedder()?;
        let previous = self.sessions.previous_user_prompt(session_id);

        // Snapshot collections so no lock is held across the embed calls
        let kb_snapshot: Vec<(String, Arc<VectorIndex>)> = self
            .knowledge_indices
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let session_idx = self.session_index(session_id).ok()?;
        let mut collections: Vec<(String, &VectorIndex)> =
            kb_snapshot.iter().map(|(k, v)| (k.clone(), v.as_ref())).collect();
        let session_key = format!("session:{session_id}");
        if !session_idx.is_empty() {
            collections.push((session_key, &session_idx));
        }

        let result = self
            .probe
            .probe(
                session_id,
                turn,
                &packet.content.original_prompt,
                previous.as_deref(),
                &*embedder,
                &collections,
            )
            .await;

        match result {
            Ok(Some(probe)) => {
                packet.metrics.probe.phrases_extracted = probe.phrases.len();
                packet.metrics.probe.cache_hits = probe.cache_hits;
                packet.metrics.probe.lookup_ms = probe.lookup_ms;
                packet.push_data_field(
                    "semantic_probe_result",
                    DataFieldKind::ProbeResult,
                    json!({
                        "primary_collection": probe.primary_collection,
                        "supplemental_collections": probe.supplemental_collections,
                        "hit_count": probe.hits.len(),
                    }),
                    "probe",
                );
                packet.reflect(
                    "semantic_probe",
                    &format!(
                        "{} phrase(s), {} hit(s), primary={:?}",
                        probe.phrases.len(),
                        probe.hits.len(),
                        probe.primary_collection
                    ),
                    0.8,
                );
                Some(probe)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[engine] probe failed (non-fatal): {e}");
                None
            }
        }
    }

    // ── Step 6 implementation ──────────────────────────────────────────────

    /// Returns Some(ack) when the turn short-circuits into the approval
    /// queue.
    async fn route_tools(
        &self,
        packet: &mut CognitionPacket,
        prompt_text: &str,
        session_id: &str,
    ) -> Option<String> {
        let needs = tool_indicated(packet.intent.detected_intent, prompt_text);
        if !needs {
            return None;
        }
        let tr = packet.tool_routing_mut();
        tr.needs_tool = true;

        let lite = self.pool.candidates_for_role("lite").into_iter().next().map(|(_, b)| b)?;
        let catalog = packet.context.available_tools.clone();
        let decision =
            match tool_routing::select_tool(&lite, prompt_text, &catalog, &self.registry).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("[engine] tool selector failed: {e}");
                    return None;
                }
            };
        let Some(tool_name) = decision.selected_tool.clone() else {
            debug!("[engine] selector chose no tool");
            return None;
        };
        if self.registry.get(&tool_name).is_none() {
            warn!("[engine] selector proposed unknown tool '{tool_name}'");
            return None;
        }

        let tr = packet.tool_routing_mut();
        tr.selected_tool = Some(SelectedTool {
            name: tool_name.clone(),
            params: decision.params.clone(),
            selection_reasoning: decision.reasoning.clone(),
            selection_confidence: decision.confidence,
        });
        tr.alternative_tools = decision.alternatives.clone();
        tr.execution_status = ExecutionStatus::AwaitingConfidence;

        // Prime reviews the proposal
        let reviewer = self
            .pool
            .candidates_for_role("prime")
            .into_iter()
            .next()
            .map(|(_, b)| b)
            .or_else(|| Some(lite.clone()))?;
        let review = match tool_routing::review_tool(&reviewer, prompt_text, &decision).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[engine] tool review failed: {e}");
                let tr = packet.tool_routing_mut();
                tr.execution_status = ExecutionStatus::Skipped;
                return None;
            }
        };
        let tr = packet.tool_routing_mut();
        tr.review_confidence = Some(review.confidence);
        tr.review_reasoning = Some(review.reasoning.clone());

        if !gate_approves(decision.confidence, &review) {
            info!("[engine] tool '{}' gated out (composite confidence too low)", tool_name);
            tr.execution_status = ExecutionStatus::Skipped;
            self.loops.record_exec_state(session_id, "SKIPPED");
            return None;
        }
        tr.execution_status = ExecutionStatus::Approved;
        self.loops.record_exec_state(session_id, "APPROVED");

        let selected = tr.selected_tool.clone().expect("set above");
        match dispatch(&*self.relay, &selected).await {
            DispatchOutcome::Done(result) => {
                let tr = packet.tool_routing_mut();
                let success = result.success;
                let output = result.output.clone();
                let error = result.error.clone();
                tr.execution_result = Some(result);
                if success {
                    tr.execution_status = ExecutionStatus::Executed;
                    if tr.record_reinjection() {
                        packet.push_data_field(
                            &selected.name,
                            DataFieldKind::ToolResult,
                            json!(output),
                            "tool_routing",
                        );
                    }
                    self.loops.record_exec_state(session_id, "EXECUTED");
                } else {
                    tr.execution_status = ExecutionStatus::Failed;
                    self.loops.record_exec_state(session_id, "FAILED");
                    if let Some(err) = &error {
                        self.loops.record_error(session_id, err);
                    }
                }
                self.loops.record_tool_call(
                    session_id,
                    &selected.name,
                    &selected.params.to_string(),
                    &output,
                );
                None
            }
            DispatchOutcome::PendingApproval { ack } => Some(ack),
        }
    }

    // ── Generation ─────────────────────────────────────────────────────────

    /// Walk the role's fallback chain until one backend completes a stream.
    /// The observer rides along when `observed` is true; BLOCK ends the
    /// turn without further fallback.
    async fn generate(
        &self,
        role: &str,
        messages: Vec<ChatMessage>,
        retrieved_files: Vec<String>,
        observed: bool,
    ) -> EngineResult<GenerationOutcome> {
        let review_model = if observed && self.cfg.cognitive_audit.llm_review {
            self.pool.candidates_for_role("lite").into_iter().next().map(|(_, b)| b)
        } else {
            None
        };

        let candidates = self.pool.candidates_for_role(role);
        if candidates.is_empty() {
            return Ok(GenerationOutcome {
                model_name: "none".into(),
                text: String::new(),
                annotations: vec![],
                blocked: false,
                usage: TokenUsage::default(),
            });
        }

        for (name, backend) in candidates {
            let mut observer = StreamObserver::new(
                self.cfg.cognitive_audit.clone(),
                retrieved_files.clone(),
                review_model.clone(),
            );
            match self
                .stream_one(&name, backend.clone(), messages.clone(), &mut observer, observed)
                .await
            {
                Ok((text, usage, blocked, annotations)) => {
                    self.pool.release(&name);
                    self.pool.record_usage(&name, &usage);
                    return Ok(GenerationOutcome { model_name: name, text, annotations, blocked, usage });
                }
                Err(e) => {
                    self.pool.release(&name);
                    warn!("[engine] '{}' failed, trying next in chain: {}", name, e);
                }
            }
        }
        Ok(GenerationOutcome {
            model_name: "exhausted".into(),
            text: String::new(),
            annotations: vec![],
            blocked: false,
            usage: TokenUsage::default(),
        })
    }

    async fn stream_one(
        &self,
        name: &str,
        backend: Arc<dyn ModelBackend>,
        messages: Vec<ChatMessage>,
        observer: &mut StreamObserver,
        observed: bool,
    ) -> EngineResult<(String, TokenUsage, bool, Vec<String>)> {
        let (tx, mut rx) = mpsc::channel::<StreamChunk>(64);
        let req = ChatRequest::new(messages);
        let task = tokio::spawn(async move { backend.chat_stream(req, tx).await });

        let mut text = String::new();
        let mut annotations: Vec<String> = Vec::new();
        let mut blocked = false;

        while let Some(chunk) = rx.recv().await {
            if let Some(delta) = chunk.delta_text {
                text.push_str(&delta);
            }
            if observed {
                match observer.maybe_check(&text).await {
                    ObserverVerdict::Block(reason) => {
                        warn!("[engine] observer BLOCK on '{}': {}", name, reason);
                        blocked = true;
                        break;
                    }
                    ObserverVerdict::Caution(note) => {
                        if !annotations.contains(&note) {
                            annotations.push(note);
                        }
                    }
                    ObserverVerdict::Pass => {}
                }
            }
        }
        drop(rx); // cancels the producer cooperatively when we broke early

        let usage = match task.await {
            Ok(Ok(usage)) => usage,
            Ok(Err(e)) => {
                if blocked {
                    // The break above severed the channel; the backend's
                    // send failure is expected, not a generation error.
                    TokenUsage::default()
                } else {
                    return Err(e);
                }
            }
            Err(e) => return Err(crate::atoms::error::EngineError::Other(format!("stream task: {e}"))),
        };
        Ok((text, usage, blocked, annotations))
    }

    // ── Steps 13–18: finish ────────────────────────────────────────────────

    fn finish_turn(
        self: &Arc<Self>,
        mut packet: CognitionPacket,
        outcome: EngineResult<GenerationOutcome>,
        tier: CouncilTier,
        session_id: &str,
        prompt_text: &str,
        turn_started: Instant,
    ) -> EngineResult<CognitionPacket> {
        let gen = match outcome {
            Ok(gen) => gen,
            Err(e) => {
                warn!("[engine] generation failed outright: {e}");
                GenerationOutcome {
                    model_name: "error".into(),
                    text: String::new(),
                    annotations: vec![],
                    blocked: false,
                    usage: TokenUsage::default(),
                }
            }
        };

        if gen.blocked {
            packet.response.candidate = OBSERVER_BLOCK_MESSAGE.to_string();
            self.persist_turn(session_id, prompt_text, &packet.response.candidate);
            return Ok(packet);
        }

        // ── Step 13: sidecar parsing + duplicate drop ──────────────────────
        let (cleaned, actions) = tool_routing::parse_execute_directives(&gen.text);
        let actions = tool_routing::drop_duplicates(actions, packet.executed_tool());

        // ── Step 14: tiered safety gate ────────────────────────────────────
        let gated = gate_sidecar_actions(
            &actions,
            &self.registry,
            &self.cfg.safe_sidecar_tools,
            false,
            &[],
        );
        let mut approval_acks: Vec<String> = Vec::new();
        for (action, decision) in &gated {
            packet.response.sidecar_actions.push(action.clone());
            match decision {
                GateDecision::Pass => {
                    let relay = self.relay.clone();
                    let action = action.clone();
                    let session = session_id.to_string();
                    let engine = self.clone();
                    tokio::spawn(async move {
                        match relay.call(&action.tool, &action.params).await {
                            Ok(_) => debug!("[engine] sidecar {} completed", action.tool),
                            Err(e) => {
                                warn!("[engine] sidecar {} failed: {}", action.tool, e);
                                engine.loops.record_error(&session, &e.to_string());
                            }
                        }
                    });
                }
                GateDecision::NeedsApproval => {
                    let relay = self.relay.clone();
                    let params = json!({
                        "tool": action.tool,
                        "params": action.params,
                        "session_id": session_id,
                    });
                    tokio::spawn(async move {
                        if let Err(e) = relay.call("approval_submit", &params).await {
                            warn!("[engine] approval submission failed: {e}");
                        }
                    });
                    approval_acks
                        .push(format!("[{} queued for approval]", action.tool));
                }
            }
        }

        // ── Step 15: epistemic post-processing ─────────────────────────────
        let mut text = postprocess(&cleaned, &self.cfg.epistemic_guardrails);
        if text.is_empty() && !gen.text.is_empty() {
            // Stage 2 recovery: surface the reasoning that got trapped in tags
            if let Some(thoughts) = extract_think_content(&gen.text) {
                text = format!("Based on my analysis: {}", thoughts.trim());
            }
        }
        if text.is_empty() && !approval_acks.is_empty() {
            text = "I've set that in motion.".to_string();
        }
        if text.is_empty() {
            text = CATASTROPHIC_FAILURE_MESSAGE.to_string();
        }

        // Observer cautions and loop warnings append in brackets
        for note in gen
            .annotations
            .iter()
            .chain(approval_acks.iter())
        {
            let formatted = if note.starts_with('[') {
                note.clone()
            } else {
                format!("[{note}]")
            };
            text.push_str(&format!("\n\n{formatted}"));
        }

        packet.response.candidate = tier.tag_response(&text);

        // ── Step 16: session persist ───────────────────────────────────────
        self.persist_turn(session_id, prompt_text, &packet.response.candidate);
        self.index_turn(session_id, prompt_text, &text);

        // ── Step 17: post-response escalation ──────────────────────────────
        if tier == CouncilTier::Lite && self.cfg.council.enabled {
            let assessment = assess_complexity(prompt_text, &packet.response.candidate, &self.cfg.council);
            if assessment.escalate {
                let note = CouncilNote {
                    timestamp: Utc::now(),
                    user_prompt: prompt_text.to_string(),
                    lite_quick_take: packet.response.candidate.chars().take(200).collect(),
                    escalation_reason: assessment.reason.clone(),
                    confidence: assessment.confidence,
                };
                if let Err(e) = self.council.write_note(&note) {
                    warn!("[engine] council note failed: {e}");
                } else {
                    packet.reflect("escalation", &assessment.reason, assessment.confidence);
                }
            }
        }

        packet.metrics.prompt_tokens = gen.usage.input_tokens;
        packet.metrics.completion_tokens = gen.usage.output_tokens;
        packet
            .metrics
            .timings_ms
            .insert("turn_total".to_string(), turn_started.elapsed().as_millis() as u64);
        packet.reasoning.sketchpad.insert("responder".to_string(), gen.model_name);

        Ok(packet)
    }

    fn persist_turn(&self, session_id: &str, prompt_text: &str, candidate: &str) {
        if let Err(e) = self.sessions.append_message(session_id, "user", prompt_text) {
            warn!("[engine] persist user message failed: {e}");
        }
        if let Err(e) = self.sessions.append_message(session_id, "assistant", candidate) {
            warn!("[engine] persist assistant message failed: {e}");
        }
    }

    /// Add this turn to the session's vector index so the probe can reach
    /// past the sliding window on later turns. Best-effort, off the hot
    /// path.
    fn index_turn(&self, session_id: &str, prompt_text: &str, response: &str) {
        let Some(embedder) = self.pool.embedder() else { return };
        let path = self.volume.session_vector_file(session_id);
        let turn_text = format!("user: {prompt_text}\nassistant: {response}");
        let session = session_id.to_string();
        tokio::spawn(async move {
            match embedder.embed(&turn_text).await {
                Ok(vector) => {
                    if let Ok(mut index) = VectorIndex::open(&path) {
                        let id = format!("turn_{}", Utc::now().timestamp_micros());
                        let head: String = turn_text.chars().take(500).collect();
                        index.add(&id, vector, json!({"file": id, "content": head}));
                        if let Err(e) = index.save() {
                            debug!("[engine] session index save failed: {e}");
                        }
                    }
                }
                Err(e) => debug!("[engine] session embedding skipped for {session}: {e}"),
            }
        });
    }
}

/// Whether intent or surface features call for the tool selector at all.
fn tool_indicated(intent: DetectedIntent, prompt_text: &str) -> bool {
    matches!(
        intent,
        DetectedIntent::FileRead
            | DetectedIntent::FileWrite
            | DetectedIntent::Shell
            | DetectedIntent::Search
            | DetectedIntent::Recite
            | DetectedIntent::KnowledgeUpdate
            | DetectedIntent::Introspect
    ) || prompt_text.contains("EXECUTE:")
}
