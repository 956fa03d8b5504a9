//! The task loop session: drives one chunk through its phase lifecycle
//! against a tool-calling model. The driver owns all I/O (model calls,
//! tool dispatch, prompt injection, events); every decision is delegated
//! to the pure machine in [`crate::state`].

use crate::chunker;
use crate::governor::{ToolDecision, ToolGovernor};
use crate::prompts::{self, TOOL_SET_TITLE, TOOL_SUBMIT_ITEM, TOOL_UPDATE_PHASE};
use crate::state::{Effect, SessionEvent, SessionState, StallPolicy, step};
use crate::stream_guard::{GuardPolicy, GuardVerdict, GuardViolation, StreamGuard};
use crate::verifier::{CompletenessVerifier, verifier_for};
use redraft_core::{
    AppConfig, CancelToken, ChatMessage, ChatRequest, Chunk, EventEnvelope, EventKind,
    ItemCallback, Phase, Result, SessionError, SourceItem, StreamCallback, StreamChunk,
    TaskFamily, ToolCall, ToolChoice, ToolContext, ToolDefinition, ToolHost,
};
use redraft_llm::LlmClient;
use redraft_observe::Observer;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Counters gathered over one session, for callers and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub turns: u32,
    pub tool_calls: u32,
    pub corrective_prompts: u32,
    pub degeneration_retries: u32,
    pub duration_ms: u64,
}

/// Outcome of one completed session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// The model's last finalizing text.
    pub text: String,
    pub phase: Phase,
    /// Per-item results, last write wins.
    pub extracted: BTreeMap<String, String>,
    pub title: Option<String>,
    /// Digest of the planning phase, for reuse by later chunks of the
    /// same document.
    pub planning_digest: Option<String>,
    pub metrics: SessionMetrics,
}

/// How to run the sessions of a document: the task family plus the
/// caller's domain tools and their governance.
#[derive(Clone)]
pub struct ChunkPolicy {
    pub family: TaskFamily,
    /// Domain tools offered alongside the conventional ones.
    pub extra_tools: Vec<ToolDefinition>,
    /// Per-tool call ceilings.
    pub tool_budgets: Vec<(String, u32)>,
    /// Tools whose successful use counts as progress for stall detection.
    pub productive_tools: Vec<String>,
}

impl ChunkPolicy {
    #[must_use]
    pub fn new(family: TaskFamily) -> Self {
        Self {
            family,
            extra_tools: Vec::new(),
            tool_budgets: Vec::new(),
            productive_tools: Vec::new(),
        }
    }
}

/// One chunk's conversation with the model, from the opening system
/// prompt to `done` (or a terminal [`SessionError`]).
pub struct TaskLoopSession<'a> {
    llm: &'a (dyn LlmClient + Send + Sync),
    tool_host: Arc<dyn ToolHost + Send + Sync>,
    cfg: AppConfig,
    family: TaskFamily,
    chunk: Chunk,
    session_id: Uuid,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolDefinition>,
    governor: ToolGovernor,
    verifier: Box<dyn CompletenessVerifier + Send + Sync>,
    cancel: CancelToken,
    stream_callback: Option<StreamCallback>,
    item_callback: Option<ItemCallback>,
    observer: Option<Arc<Observer>>,
    /// Digest carried in from an earlier chunk of the same document.
    planning_digest_in: Option<String>,
    /// Digest produced by this session's own planning phase.
    planning_digest: Option<String>,
    planning_notes: Vec<String>,
    seq_no: u64,
    tool_call_count: u32,
    corrective_prompts: u32,
    degeneration_retries: u32,
}

/// What the effects of one finalize turn amounted to.
#[derive(Default)]
struct EffectOutcome {
    completed: bool,
}

impl<'a> TaskLoopSession<'a> {
    pub fn new(
        llm: &'a (dyn LlmClient + Send + Sync),
        tool_host: Arc<dyn ToolHost + Send + Sync>,
        cfg: AppConfig,
        family: TaskFamily,
        chunk: Chunk,
    ) -> Self {
        let tools = prompts::conventional_tools();
        let governor = ToolGovernor::new(tools.iter().map(|t| t.function.name.clone()));
        Self {
            llm,
            tool_host,
            cfg,
            family,
            chunk,
            session_id: Uuid::now_v7(),
            messages: Vec::new(),
            tools,
            governor,
            verifier: verifier_for(family),
            cancel: CancelToken::new(),
            stream_callback: None,
            item_callback: None,
            observer: None,
            planning_digest_in: None,
            planning_digest: None,
            planning_notes: Vec::new(),
            seq_no: 0,
            tool_call_count: 0,
            corrective_prompts: 0,
            degeneration_retries: 0,
        }
    }

    /// Offer a domain tool to the model and allow it through governance.
    pub fn add_tool(&mut self, tool: ToolDefinition) {
        self.governor.allow(&tool.function.name);
        self.tools.push(tool);
    }

    pub fn set_tool_budget(&mut self, name: &str, budget: u32) {
        self.governor.set_budget(name, budget);
    }

    pub fn mark_productive(&mut self, name: &str) {
        self.governor.mark_productive(name);
    }

    pub fn set_stream_callback(&mut self, cb: StreamCallback) {
        self.stream_callback = Some(cb);
    }

    pub fn set_item_callback(&mut self, cb: ItemCallback) {
        self.item_callback = Some(cb);
    }

    pub fn set_observer(&mut self, observer: Arc<Observer>) {
        self.observer = Some(observer);
    }

    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub fn set_verifier(&mut self, verifier: Box<dyn CompletenessVerifier + Send + Sync>) {
        self.verifier = verifier;
    }

    /// Seed the system prompt with planning notes from an earlier chunk.
    pub fn set_planning_digest(&mut self, digest: String) {
        self.planning_digest_in = Some(digest);
    }

    /// Run the session to completion. Protocol violations and governance
    /// rejections are recovered in-loop; only the terminal outcomes in
    /// [`SessionError`] surface as errors.
    pub fn run(mut self) -> Result<SessionResult> {
        let started = Instant::now();
        self.messages.push(ChatMessage::System {
            content: prompts::system_prompt(
                self.family,
                &self.chunk,
                self.planning_digest_in.as_deref(),
            ),
        });
        self.messages.push(ChatMessage::User {
            content: "Begin. Plan briefly, then do the work.".to_string(),
        });
        self.record(EventKind::SessionStartedV1 {
            family: self.family,
            chunk_label: self.chunk.label(),
            item_count: self.chunk.item_ids.len(),
        });

        let stall = StallPolicy {
            stall_threshold: self.cfg.orchestrator.stall_threshold,
            max_turns: self.cfg.orchestrator.max_turns,
        };
        let guard_policy = GuardPolicy::from_config(&self.cfg.orchestrator);
        let mut state = SessionState::new(self.family);
        let mut last_text = String::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.fail_cancelled());
            }
            let (next, effects) = step(state, SessionEvent::TurnStarted, &stall);
            state = next;
            for effect in effects {
                if let Effect::LivenessExceeded { limit, phase } = effect {
                    let err = SessionError::TurnLimit { limit, phase };
                    self.record(EventKind::SessionFailedV1 {
                        error: err.to_string(),
                    });
                    return Err(err.into());
                }
            }

            let request = ChatRequest {
                model: self.cfg.llm.model.clone(),
                messages: self.messages.clone(),
                tools: self.tools.clone(),
                tool_choice: ToolChoice::auto(),
                max_tokens: self.cfg.llm.max_tokens,
                temperature: Some(self.cfg.llm.temperature),
            };

            let guard = Arc::new(Mutex::new(StreamGuard::new(
                self.family,
                state.phase,
                &self.chunk.text,
                guard_policy,
            )));
            let turn_cancel = CancelToken::new();
            let response = if self.cfg.llm.stream {
                let cb = self.guarded_callback(guard.clone(), turn_cancel.clone());
                self.llm.complete_chat_streaming(&request, cb, &turn_cancel)
            } else {
                self.llm.complete_chat(&request).inspect(|resp| {
                    if let Ok(mut g) = guard.lock() {
                        let _ = g.observe(&resp.text);
                    }
                })
            };
            if response.is_ok()
                && let Ok(mut g) = guard.lock()
            {
                let _ = g.finish();
            }
            let violation = guard.lock().ok().and_then(|mut g| g.take_violation());

            if self.cancel.is_cancelled() {
                return Err(self.fail_cancelled());
            }
            if let Some(violation) = violation {
                // the partial turn never enters the conversation
                self.handle_violation(violation)?;
                continue;
            }
            let response = match response {
                Ok(resp) => resp,
                Err(err) => {
                    let err = SessionError::Transport(err);
                    self.record(EventKind::SessionFailedV1 {
                        error: err.to_string(),
                    });
                    return Err(err.into());
                }
            };

            if state.phase == Phase::Planning && !response.text.trim().is_empty() {
                self.planning_notes.push(response.text.trim().to_string());
            }

            if response.tool_calls.is_empty() {
                // finalize turn
                last_text = response.text.clone();
                self.messages.push(ChatMessage::Assistant {
                    content: Some(response.text),
                    reasoning_content: (!response.reasoning_content.is_empty())
                        .then_some(response.reasoning_content),
                    tool_calls: Vec::new(),
                });
                let coverage = self.verifier.verify(&self.chunk.item_ids, &state.extracted);
                let (next, effects) =
                    step(state, SessionEvent::TurnFinalized { coverage }, &stall);
                state = next;
                self.record(EventKind::TurnCompletedV1 {
                    turn: state.turns,
                    tool_calls: 0,
                });
                if self.run_effects(effects).completed {
                    break;
                }
                continue;
            }

            let (next, completed) = self.run_tool_turn(state, response, &stall);
            state = next;
            if completed {
                break;
            }
        }

        self.record(EventKind::SessionCompletedV1 {
            turns: state.turns,
            extracted: state.extracted.len(),
        });
        Ok(SessionResult {
            text: last_text,
            phase: state.phase,
            title: state.title,
            extracted: state.extracted,
            planning_digest: self.planning_digest.clone(),
            metrics: SessionMetrics {
                turns: state.turns,
                tool_calls: self.tool_call_count,
                corrective_prompts: self.corrective_prompts,
                degeneration_retries: self.degeneration_retries,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        })
    }

    /// Execute every tool call of one turn. Conventional tools are
    /// handled here and never reach the host; everything else is
    /// dispatched through it. Each call gets exactly one tool message,
    /// rejection reasons included.
    fn run_tool_turn(
        &mut self,
        mut state: SessionState,
        response: redraft_core::LlmResponse,
        stall: &StallPolicy,
    ) -> (SessionState, bool) {
        self.tool_call_count += response.tool_calls.len() as u32;
        self.messages.push(ChatMessage::Assistant {
            content: (!response.text.is_empty()).then(|| response.text.clone()),
            reasoning_content: (!response.reasoning_content.is_empty())
                .then(|| response.reasoning_content.clone()),
            tool_calls: response.tool_calls.clone(),
        });

        let mut productive = false;
        for call in &response.tool_calls {
            match self.governor.authorize(&call.name) {
                ToolDecision::Reject { reason } => {
                    self.record(EventKind::ToolRejectedV1 {
                        name: call.name.clone(),
                        reason: reason.clone(),
                    });
                    self.messages.push(ChatMessage::Tool {
                        tool_call_id: call.id.clone(),
                        content: reason,
                    });
                }
                ToolDecision::Allow => {
                    let args: serde_json::Value =
                        serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null);
                    self.emit_stream(StreamChunk::ToolCallStart {
                        tool_name: call.name.clone(),
                        args_summary: summarize_args(&args),
                    });
                    let call_started = Instant::now();
                    let (content, success) = match call.name.as_str() {
                        TOOL_UPDATE_PHASE => {
                            let (next, content, success) =
                                handle_update_phase(state, &args, stall);
                            state = next;
                            (content, success)
                        }
                        TOOL_SUBMIT_ITEM => {
                            match parse_submit_args(&args, &self.chunk.item_ids) {
                                Ok((id, text)) => {
                                    let (next, effects) = step(
                                        state,
                                        SessionEvent::ItemSubmitted {
                                            id: id.clone(),
                                            content: text,
                                        },
                                        stall,
                                    );
                                    state = next;
                                    self.run_effects(effects);
                                    (format!("result for '{id}' recorded"), true)
                                }
                                Err(reason) => (format!("error: {reason}"), false),
                            }
                        }
                        TOOL_SET_TITLE => match args.get("title").and_then(|v| v.as_str()) {
                            Some(title) if !title.trim().is_empty() => {
                                let (next, _) = step(
                                    state,
                                    SessionEvent::TitleSubmitted(title.trim().to_string()),
                                    stall,
                                );
                                state = next;
                                ("title recorded".to_string(), true)
                            }
                            _ => ("error: 'title' must be a non-empty string".to_string(), false),
                        },
                        _ => {
                            let tool_call = ToolCall {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                args,
                            };
                            let ctx = ToolContext {
                                session_id: self.session_id,
                                phase: state.phase,
                                item_ids: self.chunk.item_ids.clone(),
                            };
                            match self.tool_host.dispatch(&tool_call, &ctx) {
                                Ok(text) => (text, true),
                                Err(err) => (format!("error: {err}"), false),
                            }
                        }
                    };
                    self.record(EventKind::ToolDispatchedV1 {
                        name: call.name.clone(),
                        success,
                    });
                    self.emit_stream(StreamChunk::ToolCallEnd {
                        tool_name: call.name.clone(),
                        duration_ms: call_started.elapsed().as_millis() as u64,
                        success,
                    });
                    if success && self.governor.is_productive(&call.name) {
                        productive = true;
                        if state.phase == Phase::Planning {
                            self.planning_notes.push(format!("{}: {content}", call.name));
                        }
                        let (next, _) = step(state, SessionEvent::ProductiveToolUsed, stall);
                        state = next;
                    }
                    self.messages.push(ChatMessage::Tool {
                        tool_call_id: call.id.clone(),
                        content,
                    });
                }
            }
        }

        let coverage = self.verifier.verify(&self.chunk.item_ids, &state.extracted);
        let (next, effects) = step(
            state,
            SessionEvent::ToolTurnEnded {
                productive,
                coverage,
            },
            stall,
        );
        state = next;
        self.record(EventKind::TurnCompletedV1 {
            turn: state.turns,
            tool_calls: response.tool_calls.len(),
        });
        let completed = self.run_effects(effects).completed;
        (state, completed)
    }

    /// Execute a batch of effects from the state machine, in order.
    fn run_effects(&mut self, effects: Vec<Effect>) -> EffectOutcome {
        let mut outcome = EffectOutcome::default();
        for effect in effects {
            match effect {
                Effect::EmitItem {
                    id,
                    content,
                    superseded,
                } => {
                    self.record(EventKind::ItemExtractedV1 {
                        id: id.clone(),
                        superseded,
                    });
                    if let Some(cb) = &self.item_callback {
                        cb(&id, &content, superseded);
                    }
                }
                Effect::RejectPhase {
                    requested,
                    suggested,
                } => {
                    self.inject_corrective(
                        prompts::illegal_transition(requested, suggested),
                        "illegal phase transition",
                    );
                }
                Effect::ApplyPhase { from, to, forced } => {
                    self.record(EventKind::PhaseChangedV1 { from, to, forced });
                    if from == Phase::Planning
                        && self.planning_digest.is_none()
                        && !self.planning_notes.is_empty()
                    {
                        self.planning_digest = Some(self.planning_notes.join("\n"));
                    }
                }
                Effect::NudgeLeavePlanning { consecutive } => {
                    self.inject_corrective(prompts::leave_planning(consecutive), "planning stall");
                }
                Effect::NudgeProduceOutput { consecutive } => {
                    self.inject_corrective(prompts::produce_output(consecutive), "working stall");
                }
                Effect::NudgeContinue { missing } => {
                    self.inject_corrective(
                        prompts::continue_missing(&missing),
                        "incomplete coverage",
                    );
                }
                Effect::NudgeAdvance { next } => {
                    self.inject_corrective(prompts::advance_to(next), "phase advance due");
                }
                Effect::NudgeFinishReview => {
                    self.inject_corrective(prompts::finish_review(), "review wrap-up");
                }
                Effect::Completed => outcome.completed = true,
                // liveness is checked at turn start, before any effects
                Effect::LivenessExceeded { .. } => {}
            }
        }
        outcome
    }

    /// A guard violation aborted the turn. Degeneration gets a bounded
    /// number of fresh attempts; marker violations are re-prompted
    /// without limit (stall detection bounds them indirectly).
    fn handle_violation(&mut self, violation: GuardViolation) -> Result<()> {
        self.record(EventKind::GuardViolationV1 {
            detail: violation.detail(),
        });
        match violation {
            GuardViolation::Degeneration { detail } => {
                self.degeneration_retries += 1;
                if self.degeneration_retries > self.cfg.orchestrator.degeneration_retry_budget {
                    let err = SessionError::Degeneration {
                        chunk_label: self.chunk.label(),
                        detail,
                    };
                    self.record(EventKind::SessionFailedV1 {
                        error: err.to_string(),
                    });
                    return Err(err.into());
                }
                self.inject_corrective(prompts::degeneration_notice(), "degeneration retry");
            }
            other => {
                self.inject_corrective(
                    prompts::protocol_notice(&other.detail()),
                    "stream protocol violation",
                );
            }
        }
        Ok(())
    }

    /// Stream callback for one turn: feeds content deltas through the
    /// guard and trips the per-turn token the moment it aborts, then
    /// forwards every chunk downstream.
    fn guarded_callback(
        &self,
        guard: Arc<Mutex<StreamGuard>>,
        turn_cancel: CancelToken,
    ) -> StreamCallback {
        let external = self.cancel.clone();
        let downstream = self.stream_callback.clone();
        Arc::new(move |chunk: StreamChunk| {
            if external.is_cancelled() {
                turn_cancel.cancel();
            }
            if let StreamChunk::ContentDelta(text) = &chunk
                && let Ok(mut g) = guard.lock()
                && matches!(g.observe(text), GuardVerdict::Abort(_))
            {
                turn_cancel.cancel();
            }
            if let Some(cb) = &downstream {
                cb(chunk);
            }
        })
    }

    fn inject_corrective(&mut self, content: String, reason: &str) {
        self.messages.push(ChatMessage::System { content });
        self.corrective_prompts += 1;
        self.record(EventKind::CorrectiveInjectedV1 {
            reason: reason.to_string(),
        });
    }

    fn fail_cancelled(&mut self) -> anyhow::Error {
        self.record(EventKind::SessionFailedV1 {
            error: "cancelled".to_string(),
        });
        SessionError::Cancelled.into()
    }

    fn emit_stream(&self, chunk: StreamChunk) {
        if let Some(cb) = &self.stream_callback {
            cb(chunk);
        }
    }

    fn record(&mut self, kind: EventKind) {
        self.seq_no += 1;
        if let Some(observer) = &self.observer {
            let envelope = EventEnvelope {
                seq_no: self.seq_no,
                at: chrono::Utc::now(),
                session_id: self.session_id,
                kind,
            };
            if let Err(err) = observer.record_event(&envelope) {
                observer.warn_log(&format!("failed to record event: {err}"));
            }
        }
    }
}

fn handle_update_phase(
    state: SessionState,
    args: &serde_json::Value,
    stall: &StallPolicy,
) -> (SessionState, String, bool) {
    let Some(phase) = args.get("phase").and_then(|v| v.as_str()).and_then(Phase::parse) else {
        return (
            state,
            "error: 'phase' must be one of planning, working, reviewing, done".to_string(),
            false,
        );
    };
    let (state, _) = step(state, SessionEvent::PhaseRequested(phase), stall);
    (
        state,
        format!("phase change to '{phase}' noted; it takes effect when you finish this turn"),
        true,
    )
}

/// Resolve the submitted item to an id: explicit `id`, or 1-based
/// `index` into this chunk's items.
fn parse_submit_args(
    args: &serde_json::Value,
    item_ids: &[String],
) -> std::result::Result<(String, String), String> {
    let content = args
        .get("content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| "'content' is required".to_string())?;
    if let Some(id) = args
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Ok((id.to_string(), content));
    }
    if let Some(index) = args.get("index").and_then(|v| v.as_u64()) {
        let idx = index as usize;
        if (1..=item_ids.len()).contains(&idx) {
            return Ok((item_ids[idx - 1].clone(), content));
        }
        return Err(format!(
            "index {index} is out of range for this slice (1..={})",
            item_ids.len()
        ));
    }
    Err("either 'id' or 'index' is required".to_string())
}

fn summarize_args(args: &serde_json::Value) -> String {
    let text = args.to_string();
    if text.chars().count() > 120 {
        let truncated: String = text.chars().take(120).collect();
        format!("{truncated}...")
    } else {
        text
    }
}

/// Run one chunk as a single session configured from `policy`.
#[allow(clippy::too_many_arguments)]
pub fn run_chunk(
    llm: &(dyn LlmClient + Send + Sync),
    tool_host: Arc<dyn ToolHost + Send + Sync>,
    cfg: &AppConfig,
    chunk: Chunk,
    policy: &ChunkPolicy,
    item_callback: Option<ItemCallback>,
    stream_callback: Option<StreamCallback>,
    cancel: CancelToken,
) -> Result<SessionResult> {
    let mut session = TaskLoopSession::new(llm, tool_host, cfg.clone(), policy.family, chunk);
    configure(&mut session, policy, &item_callback, &stream_callback, &cancel);
    session.run()
}

/// Split a document into chunks and run them in order, carrying the
/// first session's planning digest into the rest.
#[allow(clippy::too_many_arguments)]
pub fn run_document(
    llm: &(dyn LlmClient + Send + Sync),
    tool_host: Arc<dyn ToolHost + Send + Sync>,
    cfg: &AppConfig,
    items: &[SourceItem],
    policy: &ChunkPolicy,
    item_callback: Option<ItemCallback>,
    stream_callback: Option<StreamCallback>,
    cancel: CancelToken,
) -> Result<Vec<SessionResult>> {
    let chunks = chunker::split(
        items,
        cfg.orchestrator.chunk_budget,
        &chunker::numbered_format,
        None,
    );
    let mut results = Vec::with_capacity(chunks.len());
    let mut digest: Option<String> = None;
    for chunk in chunks {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled.into());
        }
        let mut session =
            TaskLoopSession::new(llm, tool_host.clone(), cfg.clone(), policy.family, chunk);
        configure(&mut session, policy, &item_callback, &stream_callback, &cancel);
        if let Some(digest) = &digest {
            session.set_planning_digest(digest.clone());
        }
        let result = session.run()?;
        if digest.is_none() {
            digest = result.planning_digest.clone();
        }
        results.push(result);
    }
    Ok(results)
}

fn configure(
    session: &mut TaskLoopSession<'_>,
    policy: &ChunkPolicy,
    item_callback: &Option<ItemCallback>,
    stream_callback: &Option<StreamCallback>,
    cancel: &CancelToken,
) {
    for tool in &policy.extra_tools {
        session.add_tool(tool.clone());
    }
    for (name, budget) in &policy.tool_budgets {
        session.set_tool_budget(name, *budget);
    }
    for name in &policy.productive_tools {
        session.mark_productive(name);
    }
    if let Some(cb) = item_callback {
        session.set_item_callback(cb.clone());
    }
    if let Some(cb) = stream_callback {
        session.set_stream_callback(cb.clone());
    }
    session.set_cancel_token(cancel.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use redraft_testkit::{RecordingToolHost, ScriptedClient, tool_call};
    use serde_json::json;

    fn test_cfg() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.orchestrator.max_turns = 20;
        cfg
    }

    fn chunk(ids: &[&str]) -> Chunk {
        Chunk {
            text: ids
                .iter()
                .enumerate()
                .map(|(i, id)| format!("[{}] source for {id}\n\n", i + 1))
                .collect(),
            item_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn session<'a>(
        client: &'a ScriptedClient,
        host: Arc<RecordingToolHost>,
        family: TaskFamily,
        ids: &[&str],
    ) -> TaskLoopSession<'a> {
        TaskLoopSession::new(client, host, test_cfg(), family, chunk(ids))
    }

    #[test]
    fn tool_driven_lifecycle_reaches_done() {
        let client = ScriptedClient::new();
        client.push_tool_calls(vec![tool_call(
            TOOL_UPDATE_PHASE,
            json!({"phase": "working"}),
        )]);
        client.push_text("moving on");
        client.push_tool_calls(vec![
            tool_call(TOOL_SUBMIT_ITEM, json!({"id": "p1", "content": "one"})),
            tool_call(TOOL_SUBMIT_ITEM, json!({"index": 2, "content": "two"})),
            tool_call(TOOL_UPDATE_PHASE, json!({"phase": "done"})),
        ]);
        let host = Arc::new(RecordingToolHost::new());
        let result = session(&client, host.clone(), TaskFamily::Summarize, &["p1", "p2"])
            .run()
            .unwrap();
        assert_eq!(result.phase, Phase::Done);
        assert_eq!(result.extracted["p1"], "one");
        assert_eq!(result.extracted["p2"], "two");
        assert_eq!(result.text, "moving on");
        // conventional tools never reach the host
        assert!(host.dispatched_names().is_empty());
        assert_eq!(client.remaining_steps(), 0);
    }

    #[test]
    fn unauthorized_tool_is_rejected_without_reaching_the_host() {
        let client = ScriptedClient::new();
        client.push_tool_calls(vec![tool_call("shell_exec", json!({"cmd": "rm -rf /"}))]);
        client.push_tool_calls(vec![tool_call(
            TOOL_UPDATE_PHASE,
            json!({"phase": "working"}),
        )]);
        client.push_tool_calls(vec![tool_call(
            TOOL_UPDATE_PHASE,
            json!({"phase": "done"}),
        )]);
        let host = Arc::new(RecordingToolHost::new());
        let result = session(&client, host.clone(), TaskFamily::Summarize, &["p1"])
            .run()
            .unwrap();
        assert_eq!(result.phase, Phase::Done);
        assert!(host.dispatched_names().is_empty());
        // the rejection produced exactly one tool message for that call
        let requests = client.requests.lock().unwrap();
        let tool_messages: Vec<&ChatMessage> = requests[1]
            .messages
            .iter()
            .filter(|m| matches!(m, ChatMessage::Tool { .. }))
            .collect();
        assert_eq!(tool_messages.len(), 1);
        let ChatMessage::Tool { content, .. } = tool_messages[0] else {
            unreachable!()
        };
        assert!(content.contains("not available"));
    }

    #[test]
    fn domain_tool_goes_through_the_host_and_budget_holds() {
        let client = ScriptedClient::new();
        client.push_tool_calls(vec![
            tool_call("lookup_term", json!({"term": "alpha"})),
            tool_call("lookup_term", json!({"term": "beta"})),
        ]);
        client.push_tool_calls(vec![tool_call(
            TOOL_UPDATE_PHASE,
            json!({"phase": "working"}),
        )]);
        client.push_tool_calls(vec![tool_call(
            TOOL_UPDATE_PHASE,
            json!({"phase": "done"}),
        )]);
        let host = Arc::new(RecordingToolHost::new());
        host.respond_with("lookup_term", "alpha means a");
        let mut s = session(&client, host.clone(), TaskFamily::Summarize, &["p1"]);
        s.add_tool(ToolDefinition::function(
            "lookup_term",
            "Look up a term.",
            json!({"type": "object", "properties": {"term": {"type": "string"}}}),
        ));
        s.set_tool_budget("lookup_term", 1);
        s.run().unwrap();
        // second call exceeded the budget and was answered in-loop
        assert_eq!(host.dispatched_names(), vec!["lookup_term"]);
    }

    #[test]
    fn degeneration_exhausts_its_retry_budget() {
        let client = ScriptedClient::new();
        let junk = "z".repeat(300);
        for _ in 0..3 {
            client.push_fragments(&[junk.as_str()]);
        }
        let host = Arc::new(RecordingToolHost::new());
        let err = session(&client, host, TaskFamily::Summarize, &["p1"])
            .run()
            .unwrap_err();
        let session_err = err.downcast::<SessionError>().unwrap();
        assert!(matches!(session_err, SessionError::Degeneration { .. }));
        assert_eq!(client.remaining_steps(), 0);
    }

    #[test]
    fn cancellation_surfaces_as_cancelled() {
        let client = ScriptedClient::new();
        client.push_text("never consumed");
        let host = Arc::new(RecordingToolHost::new());
        let mut s = session(&client, host, TaskFamily::Summarize, &["p1"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        s.set_cancel_token(cancel);
        let err = s.run().unwrap_err();
        assert!(matches!(
            err.downcast::<SessionError>().unwrap(),
            SessionError::Cancelled
        ));
        assert_eq!(client.remaining_steps(), 1);
    }

    #[test]
    fn submit_args_resolve_id_or_index() {
        let ids: Vec<String> = vec!["p1".into(), "p2".into()];
        assert_eq!(
            parse_submit_args(&json!({"id": "p2", "content": "x"}), &ids),
            Ok(("p2".to_string(), "x".to_string()))
        );
        assert_eq!(
            parse_submit_args(&json!({"index": 1, "content": "x"}), &ids),
            Ok(("p1".to_string(), "x".to_string()))
        );
        assert!(parse_submit_args(&json!({"index": 3, "content": "x"}), &ids).is_err());
        assert!(parse_submit_args(&json!({"id": "p1"}), &ids).is_err());
        assert!(parse_submit_args(&json!({"content": "x"}), &ids).is_err());
    }
}
