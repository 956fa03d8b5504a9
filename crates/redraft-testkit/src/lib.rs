//! Test doubles for session tests: a scripted model client that replays
//! canned responses (streaming their fragments through the callback so
//! guards see real mid-stream input) and a recording tool host.

use anyhow::{Result, anyhow};
use redraft_core::{
    CancelToken, ChatRequest, LlmResponse, LlmToolCall, SourceItem, StreamCallback, StreamChunk,
    ToolCall, ToolContext, ToolHost,
};
use redraft_llm::LlmClient;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

/// One scripted model turn: the assembled response plus the content
/// fragments to replay through the stream callback before returning it.
pub struct ScriptedStep {
    pub response: LlmResponse,
    pub fragments: Vec<String>,
}

/// Scripted `LlmClient`: pops one step per call, records every request.
/// Streaming checks the cancel token after each fragment, like the real
/// transport checks between SSE lines.
#[derive(Default)]
pub struct ScriptedClient {
    steps: Mutex<VecDeque<ScriptedStep>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_step(&self, step: ScriptedStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Queue a plain text turn, streamed as a single fragment.
    pub fn push_text(&self, text: &str) {
        self.push_step(ScriptedStep {
            response: text_response(text),
            fragments: vec![text.to_string()],
        });
    }

    /// Queue a text turn streamed in the given fragments.
    pub fn push_fragments(&self, fragments: &[&str]) {
        let text: String = fragments.concat();
        self.push_step(ScriptedStep {
            response: text_response(&text),
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Queue a turn that requests the given tool calls.
    pub fn push_tool_calls(&self, calls: Vec<LlmToolCall>) {
        self.push_step(ScriptedStep {
            response: LlmResponse {
                text: String::new(),
                finish_reason: "tool_calls".to_string(),
                reasoning_content: String::new(),
                tool_calls: calls,
            },
            fragments: Vec::new(),
        });
    }

    #[must_use]
    pub fn remaining_steps(&self) -> usize {
        self.steps.lock().unwrap().len()
    }

    fn pop_step(&self, req: &ChatRequest) -> Result<ScriptedStep> {
        self.requests.lock().unwrap().push(req.clone());
        self.steps
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no more scripted responses"))
    }
}

impl LlmClient for ScriptedClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        Ok(self.pop_step(req)?.response)
    }

    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
        cancel: &CancelToken,
    ) -> Result<LlmResponse> {
        let step = self.pop_step(req)?;
        for fragment in &step.fragments {
            if cancel.is_cancelled() {
                return Err(anyhow!("chat request cancelled mid-stream"));
            }
            cb(StreamChunk::ContentDelta(fragment.clone()));
            // the guard cancels from inside the callback; honor it
            // before delivering the next fragment
            if cancel.is_cancelled() {
                return Err(anyhow!("chat request cancelled mid-stream"));
            }
        }
        cb(StreamChunk::Done);
        Ok(step.response)
    }
}

/// Build a finalizing text response.
#[must_use]
pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "stop".to_string(),
        reasoning_content: String::new(),
        tool_calls: Vec::new(),
    }
}

/// Build a tool call with a fresh id.
#[must_use]
pub fn tool_call(name: &str, args: serde_json::Value) -> LlmToolCall {
    LlmToolCall {
        id: format!("call_{}", Uuid::now_v7().simple()),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

/// Tool host that records every dispatched call and answers from a
/// per-tool script, defaulting to `{"status":"ok"}`.
#[derive(Default)]
pub struct RecordingToolHost {
    pub calls: Mutex<Vec<ToolCall>>,
    responses: Mutex<BTreeMap<String, String>>,
    failures: Mutex<BTreeMap<String, String>>,
}

impl RecordingToolHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the result text for one tool name.
    pub fn respond_with(&self, name: &str, result: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(name.to_string(), result.to_string());
    }

    /// Make one tool name fail with an error.
    pub fn fail_with(&self, name: &str, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), error.to_string());
    }

    #[must_use]
    pub fn dispatched_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}

impl ToolHost for RecordingToolHost {
    fn dispatch(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<String> {
        self.calls.lock().unwrap().push(call.clone());
        if let Some(error) = self.failures.lock().unwrap().get(&call.name) {
            return Err(anyhow!("{error}"));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&call.name)
            .cloned()
            .unwrap_or_else(|| r#"{"status":"ok"}"#.to_string()))
    }
}

/// `n` items with ids `p1..pn` and matching indices.
#[must_use]
pub fn numbered_items(n: usize) -> Vec<SourceItem> {
    (0..n)
        .map(|i| SourceItem::new(format!("p{}", i + 1), format!("source text {}", i + 1), i))
        .collect()
}
