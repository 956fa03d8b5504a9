//! Shared data model for the redraft workspace: source items and chunks,
//! the phase lifecycle and task-family transition tables, chat/tool wire
//! types, session events, configuration, and the error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

// ── Source items and chunks ────────────────────────────────────────────

/// One addressable unit of source content (typically a paragraph).
///
/// `original_index` is the item's position in the unfiltered source
/// sequence. Blank items never enter chunk text, but they still occupy an
/// index so that displayed positions reflect gaps honestly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: String,
    pub text: String,
    pub original_index: usize,
}

impl SourceItem {
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>, original_index: usize) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            original_index,
        }
    }

    /// Whether the item carries any renderable text.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A bounded group of items processed together by one session.
///
/// `item_ids` preserves the original item order; no id belongs to more
/// than one chunk of the same split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub item_ids: Vec<String>,
}

impl Chunk {
    /// Human-readable label for diagnostics, e.g. `"p12..p47 (36 items)"`.
    #[must_use]
    pub fn label(&self) -> String {
        match (self.item_ids.first(), self.item_ids.last()) {
            (Some(first), Some(last)) if first != last => {
                format!("{first}..{last} ({} items)", self.item_ids.len())
            }
            (Some(only), _) => format!("{only} (1 item)"),
            _ => "empty chunk".to_string(),
        }
    }
}

// ── Phase lifecycle ────────────────────────────────────────────────────

/// Stage of a session's lifecycle. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Working,
    Reviewing,
    Done,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Working => "working",
            Phase::Reviewing => "reviewing",
            Phase::Done => "done",
        }
    }

    /// Parse a phase name as it appears in stream markers and tool
    /// arguments. Case-insensitive;
    /// returns `None` for anything outside the closed set.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "planning" => Some(Phase::Planning),
            "working" => Some(Phase::Working),
            "reviewing" => Some(Phase::Reviewing),
            "done" => Some(Phase::Done),
            _ => None,
        }
    }

    /// Whether per-item content may be emitted while this phase is active.
    #[must_use]
    pub fn allows_content(self) -> bool {
        matches!(self, Phase::Working | Phase::Reviewing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed registry of task families. Each family is pure data: its
/// transition table, whether it carries a review phase, and which
/// completeness discipline applies. Adding a family is a data addition
/// here, not a code change elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFamily {
    Translate,
    Proofread,
    Summarize,
}

impl TaskFamily {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskFamily::Translate => "translate",
            TaskFamily::Proofread => "proofread",
            TaskFamily::Summarize => "summarize",
        }
    }

    /// Families with a verification phase use the 4-state table
    /// (`Planning → Working → Reviewing → Done`); the rest use the
    /// 3-state table.
    #[must_use]
    pub fn has_review(self) -> bool {
        matches!(self, TaskFamily::Translate | TaskFamily::Proofread)
    }

    /// Whether every item of a chunk must be covered before the session
    /// may close. Proofread and summarize produce output only for items
    /// that actually change, so partial maps are complete for them.
    #[must_use]
    pub fn requires_full_coverage(self) -> bool {
        matches!(self, TaskFamily::Translate)
    }

    /// Forward transitions legal from `from`. Self-transitions are legal
    /// everywhere (they count toward stall detection, not rejection) and
    /// are not listed here.
    #[must_use]
    pub fn next_phases(self, from: Phase) -> &'static [Phase] {
        if self.has_review() {
            match from {
                Phase::Planning => &[Phase::Working],
                Phase::Working => &[Phase::Reviewing],
                Phase::Reviewing => &[Phase::Done, Phase::Working],
                Phase::Done => &[],
            }
        } else {
            match from {
                Phase::Planning => &[Phase::Working],
                Phase::Working => &[Phase::Done],
                Phase::Reviewing | Phase::Done => &[],
            }
        }
    }

    #[must_use]
    pub fn is_legal(self, from: Phase, to: Phase) -> bool {
        from == to || self.next_phases(from).contains(&to)
    }

    /// The one phase the session should be told to move to when it
    /// requests an illegal transition or stalls.
    #[must_use]
    pub fn suggested_next(self, from: Phase) -> Phase {
        self.next_phases(from).first().copied().unwrap_or(Phase::Done)
    }
}

// ── Stream protocol markers ────────────────────────────────────────────
//
// When the model narrates rather than calls tools, phase announcements
// and per-item content travel as marker lines in the text stream:
//
//   @@phase working
//   @@item p17
//   <content for p17 ...>
//
// The stream guard validates these in stream order; extraction itself
// only ever happens through the `submit_item` tool.

pub const PHASE_MARKER: &str = "@@phase";
pub const ITEM_MARKER: &str = "@@item";

/// Parse a complete line as a phase announcement marker.
#[must_use]
pub fn parse_phase_marker(line: &str) -> Option<Phase> {
    let rest = line.trim().strip_prefix(PHASE_MARKER)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    Phase::parse(rest)
}

/// Parse a complete line as an item content marker, yielding the item id.
#[must_use]
pub fn parse_item_marker(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix(ITEM_MARKER)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let id = rest.trim();
    if id.is_empty() { None } else { Some(id) }
}

// ── Cancellation ───────────────────────────────────────────────────────

/// Cooperative cancellation flag shared between the caller, the session
/// driver and the transport. Cloning yields a handle to the same flag.
/// The stream guard trips a per-turn token from inside the stream
/// callback so an in-flight request aborts on the very fragment that
/// detected a violation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── Tool dispatch boundary ─────────────────────────────────────────────

/// A structured request emitted by the model to invoke a named external
/// capability. `id` is the model-assigned tool_call id echoed back in the
/// tool result message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Ambient context handed to the tool host on every dispatch.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: Uuid,
    pub phase: Phase,
    pub item_ids: Vec<String>,
}

/// External tool executor boundary. The orchestrator treats the returned
/// text opaquely except for the conventional `update_phase`,
/// `submit_item` and `set_title` tools it inspects itself.
pub trait ToolHost {
    fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> Result<String>;
}

// ── Chat wire types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
}

/// A single chunk emitted during streaming or tool dispatch.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// A reasoning/thinking text delta.
    ReasoningDelta(String),
    /// A tool call has started execution.
    ToolCallStart {
        tool_name: String,
        args_summary: String,
    },
    /// A tool call has completed execution.
    ToolCallEnd {
        tool_name: String,
        duration_ms: u64,
        success: bool,
    },
    /// Streaming is done; the final assembled response follows.
    Done,
}

/// Callback type for receiving streaming chunks.
/// Uses `Arc<dyn Fn>` so it can be cloned across multiple turns.
pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// Callback for incremental per-item extraction: `(id, content,
/// superseded)`. `superseded` is true when the write replaced an earlier
/// value for the same id.
pub type ItemCallback = Arc<dyn Fn(&str, &str, bool) + Send + Sync>;

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reasoning_content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    #[must_use]
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// The function schema within a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Controls how the model picks tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "none", "auto", or "required"
    Mode(String),
    /// Force a specific function.
    Function {
        #[serde(rename = "type")]
        choice_type: String,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Mode("auto".to_string())
    }
    pub fn none() -> Self {
        Self::Mode("none".to_string())
    }
    /// Force the model to return at least one tool call.
    pub fn required() -> Self {
        Self::Mode("required".to_string())
    }
}

/// Request for the chat-with-tools API.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

// ── Session events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    SessionStartedV1 {
        family: TaskFamily,
        chunk_label: String,
        item_count: usize,
    },
    TurnCompletedV1 {
        turn: u32,
        tool_calls: usize,
    },
    PhaseChangedV1 {
        from: Phase,
        to: Phase,
        /// True when the orchestrator forced the transition instead of
        /// the model requesting it.
        forced: bool,
    },
    ToolDispatchedV1 {
        name: String,
        success: bool,
    },
    ToolRejectedV1 {
        name: String,
        reason: String,
    },
    ItemExtractedV1 {
        id: String,
        superseded: bool,
    },
    GuardViolationV1 {
        detail: String,
    },
    CorrectiveInjectedV1 {
        reason: String,
    },
    SessionCompletedV1 {
        turns: u32,
        extracted: usize,
    },
    SessionFailedV1 {
        error: String,
    },
}

impl EventKind {
    /// Coarse grouping used by log filtering.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            EventKind::SessionStartedV1 { .. }
            | EventKind::SessionCompletedV1 { .. }
            | EventKind::SessionFailedV1 { .. } => "session",
            EventKind::TurnCompletedV1 { .. } | EventKind::PhaseChangedV1 { .. } => "lifecycle",
            EventKind::ToolDispatchedV1 { .. } | EventKind::ToolRejectedV1 { .. } => "tool",
            EventKind::ItemExtractedV1 { .. } => "extraction",
            EventKind::GuardViolationV1 { .. } | EventKind::CorrectiveInjectedV1 { .. } => "guard",
        }
    }
}

// ── Error taxonomy ─────────────────────────────────────────────────────

/// Terminal session outcomes. Protocol violations and governance
/// rejections never appear here: they are always recovered inside the
/// loop by re-prompting the model.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The stream guard saw pathological repetition and the bounded
    /// retry budget is exhausted.
    #[error("model output degenerated while processing {chunk_label}: {detail}")]
    Degeneration { chunk_label: String, detail: String },
    /// Turn ceiling exceeded while the phase never reached `done`.
    #[error("session exceeded {limit} turns without completing (last phase: {phase})")]
    TurnLimit { limit: u32, phase: Phase },
    /// The caller's cancellation token fired; distinct from failure so
    /// callers can tell user-cancelled work from real errors.
    #[error("session cancelled")]
    Cancelled,
    /// Network/API failure from the transport, propagated immediately.
    /// Blind retry of a paid stateful conversation is left to the caller.
    #[error("model transport failed: {0}")]
    Transport(anyhow::Error),
}

// ── Configuration ──────────────────────────────────────────────────────

/// Per-workspace state directory holding settings and the observation log.
#[must_use]
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".redraft")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub orchestrator: OrchestratorConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".redraft/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Layered load: defaults, then the legacy TOML file, then user,
    /// project and project-local JSON settings, each merged recursively
    /// over the previous layer.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            endpoint: "https://api.deepseek.com/chat/completions".to_string(),
            api_key: None,
            api_key_env: "REDRAFT_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 8192,
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Character budget for one chunk of formatted items.
    pub chunk_budget: usize,
    /// Turn ceiling per session; exceeding it is a liveness failure.
    pub max_turns: u32,
    /// Consecutive turns in one phase before escalation kicks in.
    pub stall_threshold: u32,
    /// Retries of a turn aborted for degeneration before giving up.
    pub degeneration_retry_budget: u32,
    /// Degeneration threshold is `max(source_longest_run * run_factor,
    /// min_run)` characters.
    pub guard_run_factor: usize,
    pub guard_min_run: usize,
    /// Buffer growth (chars) between full phase/content re-scans.
    pub guard_check_increment: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_budget: 8000,
            max_turns: 50,
            stall_threshold: 3,
            degeneration_retry_budget: 2,
            guard_run_factor: 4,
            guard_min_run: 40,
            guard_check_increment: 160,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

// ── Misc shared helpers ────────────────────────────────────────────────

/// Order-preserving "expected minus produced" used by completeness
/// checks and diagnostics.
#[must_use]
pub fn missing_ids(expected: &[String], produced: &BTreeMap<String, String>) -> Vec<String> {
    expected
        .iter()
        .filter(|id| !produced.contains_key(*id))
        .cloned()
        .collect()
}
