//! The task orchestrator: chunking, stream guarding, completeness
//! checking, tool-call governance and the task loop session that drives
//! one chunk through its phase lifecycle against a tool-calling model.

pub mod chunker;
pub mod governor;
pub mod prompts;
pub mod session;
pub mod state;
pub mod stream_guard;
pub mod verifier;

pub use chunker::split;
pub use governor::{ToolDecision, ToolGovernor};
pub use session::{ChunkPolicy, SessionMetrics, SessionResult, TaskLoopSession, run_chunk, run_document};
pub use state::{Effect, SessionEvent, SessionState, StallPolicy};
pub use stream_guard::{GuardPolicy, GuardVerdict, GuardViolation, StreamGuard};
pub use verifier::{ChangedOnly, CompletenessVerifier, Coverage, FullCoverage, verifier_for};
