//! The session's decision core as an explicit event/effect machine:
//! `(SessionState, SessionEvent) -> (SessionState, Vec<Effect>)`. All
//! I/O (model calls, tool dispatch, prompt injection) lives in the
//! driver; this module is pure and unit-testable without a model.

use crate::verifier::Coverage;
use redraft_core::{Phase, TaskFamily};
use std::collections::BTreeMap;

/// Stall-detection knobs, lifted from `OrchestratorConfig`.
#[derive(Debug, Clone, Copy)]
pub struct StallPolicy {
    /// Consecutive non-advancing turns in one phase before escalation.
    pub stall_threshold: u32,
    /// Turn ceiling; exceeding it while not `Done` is a liveness failure.
    pub max_turns: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            max_turns: 50,
        }
    }
}

/// Pure per-session state. Owned by exactly one session and dropped when
/// the session returns; nothing here is shared across chunks.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub family: TaskFamily,
    pub phase: Phase,
    pub pending_phase: Option<Phase>,
    /// Per-item results, last write wins.
    pub extracted: BTreeMap<String, String>,
    pub title: Option<String>,
    /// Consecutive non-advancing turns spent in each phase.
    pub consecutive: BTreeMap<Phase, u32>,
    pub turns: u32,
}

impl SessionState {
    #[must_use]
    pub fn new(family: TaskFamily) -> Self {
        Self {
            family,
            phase: Phase::Planning,
            pending_phase: None,
            extracted: BTreeMap::new(),
            title: None,
            consecutive: BTreeMap::new(),
            turns: 0,
        }
    }

    #[must_use]
    pub fn consecutive_in(&self, phase: Phase) -> u32 {
        self.consecutive.get(&phase).copied().unwrap_or(0)
    }

    fn bump_consecutive(&mut self) -> u32 {
        let n = self.consecutive_in(self.phase) + 1;
        self.consecutive.insert(self.phase, n);
        n
    }

    fn reset_consecutive(&mut self) {
        self.consecutive.clear();
    }
}

/// What just happened in the driver.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new turn is about to be submitted to the model.
    TurnStarted,
    /// The `update_phase` tool reported success with this target.
    PhaseRequested(Phase),
    /// The `set_title` tool reported a value.
    TitleSubmitted(String),
    /// The `submit_item` tool supplied content for one item.
    ItemSubmitted { id: String, content: String },
    /// A tool from the productive set was dispatched successfully.
    ProductiveToolUsed,
    /// A turn that dispatched tool calls has finished; `coverage` gates
    /// a pending move to `done`.
    ToolTurnEnded { productive: bool, coverage: Coverage },
    /// The model finalized without tool calls; `coverage` is the
    /// verifier's view of the extraction map at this moment.
    TurnFinalized { coverage: Coverage },
}

/// Side effects for the driver to execute, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Report one extraction to the caller (and the event log).
    EmitItem {
        id: String,
        content: String,
        superseded: bool,
    },
    /// The requested transition is illegal; tell the model the one legal
    /// next phase and retry.
    RejectPhase { requested: Phase, suggested: Phase },
    /// The phase advanced. `forced` marks orchestrator-imposed moves.
    ApplyPhase {
        from: Phase,
        to: Phase,
        forced: bool,
    },
    /// Planning has stalled; force an immediate move to working.
    NudgeLeavePlanning { consecutive: u32 },
    /// Working has stalled with nothing extracted; demand output now.
    NudgeProduceOutput { consecutive: u32 },
    /// Work is incomplete; prompt to continue with the missing ids.
    NudgeContinue { missing: Vec<String> },
    /// Work is complete; prompt to advance to `next`.
    NudgeAdvance { next: Phase },
    /// Reviewing, complete, not yet stalled; invite final corrections.
    NudgeFinishReview,
    /// The session reached `Done`.
    Completed,
    /// Turn ceiling exceeded while not `Done`.
    LivenessExceeded { limit: u32, phase: Phase },
}

/// Advance the machine by one event.
#[must_use]
pub fn step(
    mut state: SessionState,
    event: SessionEvent,
    policy: &StallPolicy,
) -> (SessionState, Vec<Effect>) {
    let mut effects = Vec::new();
    match event {
        SessionEvent::TurnStarted => {
            state.turns += 1;
            if state.turns > policy.max_turns && state.phase != Phase::Done {
                effects.push(Effect::LivenessExceeded {
                    limit: policy.max_turns,
                    phase: state.phase,
                });
            }
        }
        SessionEvent::PhaseRequested(phase) => {
            state.pending_phase = Some(phase);
        }
        SessionEvent::TitleSubmitted(title) => {
            state.title = Some(title);
        }
        SessionEvent::ItemSubmitted { id, content } => {
            let superseded = state.extracted.contains_key(&id);
            state.extracted.insert(id.clone(), content.clone());
            effects.push(Effect::EmitItem {
                id,
                content,
                superseded,
            });
        }
        SessionEvent::ProductiveToolUsed => {
            state.reset_consecutive();
        }
        SessionEvent::ToolTurnEnded {
            productive,
            coverage,
        } => {
            match apply_pending(&mut state, &coverage, &mut effects) {
                PendingOutcome::Applied => return (state, effects),
                PendingOutcome::RefusedIncomplete => {
                    effects.push(Effect::NudgeContinue {
                        missing: coverage.missing_ids,
                    });
                }
                PendingOutcome::None | PendingOutcome::Rejected => {}
            }
            if !productive {
                state.bump_consecutive();
            }
        }
        SessionEvent::TurnFinalized { coverage } => {
            return finalize(state, coverage, policy);
        }
    }
    (state, effects)
}

enum PendingOutcome {
    None,
    Applied,
    Rejected,
    /// A legal move to `done` was refused because items are missing.
    RefusedIncomplete,
}

/// Try to honor a pending phase request. Self-transition requests fall
/// through to stall accounting; rejections push their effect here.
fn apply_pending(
    state: &mut SessionState,
    coverage: &Coverage,
    effects: &mut Vec<Effect>,
) -> PendingOutcome {
    let Some(requested) = state.pending_phase.take() else {
        return PendingOutcome::None;
    };
    if requested == state.phase {
        return PendingOutcome::None;
    }
    if !state.family.is_legal(state.phase, requested) {
        effects.push(Effect::RejectPhase {
            requested,
            suggested: state.family.suggested_next(state.phase),
        });
        return PendingOutcome::Rejected;
    }
    if requested == Phase::Done && !coverage.complete {
        return PendingOutcome::RefusedIncomplete;
    }
    effects.push(Effect::ApplyPhase {
        from: state.phase,
        to: requested,
        forced: false,
    });
    state.phase = requested;
    state.reset_consecutive();
    if state.phase == Phase::Done {
        effects.push(Effect::Completed);
    }
    PendingOutcome::Applied
}

fn finalize(
    mut state: SessionState,
    coverage: Coverage,
    policy: &StallPolicy,
) -> (SessionState, Vec<Effect>) {
    let mut effects = Vec::new();

    match apply_pending(&mut state, &coverage, &mut effects) {
        PendingOutcome::Applied => return (state, effects),
        PendingOutcome::Rejected => {
            // the rejection already names the one legal next phase; the
            // turn counts toward the stall ceiling but gets no second
            // corrective
            state.bump_consecutive();
            return (state, effects);
        }
        // a refused `done` falls through to stall accounting, which
        // produces the matching corrective
        PendingOutcome::None | PendingOutcome::RefusedIncomplete => {}
    }

    if state.phase == Phase::Done {
        effects.push(Effect::Completed);
        return (state, effects);
    }

    let consecutive = state.bump_consecutive();
    match state.phase {
        Phase::Planning => {
            if consecutive >= policy.stall_threshold {
                effects.push(Effect::NudgeLeavePlanning { consecutive });
            } else {
                effects.push(Effect::NudgeAdvance {
                    next: state.family.suggested_next(Phase::Planning),
                });
            }
        }
        Phase::Working => {
            if consecutive >= policy.stall_threshold && state.extracted.is_empty() {
                effects.push(Effect::NudgeProduceOutput { consecutive });
            } else if coverage.complete {
                effects.push(Effect::NudgeAdvance {
                    next: state.family.suggested_next(Phase::Working),
                });
            } else {
                effects.push(Effect::NudgeContinue {
                    missing: coverage.missing_ids,
                });
            }
        }
        Phase::Reviewing => {
            if !coverage.complete {
                // the one orchestrator-forced backward transition
                effects.push(Effect::ApplyPhase {
                    from: Phase::Reviewing,
                    to: Phase::Working,
                    forced: true,
                });
                state.phase = Phase::Working;
                state.consecutive.insert(Phase::Reviewing, 0);
                effects.push(Effect::NudgeContinue {
                    missing: coverage.missing_ids,
                });
            } else if consecutive >= policy.stall_threshold {
                effects.push(Effect::ApplyPhase {
                    from: Phase::Reviewing,
                    to: Phase::Done,
                    forced: true,
                });
                state.phase = Phase::Done;
                effects.push(Effect::Completed);
            } else {
                effects.push(Effect::NudgeFinishReview);
            }
        }
        Phase::Done => unreachable!("handled above"),
    }
    (state, effects)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StallPolicy {
        StallPolicy {
            stall_threshold: 3,
            max_turns: 10,
        }
    }

    fn working_state(family: TaskFamily) -> SessionState {
        let mut state = SessionState::new(family);
        state.phase = Phase::Working;
        state
    }

    fn finalize_with(
        state: SessionState,
        coverage: Coverage,
    ) -> (SessionState, Vec<Effect>) {
        step(state, SessionEvent::TurnFinalized { coverage }, &policy())
    }

    fn incomplete(missing: &[&str]) -> Coverage {
        Coverage {
            complete: false,
            missing_ids: missing.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn legal_pending_phase_is_applied_and_counters_reset() {
        let mut state = SessionState::new(TaskFamily::Translate);
        state.consecutive.insert(Phase::Planning, 2);
        let (state, _) = step(
            state,
            SessionEvent::PhaseRequested(Phase::Working),
            &policy(),
        );
        let (state, effects) = finalize_with(state, Coverage::complete());
        assert_eq!(state.phase, Phase::Working);
        assert_eq!(state.consecutive_in(Phase::Planning), 0);
        assert!(effects.contains(&Effect::ApplyPhase {
            from: Phase::Planning,
            to: Phase::Working,
            forced: false,
        }));
    }

    #[test]
    fn illegal_pending_phase_is_rejected_with_the_single_suggestion() {
        let state = SessionState::new(TaskFamily::Translate);
        let (state, _) = step(
            state,
            SessionEvent::PhaseRequested(Phase::Reviewing),
            &policy(),
        );
        let (state, effects) = finalize_with(state, Coverage::complete());
        assert_eq!(state.phase, Phase::Planning);
        assert!(effects.contains(&Effect::RejectPhase {
            requested: Phase::Reviewing,
            suggested: Phase::Working,
        }));
    }

    #[test]
    fn rejected_phase_finalize_emits_no_second_corrective() {
        let state = SessionState::new(TaskFamily::Translate);
        let (state, _) = step(
            state,
            SessionEvent::PhaseRequested(Phase::Reviewing),
            &policy(),
        );
        let (state, effects) = finalize_with(state, Coverage::complete());
        assert_eq!(
            effects,
            vec![Effect::RejectPhase {
                requested: Phase::Reviewing,
                suggested: Phase::Working,
            }]
        );
        // the turn still counts toward the stall ceiling
        assert_eq!(state.consecutive_in(Phase::Planning), 1);
    }

    #[test]
    fn self_transition_counts_toward_stall() {
        let mut state = SessionState::new(TaskFamily::Translate);
        for _ in 0..2 {
            let (s, _) = step(
                state,
                SessionEvent::PhaseRequested(Phase::Planning),
                &policy(),
            );
            let (s, effects) = finalize_with(s, Coverage::complete());
            state = s;
            assert!(!effects
                .iter()
                .any(|e| matches!(e, Effect::NudgeLeavePlanning { .. })));
        }
        let (s, _) = step(
            state,
            SessionEvent::PhaseRequested(Phase::Planning),
            &policy(),
        );
        let (_, effects) = finalize_with(s, Coverage::complete());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::NudgeLeavePlanning { consecutive: 3 })));
    }

    #[test]
    fn item_submission_is_last_write_wins_and_both_reported() {
        let state = SessionState::new(TaskFamily::Translate);
        let (state, first) = step(
            state,
            SessionEvent::ItemSubmitted {
                id: "p1".into(),
                content: "draft".into(),
            },
            &policy(),
        );
        let (state, second) = step(
            state,
            SessionEvent::ItemSubmitted {
                id: "p1".into(),
                content: "corrected".into(),
            },
            &policy(),
        );
        assert_eq!(state.extracted["p1"], "corrected");
        assert_eq!(
            first,
            vec![Effect::EmitItem {
                id: "p1".into(),
                content: "draft".into(),
                superseded: false,
            }]
        );
        assert_eq!(
            second,
            vec![Effect::EmitItem {
                id: "p1".into(),
                content: "corrected".into(),
                superseded: true,
            }]
        );
    }

    #[test]
    fn working_stall_with_empty_map_demands_output() {
        let mut state = working_state(TaskFamily::Translate);
        state.consecutive.insert(Phase::Working, 2);
        let (_, effects) = finalize_with(state, incomplete(&["p1"]));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::NudgeProduceOutput { consecutive: 3 })));
    }

    #[test]
    fn working_incomplete_prompts_with_missing_ids() {
        let mut state = working_state(TaskFamily::Translate);
        state.extracted.insert("p1".into(), "x".into());
        let (_, effects) = finalize_with(state, incomplete(&["p2", "p5"]));
        assert!(effects.contains(&Effect::NudgeContinue {
            missing: vec!["p2".into(), "p5".into()],
        }));
    }

    #[test]
    fn working_complete_prompts_to_advance() {
        let mut state = working_state(TaskFamily::Translate);
        state.extracted.insert("p1".into(), "x".into());
        let (_, effects) = finalize_with(state, Coverage::complete());
        assert!(effects.contains(&Effect::NudgeAdvance {
            next: Phase::Reviewing,
        }));
    }

    #[test]
    fn reviewing_incomplete_forces_back_to_working() {
        let mut state = working_state(TaskFamily::Translate);
        state.phase = Phase::Reviewing;
        state.consecutive.insert(Phase::Reviewing, 2);
        let (state, effects) = finalize_with(state, incomplete(&["p9"]));
        assert_eq!(state.phase, Phase::Working);
        assert_eq!(state.consecutive_in(Phase::Reviewing), 0);
        assert!(effects.contains(&Effect::ApplyPhase {
            from: Phase::Reviewing,
            to: Phase::Working,
            forced: true,
        }));
    }

    #[test]
    fn reviewing_complete_and_stalled_forces_closure() {
        let mut state = working_state(TaskFamily::Translate);
        state.phase = Phase::Reviewing;
        state.consecutive.insert(Phase::Reviewing, 2);
        let (state, effects) = finalize_with(state, Coverage::complete());
        assert_eq!(state.phase, Phase::Done);
        assert!(effects.contains(&Effect::ApplyPhase {
            from: Phase::Reviewing,
            to: Phase::Done,
            forced: true,
        }));
        assert!(effects.contains(&Effect::Completed));
    }

    #[test]
    fn productive_tool_resets_all_stall_counters() {
        let mut state = working_state(TaskFamily::Translate);
        state.consecutive.insert(Phase::Working, 2);
        state.consecutive.insert(Phase::Planning, 2);
        let (state, _) = step(state, SessionEvent::ProductiveToolUsed, &policy());
        assert_eq!(state.consecutive_in(Phase::Working), 0);
        assert_eq!(state.consecutive_in(Phase::Planning), 0);
    }

    #[test]
    fn unproductive_tool_turn_counts_toward_stall() {
        let state = working_state(TaskFamily::Translate);
        let (state, _) = step(
            state,
            SessionEvent::ToolTurnEnded {
                productive: false,
                coverage: Coverage::complete(),
            },
            &policy(),
        );
        assert_eq!(state.consecutive_in(Phase::Working), 1);
        let (state, _) = step(
            state,
            SessionEvent::ToolTurnEnded {
                productive: true,
                coverage: Coverage::complete(),
            },
            &policy(),
        );
        assert_eq!(state.consecutive_in(Phase::Working), 1);
    }

    #[test]
    fn pending_phase_applies_when_a_tool_turn_ends() {
        let state = SessionState::new(TaskFamily::Translate);
        let (state, _) = step(
            state,
            SessionEvent::PhaseRequested(Phase::Working),
            &policy(),
        );
        let (state, effects) = step(
            state,
            SessionEvent::ToolTurnEnded {
                productive: false,
                coverage: Coverage::complete(),
            },
            &policy(),
        );
        assert_eq!(state.phase, Phase::Working);
        assert!(effects.contains(&Effect::ApplyPhase {
            from: Phase::Planning,
            to: Phase::Working,
            forced: false,
        }));
        // the transition itself counts as progress
        assert_eq!(state.consecutive_in(Phase::Planning), 0);
    }

    #[test]
    fn done_request_is_refused_while_items_are_missing() {
        let mut state = working_state(TaskFamily::Translate);
        state.phase = Phase::Reviewing;
        state.pending_phase = Some(Phase::Done);
        let (state, effects) = step(
            state,
            SessionEvent::ToolTurnEnded {
                productive: false,
                coverage: incomplete(&["p4"]),
            },
            &policy(),
        );
        assert_eq!(state.phase, Phase::Reviewing);
        assert!(effects.contains(&Effect::NudgeContinue {
            missing: vec!["p4".into()],
        }));
        // a finalize with the same gap forces the session back to working
        let mut state = state;
        state.pending_phase = Some(Phase::Done);
        let (state, effects) = finalize_with(state, incomplete(&["p4"]));
        assert_eq!(state.phase, Phase::Working);
        assert!(effects.contains(&Effect::ApplyPhase {
            from: Phase::Reviewing,
            to: Phase::Working,
            forced: true,
        }));
    }

    #[test]
    fn turn_ceiling_raises_liveness_with_current_phase() {
        let mut state = working_state(TaskFamily::Translate);
        state.turns = 10;
        let (_, effects) = step(state, SessionEvent::TurnStarted, &policy());
        assert!(effects.contains(&Effect::LivenessExceeded {
            limit: 10,
            phase: Phase::Working,
        }));
    }

    #[test]
    fn done_finalize_reports_completed() {
        let mut state = working_state(TaskFamily::Translate);
        state.phase = Phase::Done;
        let (_, effects) = finalize_with(state, Coverage::complete());
        assert_eq!(effects, vec![Effect::Completed]);
    }

    #[test]
    fn advancing_to_done_reports_completed() {
        let mut state = working_state(TaskFamily::Summarize);
        state.pending_phase = Some(Phase::Done);
        let (state, effects) = finalize_with(state, Coverage::complete());
        assert_eq!(state.phase, Phase::Done);
        assert!(effects.contains(&Effect::Completed));
    }
}
