//! Mid-stream watchdog for a single model turn. Watches the raw
//! fragments for degenerate repetition and for phase announcements or
//! item content placed illegally, and reports a typed verdict the moment
//! a violation is seen so the in-flight request can be cancelled on that
//! same fragment.

use redraft_core::{OrchestratorConfig, Phase, TaskFamily, parse_item_marker, parse_phase_marker};

/// Longest substring period the repetition scan looks for.
const MAX_PERIOD: usize = 6;

/// Thresholds for the guard, normally derived from `OrchestratorConfig`.
#[derive(Debug, Clone, Copy)]
pub struct GuardPolicy {
    /// Degeneration threshold is `max(source_longest_run * run_factor, min_run)`.
    pub run_factor: usize,
    pub min_run: usize,
    /// Buffer growth (bytes) between full marker re-scans.
    pub check_increment: usize,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            run_factor: 4,
            min_run: 40,
            check_increment: 160,
        }
    }
}

impl GuardPolicy {
    #[must_use]
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            run_factor: cfg.guard_run_factor,
            min_run: cfg.guard_min_run,
            check_increment: cfg.guard_check_increment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    /// Pathological repetition far beyond anything in the source text.
    Degeneration { detail: String },
    /// A phase announcement the transition table forbids.
    IllegalPhaseAnnouncement {
        from: Phase,
        to: Phase,
        suggested: Phase,
    },
    /// Item content while the active phase forbids content emission.
    ContentOutsidePhase { phase: Phase },
}

impl GuardViolation {
    /// One-line description for events and corrective prompts.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            GuardViolation::Degeneration { detail } => detail.clone(),
            GuardViolation::IllegalPhaseAnnouncement {
                from,
                to,
                suggested,
            } => format!(
                "announced phase '{to}' while in '{from}'; the only legal next phase is '{suggested}'"
            ),
            GuardViolation::ContentOutsidePhase { phase } => {
                format!("item content emitted during the '{phase}' phase, which forbids content")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Continue,
    Abort(GuardViolation),
}

/// Per-turn guard state. Feed every content fragment through
/// [`StreamGuard::observe`]; once it returns `Abort` the turn is dead
/// and every further call returns the same verdict.
pub struct StreamGuard {
    family: TaskFamily,
    start_phase: Phase,
    buffer: String,
    scanned_len: usize,
    threshold: usize,
    check_increment: usize,
    last_char: Option<char>,
    run_len: usize,
    violation: Option<GuardViolation>,
}

impl StreamGuard {
    /// `source_text` is the chunk's own text; its longest run anchors the
    /// degeneration threshold so source material that legitimately
    /// repeats (dashes, ellipses) does not trip the guard when echoed.
    #[must_use]
    pub fn new(
        family: TaskFamily,
        start_phase: Phase,
        source_text: &str,
        policy: GuardPolicy,
    ) -> Self {
        let source_run = longest_char_run(source_text);
        let threshold = (source_run.saturating_mul(policy.run_factor)).max(policy.min_run);
        Self {
            family,
            start_phase,
            buffer: String::new(),
            scanned_len: 0,
            threshold,
            check_increment: policy.check_increment.max(1),
            last_char: None,
            run_len: 0,
            violation: None,
        }
    }

    #[must_use]
    pub fn violation(&self) -> Option<&GuardViolation> {
        self.violation.as_ref()
    }

    pub fn take_violation(&mut self) -> Option<GuardViolation> {
        self.violation.take()
    }

    /// Consume one stream fragment. Character-run degeneration is checked
    /// on every character; the substring-repetition and marker scans run
    /// whenever the buffer has grown by at least the check increment.
    pub fn observe(&mut self, fragment: &str) -> GuardVerdict {
        if let Some(v) = &self.violation {
            return GuardVerdict::Abort(v.clone());
        }

        for ch in fragment.chars() {
            if Some(ch) == self.last_char {
                self.run_len += 1;
            } else {
                self.last_char = Some(ch);
                self.run_len = 1;
            }
            if self.run_len > self.threshold {
                return self.abort(GuardViolation::Degeneration {
                    detail: format!(
                        "character {ch:?} repeated {} times (threshold {})",
                        self.run_len, self.threshold
                    ),
                });
            }
        }

        self.buffer.push_str(fragment);
        if self.buffer.len() - self.scanned_len < self.check_increment {
            return GuardVerdict::Continue;
        }
        let from = self.periodic_scan_start();
        self.scanned_len = self.buffer.len();

        if let Some((period, span)) = periodic_span(self.buffer.as_bytes(), from, self.threshold) {
            return self.abort(GuardViolation::Degeneration {
                detail: format!(
                    "substring of length {period} repeated over {span} characters (threshold {})",
                    self.threshold
                ),
            });
        }

        self.scan_markers()
    }

    /// Final scan once the turn's output is complete. Forces the marker
    /// and repetition checks regardless of how little the buffer grew
    /// since the last scan, and treats the trailing partial line as
    /// complete. Used for non-streaming responses and at end of stream.
    pub fn finish(&mut self) -> GuardVerdict {
        if let Some(v) = &self.violation {
            return GuardVerdict::Abort(v.clone());
        }
        if !self.buffer.is_empty() && !self.buffer.ends_with('\n') {
            self.buffer.push('\n');
        }
        let from = self.periodic_scan_start();
        self.scanned_len = self.buffer.len();
        if let Some((period, span)) = periodic_span(self.buffer.as_bytes(), from, self.threshold) {
            return self.abort(GuardViolation::Degeneration {
                detail: format!(
                    "substring of length {period} repeated over {span} characters (threshold {})",
                    self.threshold
                ),
            });
        }
        self.scan_markers()
    }

    /// The periodic scan re-reads enough already-scanned bytes that a
    /// run straddling the previous scan boundary is still seen whole.
    fn periodic_scan_start(&self) -> usize {
        self.scanned_len.saturating_sub(self.threshold + MAX_PERIOD)
    }

    fn abort(&mut self, violation: GuardViolation) -> GuardVerdict {
        self.violation = Some(violation.clone());
        GuardVerdict::Abort(violation)
    }

    /// Re-scan the whole buffer for phase and item markers. Transitions
    /// are validated in stream order starting from the phase the turn
    /// began in; item markers are checked against the phase active at
    /// their position. Only complete lines are considered so a partial
    /// marker at the buffer tail is never misread.
    fn scan_markers(&mut self) -> GuardVerdict {
        let Some(pos) = self.buffer.rfind('\n') else {
            return GuardVerdict::Continue;
        };
        let mut active = self.start_phase;
        let mut found: Option<GuardViolation> = None;
        for line in self.buffer[..pos].lines() {
            if let Some(announced) = parse_phase_marker(line) {
                if !self.family.is_legal(active, announced) {
                    found = Some(GuardViolation::IllegalPhaseAnnouncement {
                        from: active,
                        to: announced,
                        suggested: self.family.suggested_next(active),
                    });
                    break;
                }
                active = announced;
            } else if parse_item_marker(line).is_some() && !active.allows_content() {
                found = Some(GuardViolation::ContentOutsidePhase { phase: active });
                break;
            }
        }
        match found {
            Some(violation) => self.abort(violation),
            None => GuardVerdict::Continue,
        }
    }
}

/// Longest run of one repeated character, in characters.
#[must_use]
pub fn longest_char_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut last: Option<char> = None;
    for ch in text.chars() {
        if Some(ch) == last {
            current += 1;
        } else {
            last = Some(ch);
            current = 1;
        }
        longest = longest.max(current);
    }
    longest
}

/// Longest span anywhere in `bytes[start..]` that repeats with some
/// period in `2..=MAX_PERIOD`. Returns `(period, span_bytes)` for the
/// first period whose span exceeds `threshold` bytes; a run that ended
/// mid-window counts the same as one still going at the tail.
/// Single-character runs are the caller's concern (period 1 is handled
/// incrementally).
fn periodic_span(bytes: &[u8], start: usize, threshold: usize) -> Option<(usize, usize)> {
    let len = bytes.len();
    for period in 2..=MAX_PERIOD {
        if len.saturating_sub(start) < period * 2 {
            break;
        }
        let mut matched = 0;
        let mut best = 0;
        for i in start + period..len {
            if bytes[i] == bytes[i - period] {
                matched += 1;
                best = best.max(matched);
            } else {
                matched = 0;
            }
        }
        let span = best + period;
        if best >= period && span > threshold {
            return Some((period, span));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_policy() -> GuardPolicy {
        // scan on nearly every fragment so tests exercise detection
        // latency, not batching
        GuardPolicy {
            run_factor: 4,
            min_run: 20,
            check_increment: 1,
        }
    }

    fn guard(start: Phase) -> StreamGuard {
        StreamGuard::new(TaskFamily::Translate, start, "short source text", tight_policy())
    }

    #[test]
    fn repeated_character_beyond_threshold_aborts_mid_fragment() {
        let mut g = guard(Phase::Working);
        assert_eq!(g.observe("a normal opening "), GuardVerdict::Continue);
        let verdict = g.observe(&"z".repeat(40));
        let GuardVerdict::Abort(GuardViolation::Degeneration { detail }) = verdict else {
            panic!("expected degeneration abort");
        };
        assert!(detail.contains("repeated"));
        assert!(g.violation().is_some());
    }

    #[test]
    fn source_runs_raise_the_threshold() {
        let source = format!("heading {} rest", "=".repeat(30));
        let mut g = StreamGuard::new(TaskFamily::Translate, Phase::Working, &source, tight_policy());
        // 30 * 4 = 120 threshold; 100 '=' must pass, 130 must not
        assert_eq!(g.observe(&"=".repeat(100)), GuardVerdict::Continue);
        let mut g = StreamGuard::new(TaskFamily::Translate, Phase::Working, &source, tight_policy());
        assert!(matches!(
            g.observe(&"=".repeat(130)),
            GuardVerdict::Abort(GuardViolation::Degeneration { .. })
        ));
    }

    #[test]
    fn short_substring_repetition_is_degenerate_too() {
        let mut g = guard(Phase::Working);
        let verdict = g.observe(&"ab".repeat(30));
        assert!(matches!(
            verdict,
            GuardVerdict::Abort(GuardViolation::Degeneration { .. })
        ));
    }

    #[test]
    fn periodic_run_followed_by_prose_is_still_caught() {
        let policy = GuardPolicy {
            run_factor: 4,
            min_run: 40,
            check_increment: 160,
        };
        let mut g =
            StreamGuard::new(TaskFamily::Translate, Phase::Working, "short source text", policy);
        // 102 chars of period-3 junk, too little on its own to trigger a scan
        assert_eq!(g.observe(&"no ".repeat(34)), GuardVerdict::Continue);
        let verdict = g.observe(
            "and then the reply settles back into ordinary prose, long enough that the next scan runs.\n",
        );
        assert!(matches!(
            verdict,
            GuardVerdict::Abort(GuardViolation::Degeneration { .. })
        ));
    }

    #[test]
    fn finish_catches_a_periodic_run_buried_before_the_tail() {
        let policy = GuardPolicy {
            run_factor: 4,
            min_run: 40,
            check_increment: 500,
        };
        let mut g = StreamGuard::new(TaskFamily::Translate, Phase::Working, "src", policy);
        let text = format!("{}and a normal closing line.\n", "no ".repeat(34));
        assert_eq!(g.observe(&text), GuardVerdict::Continue);
        assert!(matches!(
            g.finish(),
            GuardVerdict::Abort(GuardViolation::Degeneration { .. })
        ));
    }

    #[test]
    fn legal_phase_announcements_pass_in_stream_order() {
        let mut g = guard(Phase::Planning);
        assert_eq!(
            g.observe("@@phase working\n@@item p1\ncontent\n"),
            GuardVerdict::Continue
        );
    }

    #[test]
    fn illegal_phase_announcement_names_the_legal_next() {
        let mut g = guard(Phase::Planning);
        let verdict = g.observe("@@phase reviewing\n");
        let GuardVerdict::Abort(GuardViolation::IllegalPhaseAnnouncement {
            from,
            to,
            suggested,
        }) = verdict
        else {
            panic!("expected illegal announcement abort");
        };
        assert_eq!(from, Phase::Planning);
        assert_eq!(to, Phase::Reviewing);
        assert_eq!(suggested, Phase::Working);
    }

    #[test]
    fn content_during_planning_aborts() {
        let mut g = guard(Phase::Planning);
        let verdict = g.observe("@@item p7\nsome early content\n");
        assert!(matches!(
            verdict,
            GuardVerdict::Abort(GuardViolation::ContentOutsidePhase {
                phase: Phase::Planning
            })
        ));
    }

    #[test]
    fn content_is_judged_by_the_phase_active_at_its_position() {
        // announcement earlier in the same stream makes the content legal
        let mut g = guard(Phase::Planning);
        assert_eq!(g.observe("@@phase working\n"), GuardVerdict::Continue);
        assert_eq!(g.observe("@@item p1\ntranslated text\n"), GuardVerdict::Continue);
    }

    #[test]
    fn partial_marker_line_at_buffer_tail_is_not_misread() {
        let mut g = guard(Phase::Planning);
        // no trailing newline yet; could still become "@@item-list" prose
        assert_eq!(g.observe("@@item p1"), GuardVerdict::Continue);
        // completing the line makes it a real marker in planning
        assert!(matches!(
            g.observe("\n"),
            GuardVerdict::Abort(GuardViolation::ContentOutsidePhase { .. })
        ));
    }

    #[test]
    fn verdict_is_sticky_after_abort() {
        let mut g = guard(Phase::Planning);
        let first = g.observe("@@phase done\n");
        assert!(matches!(first, GuardVerdict::Abort(_)));
        let second = g.observe("harmless text");
        assert_eq!(first, second);
    }

    #[test]
    fn finish_scans_the_unterminated_tail() {
        let policy = GuardPolicy {
            run_factor: 4,
            min_run: 20,
            check_increment: 500,
        };
        let mut g = StreamGuard::new(TaskFamily::Translate, Phase::Planning, "src", policy);
        assert_eq!(g.observe("@@item p3"), GuardVerdict::Continue);
        assert!(matches!(
            g.finish(),
            GuardVerdict::Abort(GuardViolation::ContentOutsidePhase { .. })
        ));
    }

    #[test]
    fn marker_scan_waits_for_the_check_increment() {
        let policy = GuardPolicy {
            run_factor: 4,
            min_run: 20,
            check_increment: 500,
        };
        let mut g = StreamGuard::new(TaskFamily::Translate, Phase::Planning, "src", policy);
        // illegal marker sits in the buffer but the scan has not run yet
        assert_eq!(g.observe("@@phase done\n"), GuardVerdict::Continue);
        // growth past the increment forces the scan and the abort
        let filler: String = (0..200).map(|i| format!("{i} ")).collect::<String>() + "\n";
        assert!(matches!(
            g.observe(&filler),
            GuardVerdict::Abort(GuardViolation::IllegalPhaseAnnouncement { .. })
        ));
    }
}
