//! Tool-call governance: a fixed allow-list plus per-tool call budgets,
//! independent of everything else in the loop. Rejections are phrased as
//! guidance for the model, never as terminal errors.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    Allow,
    Reject { reason: String },
}

impl ToolDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, ToolDecision::Allow)
    }
}

/// Per-session governor. The allow-list mirrors the set of tools offered
/// to the model this session; budgets default to unbounded.
/// Tools marked productive signal information-gathering progress; the
/// session resets its stall counters when one succeeds.
#[derive(Debug, Clone, Default)]
pub struct ToolGovernor {
    allowed: BTreeSet<String>,
    budgets: BTreeMap<String, u32>,
    productive: BTreeSet<String>,
    counts: BTreeMap<String, u32>,
}

impl ToolGovernor {
    #[must_use]
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Cap how many times `name` may be called this session.
    #[must_use]
    pub fn with_budget(mut self, name: &str, budget: u32) -> Self {
        self.set_budget(name, budget);
        self
    }

    /// Mark `name` as productive for stall-detection purposes.
    #[must_use]
    pub fn with_productive(mut self, name: &str) -> Self {
        self.mark_productive(name);
        self
    }

    /// Add a name to the allow-list.
    pub fn allow(&mut self, name: &str) {
        self.allowed.insert(name.to_string());
    }

    pub fn set_budget(&mut self, name: &str, budget: u32) {
        self.budgets.insert(name.to_string(), budget);
    }

    pub fn mark_productive(&mut self, name: &str) {
        self.productive.insert(name.to_string());
    }

    #[must_use]
    pub fn is_productive(&self, name: &str) -> bool {
        self.productive.contains(name)
    }

    /// Times `name` has been allowed so far.
    #[must_use]
    pub fn call_count(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    /// Decide one call. Allowed calls are counted against their budget;
    /// rejected calls are not.
    pub fn authorize(&mut self, name: &str) -> ToolDecision {
        if !self.allowed.contains(name) {
            return ToolDecision::Reject {
                reason: format!(
                    "Tool '{name}' is not available in this session. Use only the tools offered in this conversation."
                ),
            };
        }
        let used = self.call_count(name);
        if let Some(budget) = self.budgets.get(name).copied()
            && used >= budget
        {
            return ToolDecision::Reject {
                reason: format!(
                    "Tool '{name}' has reached its call limit ({budget}) for this session. Proceed with the information already gathered."
                ),
            };
        }
        self.counts.insert(name.to_string(), used + 1);
        ToolDecision::Allow
    }
}
