//! Completeness checking: has the session produced content for every
//! expected item yet? Pure; the session never cares which discipline is
//! behind the trait.

use redraft_core::{TaskFamily, missing_ids};
use std::collections::BTreeMap;

/// Outcome of a completeness check. `missing_ids` is always a
/// subsequence of the expected ids in their original order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub complete: bool,
    pub missing_ids: Vec<String>,
}

impl Coverage {
    #[must_use]
    pub fn complete() -> Self {
        Self {
            complete: true,
            missing_ids: Vec::new(),
        }
    }
}

pub trait CompletenessVerifier {
    fn verify(&self, expected_ids: &[String], produced: &BTreeMap<String, String>) -> Coverage;
}

/// Every expected id must be covered before the session may close.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullCoverage;

impl CompletenessVerifier for FullCoverage {
    fn verify(&self, expected_ids: &[String], produced: &BTreeMap<String, String>) -> Coverage {
        let missing = missing_ids(expected_ids, produced);
        Coverage {
            complete: missing.is_empty(),
            missing_ids: missing,
        }
    }
}

/// For task families that only emit items that actually change
/// (proofread, summarize): any map, including an empty one, is complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangedOnly;

impl CompletenessVerifier for ChangedOnly {
    fn verify(&self, _expected_ids: &[String], _produced: &BTreeMap<String, String>) -> Coverage {
        Coverage::complete()
    }
}

/// The verifier a task family uses by default.
#[must_use]
pub fn verifier_for(family: TaskFamily) -> Box<dyn CompletenessVerifier + Send + Sync> {
    if family.requires_full_coverage() {
        Box::new(FullCoverage)
    } else {
        Box::new(ChangedOnly)
    }
}
