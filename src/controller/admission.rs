//! Priority-based admission of node replacements
//!
//! Only one replacement may drain its node at a time. The decision is taken
//! from a fresh list of every replacement on each pass, so no lock is held
//! between reconciles.
//!
//! Two replacements can both pass the gate when they read the list at the
//! same moment. A replacement about to start therefore first claims
//! admission by setting its `Admitted` condition, lists again, and backs off
//! if it sees any rival claim ([`contender`]). Of two concurrent claimants at
//! least the later one sees the other, so at most one of them starts.

use std::cmp::Ordering;
use std::fmt;

use kube::ResourceExt;

use crate::crd::{ConditionStatus, NodeReplacement, ReplacementConditionType, ReplacementPhase};

pub const REPLACEMENT_IN_PROGRESS_REASON: &str = "ReplacementInProgress";
pub const HIGHER_PRIORITY_REASON: &str = "HigherPriority";
pub const ADMISSION_CONFLICT_REASON: &str = "AdmissionConflict";

/// Why a replacement may not proceed, naming the replacement in its way
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    InProgress(String),
    HigherPriority(String),
}

impl Blocker {
    /// Condition reason recorded for this kind of block
    pub fn reason(&self) -> &'static str {
        match self {
            Blocker::InProgress(_) => REPLACEMENT_IN_PROGRESS_REASON,
            Blocker::HigherPriority(_) => HIGHER_PRIORITY_REASON,
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::InProgress(name) => {
                write!(f, "NodeReplacement \"{}\" is already in-progress", name)
            }
            Blocker::HigherPriority(name) => {
                write!(f, "NodeReplacement \"{}\" has a higher priority", name)
            }
        }
    }
}

/// Order replacements by urgency: highest priority first, then by name
fn rank(a: &NodeReplacement, b: &NodeReplacement) -> Ordering {
    b.spec
        .priority
        .cmp(&a.spec.priority)
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

fn first_ranked<'a>(
    replacements: impl Iterator<Item = &'a NodeReplacement>,
) -> Option<&'a NodeReplacement> {
    replacements.min_by(|a, b| rank(a, b))
}

/// Find what keeps `candidate` from starting or continuing its drain.
///
/// `all` is the full set of replacements as just read from the cluster; the
/// candidate itself may be part of it.
pub fn blocker(candidate: &NodeReplacement, all: &[NodeReplacement]) -> Option<Blocker> {
    let phase = candidate.phase();
    if phase.is_terminal() {
        return None;
    }

    let name = candidate.name_any();
    let others: Vec<&NodeReplacement> = all
        .iter()
        .filter(|r| r.name_any() != name && !r.phase().is_terminal())
        .collect();

    let in_progress = others
        .iter()
        .copied()
        .filter(|r| r.phase() == ReplacementPhase::InProgress)
        // An in-progress candidate only yields to another in-progress one that outranks it
        .filter(|r| phase == ReplacementPhase::New || rank(r, candidate) == Ordering::Less);
    if let Some(other) = first_ranked(in_progress) {
        return Some(Blocker::InProgress(other.name_any()));
    }

    if phase == ReplacementPhase::New {
        let higher = others
            .iter()
            .copied()
            .filter(|r| r.spec.priority > candidate.spec.priority);
        if let Some(other) = first_ranked(higher) {
            return Some(Blocker::HigherPriority(other.name_any()));
        }
    }

    None
}

/// Decide whether `candidate` may start or keep draining its node.
///
/// Returns the decision and, when blocked, a human-readable reason naming
/// the blocker.
pub fn should_proceed(candidate: &NodeReplacement, all: &[NodeReplacement]) -> (bool, String) {
    match blocker(candidate, all) {
        Some(b) => (false, b.to_string()),
        None => (true, String::new()),
    }
}

fn holds_admission(replacement: &NodeReplacement) -> bool {
    replacement
        .status
        .as_ref()
        .and_then(|s| s.conditions.get(ReplacementConditionType::Admitted))
        .is_some_and(|c| c.status == ConditionStatus::True)
}

/// Find another live replacement that is in progress or has claimed admission.
///
/// Checked by a claimant right after writing its own claim. Any rival wins,
/// whatever its rank.
pub fn contender<'a>(
    candidate: &NodeReplacement,
    all: &'a [NodeReplacement],
) -> Option<&'a NodeReplacement> {
    let name = candidate.name_any();
    first_ranked(all.iter().filter(|r| {
        r.name_any() != name
            && !r.phase().is_terminal()
            && (r.phase() == ReplacementPhase::InProgress || holds_admission(r))
    }))
}
