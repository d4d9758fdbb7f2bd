//! Confirms an action's effect from the post-action snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::form_state::{GoalId, GoalStatus};
use crate::planner::PlannedStep;
use crate::snapshot::{BrowserSnapshot, ElementRole};
use crate::types::{RawOutcome, normalize_label};

/// The visual signal that proves a step did what it was meant to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedEvidence {
    TextVisible { text: String },
    FieldValue { field: String, text: String },
    ElementFocused { label: String },
    ElementSelected { label: String },
    ModalClosed { label: String },
    /// Pixels differ from the snapshot with this fingerprint.
    ScreenChanged { from: u64 },
    AnyOf { options: Vec<ExpectedEvidence> },
    Nothing,
}

impl ExpectedEvidence {
    /// Re-anchor screen-change checks to a newer baseline before re-attempting a step.
    pub fn rebased(&self, fingerprint: u64) -> Self {
        match self {
            ExpectedEvidence::ScreenChanged { .. } => {
                ExpectedEvidence::ScreenChanged { from: fingerprint }
            }
            ExpectedEvidence::AnyOf { options } => ExpectedEvidence::AnyOf {
                options: options.iter().map(|o| o.rebased(fingerprint)).collect(),
            },
            other => other.clone(),
        }
    }

    /// The same evidence with pixel-change checks dropped, for gestures that move pixels
    /// themselves. `None` when nothing else would be left to confirm.
    pub fn ignoring_screen_change(&self) -> Option<Self> {
        match self {
            ExpectedEvidence::ScreenChanged { .. } => None,
            ExpectedEvidence::AnyOf { options } => {
                let kept: Vec<_> = options
                    .iter()
                    .filter_map(ExpectedEvidence::ignoring_screen_change)
                    .collect();
                (!kept.is_empty()).then_some(ExpectedEvidence::AnyOf { options: kept })
            }
            other => Some(other.clone()),
        }
    }

    pub fn is_observed_in(&self, snapshot: &BrowserSnapshot) -> bool {
        match self {
            ExpectedEvidence::TextVisible { text } => snapshot.shows_text(text),
            ExpectedEvidence::FieldValue { field, text } => {
                let wanted = normalize_label(text);
                // a reported value must match exactly; doubled or stale text is not the value
                match snapshot.find(field).and_then(|el| el.value.as_deref()) {
                    Some(value) => normalize_label(value) == wanted,
                    None => snapshot
                        .visible_text()
                        .iter()
                        .any(|t| normalize_label(t).contains(&wanted)),
                }
            }
            ExpectedEvidence::ElementFocused { label } => {
                snapshot.find(label).is_some_and(|el| el.focused)
            }
            ExpectedEvidence::ElementSelected { label } => {
                snapshot.find(label).is_some_and(|el| el.selected)
            }
            ExpectedEvidence::ModalClosed { label } => {
                snapshot.find_with_role(label, ElementRole::Modal).is_none()
            }
            ExpectedEvidence::ScreenChanged { from } => snapshot.fingerprint() != *from,
            ExpectedEvidence::AnyOf { options } => options.iter().any(|o| o.is_observed_in(snapshot)),
            ExpectedEvidence::Nothing => true,
        }
    }
}

impl fmt::Display for ExpectedEvidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedEvidence::TextVisible { text } => write!(f, "text '{}' visible", text),
            ExpectedEvidence::FieldValue { field, text } => {
                write!(f, "field '{}' showing '{}'", field, text)
            }
            ExpectedEvidence::ElementFocused { label } => write!(f, "'{}' focused", label),
            ExpectedEvidence::ElementSelected { label } => write!(f, "'{}' selected", label),
            ExpectedEvidence::ModalClosed { label } => write!(f, "'{}' dialog closed", label),
            ExpectedEvidence::ScreenChanged { .. } => write!(f, "screen re-rendered"),
            ExpectedEvidence::AnyOf { options } => {
                let parts: Vec<String> = options.iter().map(|o| o.to_string()).collect();
                write!(f, "{}", parts.join(" or "))
            }
            ExpectedEvidence::Nothing => write!(f, "nothing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The driver refused or could not perform the primitive.
    ExecutionFailure,
    /// The primitive ran but the expected evidence never showed.
    VerificationMismatch,
}

/// A status change for one goal. Only the verifier can mint one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDelta {
    goal: GoalId,
    status: GoalStatus,
}

impl FormDelta {
    fn satisfied(goal: GoalId) -> Self {
        Self {
            goal,
            status: GoalStatus::Satisfied,
        }
    }

    pub fn goal(&self) -> &GoalId {
        &self.goal
    }

    pub fn status(&self) -> GoalStatus {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub expected: ExpectedEvidence,
    /// What was actually seen (or what the driver said), for audit and gap reports.
    pub observed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<FormDelta>,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// Result for a mandated pause; nothing to verify.
    pub fn paused(millis: u64) -> Self {
        Self {
            status: StepStatus::Success,
            failure: None,
            expected: ExpectedEvidence::Nothing,
            observed: format!("paused {}ms", millis),
            delta: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// Judge one executed step against the snapshot captured after it.
    pub fn judge(
        &self,
        planned: &PlannedStep,
        raw: &RawOutcome,
        after: &BrowserSnapshot,
    ) -> ActionResult {
        if !raw.performed {
            return ActionResult {
                status: StepStatus::Failure,
                failure: Some(FailureKind::ExecutionFailure),
                expected: planned.expect.clone(),
                observed: raw.detail.clone(),
                delta: None,
            };
        }

        let seen = planned.expect.is_observed_in(after);
        debug!(
            goal = %planned.goal,
            step = %planned.step,
            evidence = %planned.expect,
            seen,
            snapshot = after.sequence(),
            "verified step"
        );

        if seen {
            ActionResult {
                status: StepStatus::Success,
                failure: None,
                expected: planned.expect.clone(),
                observed: format!("{} in snapshot #{}", planned.expect, after.sequence()),
                delta: planned
                    .completes_goal
                    .then(|| FormDelta::satisfied(planned.goal.clone())),
            }
        } else {
            ActionResult {
                status: StepStatus::Failure,
                failure: Some(FailureKind::VerificationMismatch),
                expected: planned.expect.clone(),
                observed: describe_absence(&planned.expect, after),
                delta: None,
            }
        }
    }
}

fn describe_absence(expect: &ExpectedEvidence, snapshot: &BrowserSnapshot) -> String {
    let detail = match expect {
        ExpectedEvidence::FieldValue { field, .. }
        | ExpectedEvidence::ElementFocused { label: field }
        | ExpectedEvidence::ElementSelected { label: field } => match snapshot.find(field) {
            Some(el) => format!(
                "'{}' found (focused={}, selected={}, value={:?})",
                el.label, el.focused, el.selected, el.value
            ),
            None => format!("'{}' not on screen", field),
        },
        ExpectedEvidence::ScreenChanged { .. } => "screen did not change".to_string(),
        ExpectedEvidence::ModalClosed { label } => format!("'{}' dialog still open", label),
        _ => format!("{} element(s) on screen", snapshot.elements().len()),
    };
    format!(
        "missing {} in snapshot #{}: {}",
        expect,
        snapshot.sequence(),
        detail
    )
}
