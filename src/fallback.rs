//! Escalation to the secondary action model once the primary vocabulary is exhausted.
//!
//! A fallback is one gesture per dispatch, click, scroll or key press only. Text entry is
//! not expressible here: typing always goes back through the primary `InputText` path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::driver::SecondaryActionModel;
use crate::planner::PlannedStep;
use crate::types::{ActionStep, RawOutcome, StepKind, Target};
use crate::verifier::ExpectedEvidence;

/// The single gesture the secondary model is allowed to choose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gesture", rename_all = "snake_case")]
pub enum FallbackPlan {
    Click { target: String },
    Scroll { target: String, delta_y: i32 },
    KeyPress { keys: String },
    /// Click the target if it can be seen, otherwise scroll it into view.
    ClickOrScroll { target: String },
}

/// Wire record handed to the secondary model. Field names are part of its contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPayload {
    pub description: String,
    pub expected_visual_evidence: ExpectedEvidence,
    pub max_retries: u32,
    pub fallback_plan: FallbackPlan,
}

/// What an escalation has to achieve, before it is bound to a retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackIntent {
    pub description: String,
    pub plan: FallbackPlan,
    pub expect: ExpectedEvidence,
    pub completes_goal: bool,
    /// Where the primary step was aimed, if it had a located target.
    pub anchor: Option<Target>,
}

impl FallbackIntent {
    /// Intent for a step whose retries and recovery gesture are spent.
    pub fn for_exhausted(planned: &PlannedStep) -> Option<Self> {
        let anchor = planned.step.target().cloned();
        let label = planned
            .step
            .target_label()
            .map(str::to_string)
            .unwrap_or_else(|| "focused element".to_string());

        let intent = match &planned.step {
            ActionStep::Click { .. } => Self {
                description: format!("Click '{}'", label),
                plan: FallbackPlan::ClickOrScroll { target: label },
                expect: planned.expect.clone(),
                completes_goal: planned.completes_goal,
                anchor,
            },
            ActionStep::InputText { .. } => Self {
                description: format!("Click the '{}' input so it takes keyboard focus", label),
                expect: ExpectedEvidence::ElementFocused {
                    label: label.clone(),
                },
                plan: FallbackPlan::Click { target: label },
                // the text itself is re-entered through InputText once focus is confirmed
                completes_goal: false,
                anchor,
            },
            ActionStep::SendKeys { keys, .. } => Self {
                description: format!("Press {}", keys),
                plan: FallbackPlan::KeyPress { keys: keys.clone() },
                expect: planned.expect.clone(),
                completes_goal: planned.completes_goal,
                anchor,
            },
            ActionStep::Scroll { delta_y, .. } => Self {
                description: format!("Scroll {} by {}px", if *delta_y < 0 { "up" } else { "down" }, delta_y.abs()),
                plan: FallbackPlan::Scroll {
                    target: label,
                    delta_y: *delta_y,
                },
                expect: planned.expect.clone(),
                completes_goal: planned.completes_goal,
                anchor,
            },
            ActionStep::Wait { .. } => return None,
        };
        Some(intent)
    }
}

pub struct FallbackDispatcher {
    model: Arc<dyn SecondaryActionModel>,
    max_retries: u32,
}

impl FallbackDispatcher {
    pub fn new(model: Arc<dyn SecondaryActionModel>, max_retries: u32) -> Self {
        Self { model, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn payload(&self, intent: &FallbackIntent) -> FallbackPayload {
        FallbackPayload {
            description: intent.description.clone(),
            expected_visual_evidence: intent.expect.clone(),
            max_retries: self.max_retries,
            fallback_plan: intent.plan.clone(),
        }
    }

    /// One invocation of the secondary model. Never types.
    pub async fn dispatch(&self, payload: &FallbackPayload) -> RawOutcome {
        info!(
            description = %payload.description,
            plan = ?payload.fallback_plan,
            "dispatching fallback gesture"
        );
        let outcome = match self.model.dispatch(payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "secondary model failed");
                return RawOutcome::rejected(format!("secondary model error: {:#}", e));
            }
        };

        if outcome
            .gesture
            .as_ref()
            .is_some_and(|g| g.kind() == StepKind::InputText)
        {
            warn!("secondary model attempted text entry, refusing its outcome");
            return RawOutcome::rejected(
                "secondary model attempted text entry; typing only runs through InputText",
            );
        }
        outcome
    }

    /// The primitive to record for a fallback attempt: what the model reports it did, or the
    /// plan's gesture aimed at the original anchor.
    pub fn gesture_of(&self, intent: &FallbackIntent, outcome: &RawOutcome) -> ActionStep {
        if let Some(gesture) = &outcome.gesture {
            return gesture.clone();
        }
        let anchor = intent.anchor.clone().unwrap_or(Target::Viewport);
        match &intent.plan {
            FallbackPlan::KeyPress { keys } => ActionStep::SendKeys {
                target: Target::Focused,
                keys: keys.clone(),
            },
            FallbackPlan::Scroll { delta_y, .. } => ActionStep::Scroll {
                target: anchor,
                delta_y: *delta_y,
            },
            FallbackPlan::Click { .. } | FallbackPlan::ClickOrScroll { .. } => {
                ActionStep::Click { target: anchor }
            }
        }
    }
}
