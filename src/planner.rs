//! Chooses the next atomic step from the request, tracked goals, history and the latest
//! snapshot. Pure: no I/O, no hidden memory; the session loop applies whatever it returns.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fallback::{FallbackIntent, FallbackPlan};
use crate::form_state::{FormState, GoalId};
use crate::history::AgentHistory;
use crate::request::{Instruction, ScrollDirection, UserRequest};
use crate::snapshot::{BrowserSnapshot, ElementDescriptor, ElementRole};
use crate::types::{ActionStep, StepKind, Target, normalize_label};
use crate::verifier::ExpectedEvidence;

const SELECT_ALL: &str = "Control+a";

const DISMISS_LABELS: &[&str] = &["close", "x", "×", "cancel", "dismiss", "ok", "done", "got it"];

/// A step together with the goal it serves and the evidence that will confirm it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub goal: GoalId,
    pub step: ActionStep,
    pub expect: ExpectedEvidence,
    /// Whether confirming this step satisfies `goal` (last phase of its instruction).
    pub completes_goal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// The snapshot does not show what is needed to pick a target.
    MissingEvidence,
    /// The instruction has no expression in the primitive vocabulary.
    Unexpressible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocked {
    pub goal: GoalId,
    pub kind: BlockKind,
    pub detail: String,
    /// What a fallback would have to achieve if this never clears.
    pub intent: FallbackIntent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    NextAction(PlannedStep),
    Complete,
    Blocked(Blocked),
}

impl fmt::Display for PlanDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanDecision::NextAction(p) => write!(f, "next {} for {}", p.step, p.goal),
            PlanDecision::Complete => write!(f, "complete"),
            PlanDecision::Blocked(b) => write!(f, "blocked on {}: {}", b.goal, b.detail),
        }
    }
}

/// Decide the next move. Goals already satisfied are skipped outright; goals are worked in
/// request order and only one step is ever proposed.
pub fn plan(
    request: &UserRequest,
    form: &FormState,
    history: &AgentHistory,
    snapshot: &BrowserSnapshot,
) -> PlanDecision {
    for (instruction, goal) in request.instructions().iter().zip(request.goals()) {
        if form.is_satisfied(&goal) {
            continue;
        }
        return plan_instruction(goal, instruction, history, snapshot);
    }
    PlanDecision::Complete
}

fn plan_instruction(
    goal: GoalId,
    instruction: &Instruction,
    history: &AgentHistory,
    snapshot: &BrowserSnapshot,
) -> PlanDecision {
    let changed = ExpectedEvidence::ScreenChanged {
        from: snapshot.fingerprint(),
    };
    let last_click = history
        .last_confirmed(&goal)
        .filter(|e| e.step.kind() == StepKind::Click)
        .and_then(|e| e.step.target().cloned());

    match instruction {
        Instruction::Fill { field, text } => {
            // typing goes to whatever the confirmed focus click landed on
            let focus = history
                .for_goal(&goal)
                .rev()
                .find(|e| e.result.is_success() && e.step.kind() == StepKind::Click)
                .and_then(|e| e.step.target().cloned());
            let cleared = history
                .last_confirmed(&goal)
                .is_some_and(|e| e.step.kind() == StepKind::SendKeys);
            if let Some(target) = focus.filter(|_| last_click.is_some() || cleared) {
                let stale = snapshot
                    .find(field)
                    .and_then(|el| el.value.as_deref())
                    .is_some_and(|v| !v.trim().is_empty());
                if stale && !cleared {
                    // select the old content so typing replaces it
                    return next(
                        goal,
                        ActionStep::SendKeys {
                            target: Target::Focused,
                            keys: SELECT_ALL.to_string(),
                        },
                        changed,
                        false,
                    );
                }
                return next(
                    goal,
                    ActionStep::InputText {
                        target,
                        text: text.clone(),
                    },
                    ExpectedEvidence::FieldValue {
                        field: field.clone(),
                        text: text.clone(),
                    },
                    true,
                );
            }
            match snapshot.find(field) {
                Some(el) => next(
                    goal,
                    ActionStep::Click {
                        target: target_of(el),
                    },
                    ExpectedEvidence::AnyOf {
                        options: vec![
                            ExpectedEvidence::ElementFocused {
                                label: el.label.clone(),
                            },
                            changed,
                        ],
                    },
                    false,
                ),
                None => missing(
                    goal,
                    field,
                    FallbackIntent {
                        description: format!("Click the '{}' input so it takes keyboard focus", field),
                        plan: FallbackPlan::ClickOrScroll {
                            target: field.clone(),
                        },
                        expect: ExpectedEvidence::ElementFocused {
                            label: field.clone(),
                        },
                        completes_goal: false,
                        anchor: None,
                    },
                ),
            }
        }

        Instruction::Select { dropdown, option } => {
            let opened = last_click.is_some();
            let (label, expect, completes) = if opened {
                (
                    option,
                    ExpectedEvidence::AnyOf {
                        options: vec![
                            ExpectedEvidence::ElementSelected {
                                label: option.clone(),
                            },
                            ExpectedEvidence::FieldValue {
                                field: dropdown.clone(),
                                text: option.clone(),
                            },
                        ],
                    },
                    true,
                )
            } else {
                (
                    dropdown,
                    ExpectedEvidence::TextVisible {
                        text: option.clone(),
                    },
                    false,
                )
            };
            let found = if opened {
                snapshot
                    .find_with_role(option, ElementRole::Option)
                    .or_else(|| snapshot.find(option))
            } else {
                snapshot
                    .find_with_role(dropdown, ElementRole::Dropdown)
                    .or_else(|| snapshot.find(dropdown))
            };
            match found {
                Some(el) => next(
                    goal,
                    ActionStep::Click {
                        target: target_of(el),
                    },
                    expect,
                    completes,
                ),
                None => missing(
                    goal,
                    label,
                    FallbackIntent {
                        description: format!("Click '{}' in the '{}' dropdown", label, dropdown),
                        plan: FallbackPlan::ClickOrScroll {
                            target: label.clone(),
                        },
                        expect,
                        completes_goal: completes,
                        anchor: None,
                    },
                ),
            }
        }

        Instruction::Click { target } => match snapshot.find(target) {
            Some(el) => {
                let expect = match el.role {
                    _ if dismisses_modal(el) => {
                        let modal = snapshot
                            .elements()
                            .iter()
                            .find(|m| m.role == ElementRole::Modal && m.bounds.contains(&el.bounds));
                        match modal {
                            Some(m) => ExpectedEvidence::ModalClosed {
                                label: m.label.clone(),
                            },
                            None => changed,
                        }
                    }
                    ElementRole::MenuItem | ElementRole::Tab | ElementRole::Option => {
                        ExpectedEvidence::AnyOf {
                            options: vec![
                                ExpectedEvidence::ElementSelected {
                                    label: el.label.clone(),
                                },
                                changed,
                            ],
                        }
                    }
                    _ => changed,
                };
                next(
                    goal,
                    ActionStep::Click {
                        target: target_of(el),
                    },
                    expect,
                    true,
                )
            }
            None => missing(
                goal,
                target,
                FallbackIntent {
                    description: format!("Click '{}'", target),
                    plan: FallbackPlan::ClickOrScroll {
                        target: target.clone(),
                    },
                    expect: changed,
                    completes_goal: true,
                    anchor: None,
                },
            ),
        },

        Instruction::Press { keys } => next(
            goal,
            ActionStep::SendKeys {
                target: Target::Focused,
                keys: keys.clone(),
            },
            changed,
            true,
        ),

        Instruction::Scroll {
            direction,
            amount,
            target,
        } => {
            let delta_y = match direction {
                ScrollDirection::Down => amount.abs(),
                ScrollDirection::Up => -amount.abs(),
            };
            let expect = match target {
                Some(text) => ExpectedEvidence::TextVisible { text: text.clone() },
                None => changed,
            };
            next(
                goal,
                ActionStep::Scroll {
                    target: Target::Viewport,
                    delta_y,
                },
                expect,
                true,
            )
        }

        Instruction::Wait { seconds } => next(
            goal,
            ActionStep::Wait {
                millis: seconds.saturating_mul(1000),
            },
            ExpectedEvidence::Nothing,
            true,
        ),

        Instruction::Freeform { text } => PlanDecision::Blocked(Blocked {
            goal,
            kind: BlockKind::Unexpressible,
            detail: format!("'{}' has no primitive action", text),
            intent: FallbackIntent {
                description: text.clone(),
                plan: FallbackPlan::ClickOrScroll {
                    target: text.clone(),
                },
                expect: changed,
                completes_goal: true,
                anchor: None,
            },
        }),
    }
}

/// Caption of a control that closes the dialog it sits in.
fn dismisses_modal(el: &ElementDescriptor) -> bool {
    matches!(el.role, ElementRole::Button | ElementRole::Other | ElementRole::Link)
        && DISMISS_LABELS.contains(&normalize_label(&el.label).as_str())
}

fn target_of(el: &ElementDescriptor) -> Target {
    let (x, y) = el.bounds.center();
    Target::element(el.label.clone(), x, y)
}

fn next(goal: GoalId, step: ActionStep, expect: ExpectedEvidence, completes_goal: bool) -> PlanDecision {
    PlanDecision::NextAction(PlannedStep {
        goal,
        step,
        expect,
        completes_goal,
    })
}

fn missing(goal: GoalId, label: &str, intent: FallbackIntent) -> PlanDecision {
    PlanDecision::Blocked(Blocked {
        goal,
        kind: BlockKind::MissingEvidence,
        detail: format!("no visible element matching '{}'", label),
        intent,
    })
}
