//! Bounds re-attempts of a failing step and picks the recovery gesture once the bound is hit.

use crate::types::{ActionStep, Target};

/// Attempt counter for one pending step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
}

impl RetryState {
    /// Count one more execution of the step. Returns the attempt number (1-based).
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-issue the identical step as attempt `next_attempt`.
    RetryAgain { next_attempt: u32 },
    /// The bound is reached; hand off to recovery and fallback.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_attempts: u32,
    small_scroll_px: i32,
}

impl RetryController {
    pub fn new(max_attempts: u32, small_scroll_px: i32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            small_scroll_px,
        }
    }

    pub fn begin(&self) -> RetryState {
        RetryState {
            attempts: 0,
            max_attempts: self.max_attempts,
        }
    }

    /// Called after a failed attempt.
    pub fn on_failure(&self, state: &RetryState) -> RetryDecision {
        if state.attempts >= state.max_attempts {
            RetryDecision::Exhausted {
                attempts: state.attempts,
            }
        } else {
            RetryDecision::RetryAgain {
                next_attempt: state.attempts + 1,
            }
        }
    }

    /// The one recovery gesture tried between exhaustion and fallback: a retry click for
    /// clicks, a small scroll on the same target for everything else that has a target.
    pub fn recovery_for(&self, step: &ActionStep) -> Option<ActionStep> {
        match step {
            ActionStep::Click { .. } => Some(step.clone()),
            ActionStep::InputText { target, .. }
            | ActionStep::SendKeys { target, .. }
            | ActionStep::Scroll { target, .. } => {
                let target = match target {
                    Target::Focused => Target::Viewport,
                    other => other.clone(),
                };
                Some(ActionStep::Scroll {
                    target,
                    delta_y: self.small_scroll_px,
                })
            }
            ActionStep::Wait { .. } => None,
        }
    }
}
