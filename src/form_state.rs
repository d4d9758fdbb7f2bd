//! Tracked goal status; the only source of truth for "already done".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::request::UserRequest;
use crate::types::normalize_label;
use crate::verifier::FormDelta;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(String);

impl GoalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Goal for filling the named field, independent of where it appears in the request.
    pub fn field(name: &str) -> Self {
        Self(format!("field:{}", normalize_label(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalStatus {
    Unsatisfied,
    Satisfied,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormState {
    goals: BTreeMap<GoalId, GoalStatus>,
}

impl FormState {
    /// Every goal of `request`, all unsatisfied.
    pub fn for_request(request: &UserRequest) -> Self {
        Self {
            goals: request
                .goals()
                .map(|goal| (goal, GoalStatus::Unsatisfied))
                .collect(),
        }
    }

    /// Rebuild state a host persisted from an earlier run, layered over `request`'s goals.
    pub fn restore(
        request: &UserRequest,
        saved: impl IntoIterator<Item = (GoalId, GoalStatus)>,
    ) -> Self {
        let mut state = Self::for_request(request);
        state.goals.extend(saved);
        state
    }

    pub fn status(&self, goal: &GoalId) -> GoalStatus {
        self.goals
            .get(goal)
            .copied()
            .unwrap_or(GoalStatus::Unsatisfied)
    }

    pub fn is_satisfied(&self, goal: &GoalId) -> bool {
        self.status(goal) == GoalStatus::Satisfied
    }

    pub fn satisfied(&self) -> impl Iterator<Item = &GoalId> {
        self.goals
            .iter()
            .filter(|(_, s)| **s == GoalStatus::Satisfied)
            .map(|(g, _)| g)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&GoalId, GoalStatus)> {
        self.goals.iter().map(|(g, s)| (g, *s))
    }

    /// Apply a delta the verifier licensed. Only the session loop calls this.
    pub(crate) fn apply(&mut self, delta: &FormDelta) {
        self.goals.insert(delta.goal().clone(), delta.status());
    }
}
