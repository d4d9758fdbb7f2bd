//! Append-only record of every step the session issued and how it turned out.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;

use crate::form_state::GoalId;
use crate::types::{ActionStep, StepKind};
use crate::verifier::ActionResult;

/// Why a step was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum StepOrigin {
    Planned,
    Retry { attempt: u32 },
    Recovery,
    Fallback { attempt: u32 },
    /// Mandated pause after a processing-likely action.
    Pause,
    /// Pause before re-snapshotting while the planner is blocked.
    Recheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub index: usize,
    pub step: ActionStep,
    pub result: ActionResult,
    pub goal: Option<GoalId>,
    pub origin: StepOrigin,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHistory {
    entries: Vec<HistoryEntry>,
}

impl AgentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry. The session loop is the only caller.
    pub(crate) fn record(
        &mut self,
        step: ActionStep,
        result: ActionResult,
        goal: Option<GoalId>,
        origin: StepOrigin,
    ) -> &HistoryEntry {
        let index = self.entries.len();
        self.entries.push(HistoryEntry {
            index,
            step,
            result,
            goal,
            origin,
            recorded_at: Utc::now(),
        });
        &self.entries[index]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn for_goal<'a>(
        &'a self,
        goal: &'a GoalId,
    ) -> impl DoubleEndedIterator<Item = &'a HistoryEntry> {
        self.entries
            .iter()
            .filter(move |e| e.goal.as_ref() == Some(goal))
    }

    /// Latest successful entry for `goal` that moved the goal forward. Pauses and scroll
    /// nudges never count as progress.
    pub fn last_confirmed<'a>(&'a self, goal: &'a GoalId) -> Option<&'a HistoryEntry> {
        self.for_goal(goal).rev().find(|e| {
            e.result.is_success() && !matches!(e.step.kind(), StepKind::Wait | StepKind::Scroll)
        })
    }

    /// Number of times `step` was issued for `goal`, in any origin.
    pub fn attempts_of(&self, goal: &GoalId, step: &ActionStep) -> usize {
        self.for_goal(goal).filter(|e| &e.step == step).count()
    }

    /// Audit dump as pretty JSON.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        serde_json::to_writer_pretty(file, &self.entries)?;
        Ok(())
    }
}
