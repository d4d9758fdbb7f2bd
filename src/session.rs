//! The loop driver. One step at a time: plan, execute, pause if the step is likely to kick
//! off processing, re-capture, verify, record. Failures go through the retry bound, one
//! recovery gesture and at most one fallback escalation per goal.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::driver::{Perceiver, ScreenDriver, SecondaryActionModel};
use crate::error::AgentError;
use crate::executor::ActionExecutor;
use crate::fallback::{FallbackDispatcher, FallbackIntent};
use crate::form_state::{FormState, GoalId};
use crate::history::{AgentHistory, StepOrigin};
use crate::planner::{self, BlockKind, Blocked, PlanDecision, PlannedStep};
use crate::request::UserRequest;
use crate::retry::{RetryController, RetryDecision};
use crate::snapshot::{BrowserSnapshot, SnapshotObserver};
use crate::types::{ActionStep, RawOutcome, StepKind};
use crate::verifier::{ActionResult, ExpectedEvidence, FailureKind, Verifier};
use crate::wait::WaitScheduler;

const EVENT_CAPACITY: usize = 64;
const CANCELLED: &str = "cancelled by caller";

/// What was expected and never seen when a session gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceGap {
    pub goal: Option<GoalId>,
    pub step: Option<ActionStep>,
    pub expected: ExpectedEvidence,
    pub observed: String,
    pub reason: String,
}

impl fmt::Display for EvidenceGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(goal) = &self.goal {
            write!(f, " [goal {}]", goal)?;
        }
        write!(f, ": expected {}, observed {}", self.expected, self.observed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Aborted(String),
    Failed(EvidenceGap),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => write!(f, "completed"),
            SessionOutcome::Aborted(reason) => write!(f, "aborted: {}", reason),
            SessionOutcome::Failed(gap) => write!(f, "failed: {}", gap),
        }
    }
}

/// Progress notifications for whoever hosts the session (the web UI forwards them as SSE).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Planning { cycle: u32 },
    Step {
        number: usize,
        description: String,
        origin: StepOrigin,
    },
    StepFailed { message: String },
    Waiting { millis: u64 },
    Blocked { detail: String },
    Fallback { description: String },
    Finished { outcome: SessionOutcome },
    /// Infrastructure failure (navigation, capture) that ended the session early.
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub history: AgentHistory,
    pub form_state: FormState,
}

/// How handling of one planner decision ended.
enum StepEnd {
    Continue,
    Aborted(String),
    Failed(EvidenceGap),
}

/// Mutable state of one session. Owned by the loop, lent read-only to the planner.
struct Run {
    history: AgentHistory,
    form: FormState,
    snapshot: BrowserSnapshot,
    escalated: HashSet<GoalId>,
    rechecks: HashMap<GoalId, u32>,
    steps: usize,
}

pub struct SessionHost {
    driver: Arc<dyn ScreenDriver>,
    observer: SnapshotObserver,
    executor: ActionExecutor,
    verifier: Verifier,
    retry: RetryController,
    scheduler: WaitScheduler,
    fallback: FallbackDispatcher,
    config: AgentConfig,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHost {
    pub fn new(
        driver: Arc<dyn ScreenDriver>,
        perceiver: Arc<dyn Perceiver>,
        secondary: Arc<dyn SecondaryActionModel>,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            observer: SnapshotObserver::new(driver.clone(), perceiver),
            executor: ActionExecutor::new(driver.clone()),
            verifier: Verifier::new(),
            retry: RetryController::new(config.max_attempts, config.small_scroll_px),
            scheduler: WaitScheduler::new(config.processing_pause, &config.processing_keywords),
            fallback: FallbackDispatcher::new(secondary, config.fallback_max_retries),
            driver,
            config,
            events,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Drive `request` from a fresh form state until it completes, is cancelled or fails.
    ///
    /// `Err` is reserved for infrastructure problems (navigation, screenshot capture);
    /// everything the loop can reason about ends up in [`SessionOutcome`].
    pub async fn run_session(
        &self,
        request: &UserRequest,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, AgentError> {
        self.resume_session(request, FormState::for_request(request), cancel)
            .await
    }

    /// Like [`run_session`](Self::run_session), starting from a form state the host restored.
    /// Goals already satisfied there are never acted on again.
    pub async fn resume_session(
        &self,
        request: &UserRequest,
        form_state: FormState,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, AgentError> {
        info!(
            request = %request.text(),
            instructions = request.instructions().len(),
            already_satisfied = form_state.satisfied().count(),
            "session starting"
        );

        let mut run = match self.start(request, form_state).await {
            Ok(run) => run,
            Err(e) => return Err(self.fail_infra(e)),
        };
        let outcome = match self.drive(request, &mut run, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail_infra(e)),
        };

        match &outcome {
            SessionOutcome::Completed => info!(steps = run.history.len(), "session completed"),
            SessionOutcome::Aborted(reason) => warn!(reason = %reason, "session aborted"),
            SessionOutcome::Failed(gap) => error!(gap = %gap, "session failed"),
        }
        self.emit(SessionEvent::Finished {
            outcome: outcome.clone(),
        });

        Ok(SessionReport {
            outcome,
            history: run.history,
            form_state: run.form,
        })
    }

    async fn start(&self, request: &UserRequest, form: FormState) -> Result<Run, AgentError> {
        if let Some(url) = request.start_url() {
            info!(url, "opening start page");
            self.driver
                .open(url)
                .await
                .map_err(|e| AgentError::Navigation {
                    url: url.to_string(),
                    detail: format!("{:#}", e),
                })?;
        }
        let snapshot = self.observer.capture().await?;
        Ok(Run {
            history: AgentHistory::new(),
            form,
            snapshot,
            escalated: HashSet::new(),
            rechecks: HashMap::new(),
            steps: 0,
        })
    }

    fn fail_infra(&self, e: AgentError) -> AgentError {
        error!(error = %e, "session stopped");
        self.emit(SessionEvent::Error {
            message: e.to_string(),
        });
        e
    }

    async fn drive(
        &self,
        request: &UserRequest,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome, AgentError> {
        let mut cycle = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(SessionOutcome::Aborted(CANCELLED.to_string()));
            }
            if cycle >= self.config.max_cycles {
                return Ok(SessionOutcome::Failed(EvidenceGap {
                    goal: None,
                    step: None,
                    expected: ExpectedEvidence::Nothing,
                    observed: format!("{} step(s) recorded", run.history.len()),
                    reason: format!("planning budget of {} cycles exhausted", self.config.max_cycles),
                }));
            }
            cycle += 1;
            self.emit(SessionEvent::Planning { cycle });

            let decision = planner::plan(request, &run.form, &run.history, &run.snapshot);
            debug!(cycle, decision = %decision, "planned");

            let end = match decision {
                PlanDecision::Complete => return Ok(SessionOutcome::Completed),
                PlanDecision::NextAction(planned) => self.attempt(run, planned, cancel).await?,
                PlanDecision::Blocked(blocked) => self.on_blocked(run, blocked, cancel).await?,
            };
            match end {
                StepEnd::Continue => {}
                StepEnd::Aborted(reason) => return Ok(SessionOutcome::Aborted(reason)),
                StepEnd::Failed(gap) => return Ok(SessionOutcome::Failed(gap)),
            }
        }
    }

    /// Run one planned step through the retry bound, the recovery gesture and, if still
    /// unconfirmed, the fallback.
    async fn attempt(
        &self,
        run: &mut Run,
        mut planned: PlannedStep,
        cancel: &CancellationToken,
    ) -> Result<StepEnd, AgentError> {
        let mut state = self.retry.begin();
        let mut last = loop {
            let attempt = state.record_attempt();
            let origin = if attempt == 1 {
                StepOrigin::Planned
            } else {
                StepOrigin::Retry { attempt }
            };
            let result = self.perform(run, &planned, origin).await?;
            if result.is_success() {
                return Ok(StepEnd::Continue);
            }

            match self.retry.on_failure(&state) {
                RetryDecision::RetryAgain { next_attempt } => {
                    if cancel.is_cancelled() {
                        return Ok(StepEnd::Aborted(CANCELLED.to_string()));
                    }
                    debug!(goal = %planned.goal, next_attempt, "retrying step");
                    planned.expect = planned.expect.rebased(run.snapshot.fingerprint());
                }
                RetryDecision::Exhausted { attempts } => {
                    let exhausted = AgentError::RetryExhausted {
                        step: planned.step.to_string(),
                        attempts,
                    };
                    warn!(goal = %planned.goal, "{}", exhausted);
                    break result;
                }
            }
        };

        if let Some(gesture) = self.retry.recovery_for(&planned.step) {
            if cancel.is_cancelled() {
                return Ok(StepEnd::Aborted(CANCELLED.to_string()));
            }
            // a nudge scroll moves pixels on its own, so it can't confirm a pixel change
            let expect = if gesture.kind() == StepKind::Click {
                Some(planned.expect.rebased(run.snapshot.fingerprint()))
            } else {
                planned.expect.ignoring_screen_change()
            };
            if let Some(expect) = expect {
                let recovery = PlannedStep {
                    goal: planned.goal.clone(),
                    step: gesture,
                    expect,
                    completes_goal: planned.completes_goal,
                };
                let result = self.perform(run, &recovery, StepOrigin::Recovery).await?;
                if result.is_success() {
                    return Ok(StepEnd::Continue);
                }
                last = result;
            }
        }

        if cancel.is_cancelled() {
            return Ok(StepEnd::Aborted(CANCELLED.to_string()));
        }
        match FallbackIntent::for_exhausted(&planned) {
            Some(intent) => {
                self.escalate(run, &planned.goal, intent, Some(planned.step.clone()), last.observed, cancel)
                    .await
            }
            None => {
                let err = AgentError::FallbackFailure(format!("no fallback gesture for {}", planned.step));
                Ok(StepEnd::Failed(EvidenceGap {
                    goal: Some(planned.goal.clone()),
                    step: Some(planned.step.clone()),
                    expected: planned.expect.clone(),
                    observed: last.observed,
                    reason: err.to_string(),
                }))
            }
        }
    }

    async fn on_blocked(
        &self,
        run: &mut Run,
        blocked: Blocked,
        cancel: &CancellationToken,
    ) -> Result<StepEnd, AgentError> {
        let reason = AgentError::PlanningBlocked(blocked.detail.clone());
        warn!(goal = %blocked.goal, kind = ?blocked.kind, "{}", reason);
        self.emit(SessionEvent::Blocked {
            detail: blocked.detail.clone(),
        });

        if blocked.kind == BlockKind::MissingEvidence {
            let rechecks = run.rechecks.entry(blocked.goal.clone()).or_insert(0);
            if *rechecks < self.config.max_blocked_rechecks {
                *rechecks += 1;
                let millis = millis_of(self.config.recheck_pause);
                self.emit(SessionEvent::Waiting { millis });
                let step = ActionStep::Wait { millis };
                self.executor.execute(&step).await;
                run.history.record(
                    step,
                    ActionResult::paused(millis),
                    Some(blocked.goal.clone()),
                    StepOrigin::Recheck,
                );
                run.snapshot = self.observer.capture().await?;
                return Ok(StepEnd::Continue);
            }
        }

        self.escalate(run, &blocked.goal, blocked.intent, None, blocked.detail, cancel)
            .await
    }

    /// Hand the goal to the secondary action model. Only once per goal per session.
    async fn escalate(
        &self,
        run: &mut Run,
        goal: &GoalId,
        intent: FallbackIntent,
        mut step: Option<ActionStep>,
        mut observed: String,
        cancel: &CancellationToken,
    ) -> Result<StepEnd, AgentError> {
        if !run.escalated.insert(goal.clone()) {
            let err = AgentError::FallbackFailure(format!("fallback for {} was already spent", goal));
            error!(goal = %goal, "{}", err);
            return Ok(StepEnd::Failed(EvidenceGap {
                goal: Some(goal.clone()),
                step,
                expected: intent.expect,
                observed,
                reason: err.to_string(),
            }));
        }

        info!(goal = %goal, description = %intent.description, "escalating to secondary action model");
        self.emit(SessionEvent::Fallback {
            description: intent.description.clone(),
        });

        let max_retries = self.fallback.max_retries();
        for attempt in 1..=max_retries {
            if cancel.is_cancelled() {
                return Ok(StepEnd::Aborted(CANCELLED.to_string()));
            }
            let mut payload = self.fallback.payload(&intent);
            payload.expected_visual_evidence = intent.expect.rebased(run.snapshot.fingerprint());

            let raw = self.fallback.dispatch(&payload).await;
            let planned = PlannedStep {
                goal: goal.clone(),
                step: self.fallback.gesture_of(&intent, &raw),
                expect: payload.expected_visual_evidence,
                completes_goal: intent.completes_goal,
            };
            let origin = StepOrigin::Fallback { attempt };
            self.announce(run, &planned, origin);
            let result = self.finish_step(run, &planned, raw, origin).await?;
            if result.is_success() {
                return Ok(StepEnd::Continue);
            }
            observed = result.observed;
            step = Some(planned.step);
        }

        let err = AgentError::FallbackFailure(format!(
            "'{}' not confirmed after {} attempt(s)",
            intent.description, max_retries
        ));
        error!(goal = %goal, "{}", err);
        Ok(StepEnd::Failed(EvidenceGap {
            goal: Some(goal.clone()),
            step,
            expected: intent.expect,
            observed,
            reason: err.to_string(),
        }))
    }

    async fn perform(
        &self,
        run: &mut Run,
        planned: &PlannedStep,
        origin: StepOrigin,
    ) -> Result<ActionResult, AgentError> {
        self.announce(run, planned, origin);
        let raw = self.executor.execute(&planned.step).await;
        self.finish_step(run, planned, raw, origin).await
    }

    fn announce(&self, run: &mut Run, planned: &PlannedStep, origin: StepOrigin) {
        run.steps += 1;
        info!(goal = %planned.goal, step = %planned.step, origin = ?origin, "step {}", run.steps);
        self.emit(SessionEvent::Step {
            number: run.steps,
            description: planned.step.to_string(),
            origin,
        });
    }

    /// Everything after the primitive ran: mandated pause, fresh snapshot, verdict, records.
    async fn finish_step(
        &self,
        run: &mut Run,
        planned: &PlannedStep,
        raw: RawOutcome,
        origin: StepOrigin,
    ) -> Result<ActionResult, AgentError> {
        let pause = millis_of(self.scheduler.pause_after(&planned.step, &planned.expect));
        if pause > 0 {
            debug!(millis = pause, "pausing for processing");
            self.emit(SessionEvent::Waiting { millis: pause });
            self.executor.execute(&ActionStep::Wait { millis: pause }).await;
        }

        run.snapshot = self.observer.capture().await?;
        let result = self.verifier.judge(planned, &raw, &run.snapshot);

        if let Some(delta) = &result.delta {
            run.form.apply(delta);
            info!(goal = %delta.goal(), "goal satisfied");
        }
        if !result.is_success() {
            let failure = match result.failure {
                Some(FailureKind::ExecutionFailure) => AgentError::ExecutionFailure {
                    step: planned.step.to_string(),
                    detail: result.observed.clone(),
                },
                _ => AgentError::VerificationMismatch {
                    step: planned.step.to_string(),
                    expected: planned.expect.to_string(),
                },
            };
            warn!(goal = %planned.goal, origin = ?origin, "{}", failure);
            self.emit(SessionEvent::StepFailed {
                message: failure.to_string(),
            });
        }

        run.history.record(
            planned.step.clone(),
            result.clone(),
            Some(planned.goal.clone()),
            origin,
        );
        if pause > 0 {
            run.history.record(
                ActionStep::Wait { millis: pause },
                ActionResult::paused(pause),
                Some(planned.goal.clone()),
                StepOrigin::Pause,
            );
        }
        Ok(result)
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

fn millis_of(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
