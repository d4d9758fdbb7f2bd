mod common;

use canvas_pilot::{
    ActionStep, AgentHistory, ElementRole, ExpectedEvidence, FallbackPlan, FormState, GoalId,
    GoalStatus, SessionEvent, SessionOutcome, StepKind, StepOrigin, Target, UserRequest,
};
use common::{FakeCanvas, Fault, ModelBehavior, PAUSE_MS, ScriptedModel, fast_config, host};
use tokio_util::sync::CancellationToken;

const LOGIN: &str = "enter email x@y.com, press Enter";

fn steps(history: &AgentHistory) -> Vec<ActionStep> {
    history.iter().map(|e| e.step.clone()).collect()
}

fn kinds(history: &AgentHistory) -> Vec<StepKind> {
    history.iter().map(|e| e.step.kind()).collect()
}

/// Every Enter press in the history is directly followed by the mandated pause.
fn assert_paused_after_enter(history: &AgentHistory) {
    let entries = history.entries();
    for (i, entry) in entries.iter().enumerate() {
        if let ActionStep::SendKeys { keys, .. } = &entry.step {
            if keys == "Enter" {
                let next = entries.get(i + 1).expect("pause after Enter");
                assert_eq!(next.step, ActionStep::Wait { millis: PAUSE_MS });
                assert_eq!(next.origin, StepOrigin::Pause);
            }
        }
    }
}

#[tokio::test]
async fn login_runs_exactly_the_requested_steps() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model.clone(), fast_config());
    let mut events = host.subscribe();

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let history = steps(&report.history);
    assert_eq!(history.len(), 4);
    let email = match &history[0] {
        ActionStep::Click { target } => {
            assert_eq!(target.label(), Some("Email"));
            target.clone()
        }
        other => panic!("expected a click on Email, got {}", other),
    };
    assert_eq!(
        history[1],
        ActionStep::InputText {
            target: email,
            text: "x@y.com".into()
        }
    );
    assert_eq!(
        history[2],
        ActionStep::SendKeys {
            target: Target::Focused,
            keys: "Enter".into()
        }
    );
    assert_eq!(history[3], ActionStep::Wait { millis: PAUSE_MS });

    // never clicks Login on its own initiative
    assert!(
        report
            .history
            .iter()
            .all(|e| e.step.target_label() != Some("Login"))
    );
    assert!(model.payloads().is_empty());
    assert_eq!(canvas.value_of("Email").as_deref(), Some("x@y.com"));
    assert!(report.form_state.is_satisfied(&GoalId::field("email")));

    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Finished { outcome } = event {
            assert_eq!(outcome, SessionOutcome::Completed);
            finished = true;
        }
    }
    assert!(finished);
}

#[tokio::test]
async fn flaky_typing_is_retried_identically() {
    let canvas = FakeCanvas::login_form();
    canvas.fail(StepKind::InputText, Fault::Ignore, 2);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let typing: Vec<_> = report
        .history
        .iter()
        .filter(|e| e.step.kind() == StepKind::InputText)
        .collect();
    assert_eq!(typing.len(), 3);
    assert!(typing.iter().all(|e| e.step == typing[0].step));
    assert_eq!(typing[0].origin, StepOrigin::Planned);
    assert_eq!(typing[1].origin, StepOrigin::Retry { attempt: 2 });
    assert_eq!(typing[2].origin, StepOrigin::Retry { attempt: 3 });
    assert!(!typing[1].result.is_success());
    assert!(typing[2].result.is_success());
    assert_eq!(
        report
            .history
            .attempts_of(&GoalId::field("email"), &typing[0].step),
        3
    );
    assert!(model.payloads().is_empty());
}

#[tokio::test]
async fn exhausted_enter_escalates_then_fails_with_gap() {
    let canvas = FakeCanvas::login_form();
    canvas.fail(StepKind::SendKeys, Fault::Reject, u32::MAX);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse("press Enter").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    let primary = report
        .history
        .iter()
        .filter(|e| matches!(e.origin, StepOrigin::Planned | StepOrigin::Retry { .. }))
        .count();
    assert_eq!(primary, 3);

    let payloads = model.payloads();
    assert_eq!(payloads.len(), 2);
    for payload in &payloads {
        assert_eq!(
            payload.fallback_plan,
            FallbackPlan::KeyPress {
                keys: "Enter".into()
            }
        );
        assert_eq!(payload.max_retries, 2);
        assert!(matches!(
            payload.expected_visual_evidence,
            ExpectedEvidence::ScreenChanged { .. }
        ));
        assert!(!payload.description.is_empty());
    }

    match &report.outcome {
        SessionOutcome::Failed(gap) => {
            assert!(gap.goal.is_some());
            assert!(matches!(gap.expected, ExpectedEvidence::ScreenChanged { .. }));
            assert!(gap.reason.contains("fallback"));
        }
        other => panic!("expected failure, got {}", other),
    }
    assert_paused_after_enter(&report.history);
    assert!(canvas.texts().is_empty());
}

#[tokio::test]
async fn fallback_success_completes_the_goal() {
    let canvas = FakeCanvas::login_form();
    canvas.fail(StepKind::SendKeys, Fault::Reject, u32::MAX);
    let model = ScriptedModel::new(&canvas, ModelBehavior::PressEnter);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse("press Enter").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert_eq!(model.payloads().len(), 1);
    let confirmed = report
        .history
        .iter()
        .find(|e| e.origin == StepOrigin::Fallback { attempt: 1 })
        .unwrap();
    assert!(confirmed.result.is_success());
    assert_paused_after_enter(&report.history);
    assert_eq!(canvas.texts(), vec!["Welcome back".to_string()]);
}

#[tokio::test]
async fn fallback_never_types() {
    let canvas = FakeCanvas::login_form();
    canvas.fail(StepKind::SendKeys, Fault::Reject, u32::MAX);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Type);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse("press Enter").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(report.outcome, SessionOutcome::Failed(_)));
    let fallback_entries: Vec<_> = report
        .history
        .iter()
        .filter(|e| matches!(e.origin, StepOrigin::Fallback { .. }))
        .collect();
    assert_eq!(fallback_entries.len(), 2);
    assert!(fallback_entries.iter().all(|e| !e.result.is_success()));
    assert!(
        fallback_entries[0]
            .result
            .observed
            .contains("text entry")
    );
}

#[tokio::test]
async fn satisfied_field_is_not_touched_again() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());

    let request = UserRequest::parse(LOGIN).unwrap();
    let form = FormState::restore(&request, [(GoalId::field("email"), GoalStatus::Satisfied)]);
    let report = host
        .resume_session(&request, form, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    assert!(
        report
            .history
            .iter()
            .all(|e| e.step.target_label() != Some("Email"))
    );
    assert_eq!(report.history.for_goal(&GoalId::field("email")).count(), 0);
    assert_eq!(
        kinds(&report.history),
        vec![StepKind::SendKeys, StepKind::Wait]
    );
    assert_eq!(canvas.value_of("Email"), None);
}

#[tokio::test]
async fn cancelled_before_start_aborts_without_steps() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host.run_session(&request, &cancel).await.unwrap();

    assert!(matches!(report.outcome, SessionOutcome::Aborted(_)));
    assert!(report.history.is_empty());
}

#[tokio::test]
async fn cancellation_stops_at_the_next_boundary() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());
    let cancel = CancellationToken::new();
    canvas.cancel_after(1, cancel.clone());

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host.run_session(&request, &cancel).await.unwrap();

    assert!(matches!(report.outcome, SessionOutcome::Aborted(_)));
    // the in-flight click still ran and was verified
    assert_eq!(kinds(&report.history), vec![StepKind::Click]);
    assert!(report.history.entries()[0].result.is_success());
    assert!(!report.form_state.is_satisfied(&GoalId::field("email")));
}

#[tokio::test]
async fn blocked_goal_rechecks_until_target_renders() {
    let canvas = FakeCanvas::new();
    // start capture is #1, each recheck takes one more
    canvas.add_from_capture("Organization", ElementRole::MenuItem, 3);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse("click on Organization on the left hand menu").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let origins: Vec<_> = report.history.iter().map(|e| e.origin).collect();
    assert_eq!(
        origins,
        vec![StepOrigin::Recheck, StepOrigin::Recheck, StepOrigin::Planned]
    );
    assert_eq!(report.history.entries()[2].step.target_label(), Some("Organization"));
    assert!(model.payloads().is_empty());
}

#[tokio::test]
async fn unexpressible_instruction_goes_to_fallback() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Click);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse("drag the slider to the right").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let payloads = model.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(matches!(
        payloads[0].fallback_plan,
        FallbackPlan::ClickOrScroll { .. }
    ));
    assert_eq!(report.history.len(), 1);
    assert_eq!(
        report.history.entries()[0].origin,
        StepOrigin::Fallback { attempt: 1 }
    );
}

#[tokio::test]
async fn second_exhaustion_of_a_goal_fails() {
    let canvas = FakeCanvas::login_form();
    canvas.fail(StepKind::Click, Fault::Reject, u32::MAX);
    canvas.fail(StepKind::InputText, Fault::Reject, u32::MAX);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Click);
    let host = host(&canvas, model.clone(), fast_config());

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    // the focus click was rescued once; typing then exhausts with nothing left
    assert_eq!(model.payloads().len(), 1);
    match &report.outcome {
        SessionOutcome::Failed(gap) => {
            assert_eq!(gap.goal, Some(GoalId::field("email")));
            assert!(gap.reason.contains("already spent"));
            assert_eq!(gap.step.as_ref().map(|s| s.kind()), Some(StepKind::InputText));
        }
        other => panic!("expected failure, got {}", other),
    }
    let clicks = report
        .history
        .iter()
        .filter(|e| e.step.kind() == StepKind::Click && e.origin != StepOrigin::Fallback { attempt: 1 })
        .count();
    // three attempts plus the retry-click recovery
    assert_eq!(clicks, 4);
    assert!(
        report
            .history
            .iter()
            .any(|e| e.origin == StepOrigin::Recovery && e.step.kind() == StepKind::Scroll)
    );
}

#[tokio::test]
async fn cycle_budget_bounds_the_session() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config().max_cycles(1));

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    match &report.outcome {
        SessionOutcome::Failed(gap) => assert!(gap.reason.contains("planning budget")),
        other => panic!("expected failure, got {}", other),
    }
    assert_eq!(report.history.len(), 1);
}

#[tokio::test]
async fn start_url_is_opened_first() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());

    let request =
        UserRequest::parse("open https://app.test/login then enter email x@y.com, press Enter")
            .unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(canvas.opened(), vec!["https://app.test/login".to_string()]);
    assert_eq!(report.outcome, SessionOutcome::Completed);
}

#[tokio::test]
async fn history_is_written_as_json() {
    let canvas = FakeCanvas::login_form();
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());

    let request = UserRequest::parse(LOGIN).unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    report.history.save_json(&path).unwrap();
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let entries = saved.as_array().unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[2]["step"]["action"], "SendKeys");
    assert_eq!(entries[3]["origin"]["origin"], "pause");
}

#[tokio::test]
async fn refilling_a_field_enters_the_later_value() {
    let canvas = FakeCanvas::new();
    canvas.add("Name", ElementRole::Input);
    canvas.add("Next", ElementRole::Button);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());

    let request = UserRequest::parse("enter name as Alice, click on Next, enter name as Bob").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let typed: Vec<_> = report
        .history
        .iter()
        .filter_map(|e| match &e.step {
            ActionStep::InputText { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(typed, vec!["Alice", "Bob"]);
    assert_eq!(canvas.value_of("Name").as_deref(), Some("Bob"));
    assert!(report.form_state.is_satisfied(&GoalId::field("name")));
    assert!(report.form_state.is_satisfied(&GoalId::new("2:field:name")));
    // the old value is selected so typing replaces it
    assert!(report.history.iter().any(|e| e.step
        == ActionStep::SendKeys {
            target: Target::Focused,
            keys: "Control+a".into()
        }));
}

#[tokio::test]
async fn keyword_click_is_followed_by_the_pause() {
    let canvas = FakeCanvas::new();
    canvas.add("SAVE", ElementRole::Button);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());

    let request = UserRequest::parse("click on SAVE").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let entries = report.history.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].step.target_label(), Some("SAVE"));
    assert_eq!(entries[1].step, ActionStep::Wait { millis: PAUSE_MS });
    assert_eq!(entries[1].origin, StepOrigin::Pause);
}

#[tokio::test]
async fn dismissing_a_dialog_waits_for_it_to_close() {
    let canvas = FakeCanvas::new();
    canvas.add_dialog("Unsaved changes");
    canvas.add("Cancel", ElementRole::Button);
    let model = ScriptedModel::new(&canvas, ModelBehavior::Refuse);
    let host = host(&canvas, model, fast_config());

    let request = UserRequest::parse("click on Cancel").unwrap();
    let report = host
        .run_session(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::Completed);
    let entries = report.history.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        entries[0].result.expected,
        ExpectedEvidence::ModalClosed {
            label: "Unsaved changes".into()
        }
    );
    assert!(entries[0].result.is_success());
    assert_eq!(entries[1].origin, StepOrigin::Pause);
}
