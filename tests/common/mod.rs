//! In-memory canvas app standing in for Chrome plus the vision model.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use canvas_pilot::types::normalize_label;
use canvas_pilot::{
    ActionStep, AgentConfig, Bounds, ElementDescriptor, ElementRole, FallbackPayload, Perception,
    Perceiver, RawOutcome, ScreenCapture, ScreenDriver, SecondaryActionModel, SessionHost,
    StepKind, Target, Viewport,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How an injected failure shows up.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Driver refuses the primitive.
    Reject,
    /// Driver reports success but nothing happens on screen.
    Ignore,
}

struct Widget {
    element: ElementDescriptor,
    visible_from_capture: u32,
}

#[derive(Default)]
struct CanvasState {
    frame: u32,
    captures: u32,
    primitives: u32,
    widgets: Vec<Widget>,
    focused: Option<String>,
    /// Content of the focused field is selected; the next typing replaces it.
    select_all: bool,
    values: HashMap<String, String>,
    selected: Vec<String>,
    texts: Vec<String>,
    faults: HashMap<StepKind, (Fault, u32)>,
    opened: Vec<String>,
    cancel_after: Option<(u32, CancellationToken)>,
}

pub struct FakeCanvas {
    state: Mutex<CanvasState>,
}

impl FakeCanvas {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CanvasState::default()),
        })
    }

    /// Email input plus a Login button.
    pub fn login_form() -> Arc<Self> {
        let canvas = Self::new();
        canvas.add("Email", ElementRole::Input);
        canvas.add("Login", ElementRole::Button);
        canvas
    }

    pub fn add(&self, label: &str, role: ElementRole) {
        self.add_from_capture(label, role, 0);
    }

    /// Only rendered once `capture` screenshots have been taken.
    pub fn add_from_capture(&self, label: &str, role: ElementRole, capture: u32) {
        let mut state = self.state.lock().unwrap();
        let n = state.widgets.len() as i32;
        state.widgets.push(Widget {
            element: ElementDescriptor::new(
                label,
                role,
                Bounds {
                    x: 100,
                    y: 100 + 60 * n,
                    width: 200,
                    height: 40,
                },
            ),
            visible_from_capture: capture,
        });
    }

    /// Dialog covering the whole viewport; Close or Cancel dismisses it.
    pub fn add_dialog(&self, label: &str) {
        let mut state = self.state.lock().unwrap();
        state.widgets.push(Widget {
            element: ElementDescriptor::new(
                label,
                ElementRole::Modal,
                Bounds {
                    x: 0,
                    y: 0,
                    width: 1280,
                    height: 800,
                },
            ),
            visible_from_capture: 0,
        });
    }

    pub fn fail(&self, kind: StepKind, fault: Fault, times: u32) {
        self.state.lock().unwrap().faults.insert(kind, (fault, times));
    }

    /// Cancel `token` once `n` primitives have been performed.
    pub fn cancel_after(&self, n: u32, token: CancellationToken) {
        self.state.lock().unwrap().cancel_after = Some((n, token));
    }

    pub fn value_of(&self, label: &str) -> Option<String> {
        self.state.lock().unwrap().values.get(label).cloned()
    }

    pub fn texts(&self) -> Vec<String> {
        self.state.lock().unwrap().texts.clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    /// Click that bypasses fault injection, as a more capable model would land it.
    pub fn force_click(&self, label: &str, x: i32, y: i32) -> RawOutcome {
        let mut state = self.state.lock().unwrap();
        state.apply_click(label);
        RawOutcome::performed(format!("clicked {} at ({}, {})", label, x, y))
    }

    pub fn force_enter(&self) -> RawOutcome {
        let mut state = self.state.lock().unwrap();
        state.apply_enter();
        RawOutcome::performed("pressed Enter")
    }

    fn primitive<F>(&self, kind: StepKind, apply: F) -> Result<RawOutcome>
    where
        F: FnOnce(&mut CanvasState) -> RawOutcome,
    {
        let mut state = self.state.lock().unwrap();
        state.primitives += 1;
        if let Some((n, token)) = &state.cancel_after {
            if state.primitives >= *n {
                token.cancel();
            }
        }

        let fault = match state.faults.get_mut(&kind) {
            Some((fault, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*fault)
            }
            _ => None,
        };
        Ok(match fault {
            Some(Fault::Reject) => RawOutcome::rejected(format!("{:?} rejected by canvas", kind)),
            Some(Fault::Ignore) => RawOutcome::performed("no visible effect"),
            None => apply(&mut *state),
        })
    }
}

impl CanvasState {
    fn find(&self, label: &str) -> Option<&ElementDescriptor> {
        let wanted = normalize_label(label);
        self.widgets
            .iter()
            .filter(|w| self.captures >= w.visible_from_capture)
            .map(|w| &w.element)
            .find(|e| normalize_label(&e.label) == wanted)
    }

    fn apply_click(&mut self, label: &str) {
        self.frame += 1;
        let Some(el) = self.find(label).cloned() else {
            return;
        };
        self.select_all = false;
        match el.role {
            ElementRole::Input => self.focused = Some(el.label.clone()),
            ElementRole::Button if matches!(el.label.as_str(), "Close" | "Cancel") => {
                self.widgets.retain(|w| w.element.role != ElementRole::Modal)
            }
            ElementRole::MenuItem | ElementRole::Tab | ElementRole::Option => {
                self.selected.push(el.label.clone())
            }
            _ => {}
        }
    }

    fn apply_enter(&mut self) {
        self.frame += 1;
        self.texts.push("Welcome back".to_string());
    }
}

#[async_trait]
impl ScreenDriver for FakeCanvas {
    async fn open(&self, url: &str) -> Result<()> {
        self.state.lock().unwrap().opened.push(url.to_string());
        Ok(())
    }

    async fn capture(&self) -> Result<ScreenCapture> {
        let mut state = self.state.lock().unwrap();
        state.captures += 1;
        Ok(ScreenCapture {
            png: state.frame.to_le_bytes().to_vec(),
            viewport: Viewport {
                width: 1280,
                height: 800,
            },
        })
    }

    async fn click(&self, target: &Target) -> Result<RawOutcome> {
        let label = target.label().unwrap_or_default().to_string();
        self.primitive(StepKind::Click, |state| {
            state.apply_click(&label);
            RawOutcome::performed(format!("clicked {}", label))
        })
    }

    async fn scroll(&self, _target: &Target, delta_y: i32) -> Result<RawOutcome> {
        // the fake page is shorter than the viewport
        self.primitive(StepKind::Scroll, |_| {
            RawOutcome::performed(format!("scrolled {}px", delta_y))
        })
    }

    async fn input_text(&self, _target: &Target, text: &str) -> Result<RawOutcome> {
        let text = text.to_string();
        self.primitive(StepKind::InputText, |state| match state.focused.clone() {
            Some(label) => {
                state.frame += 1;
                let value = state.values.entry(label).or_default();
                if std::mem::take(&mut state.select_all) {
                    value.clear();
                }
                value.push_str(&text);
                RawOutcome::performed("typed")
            }
            None => RawOutcome::rejected("nothing has focus"),
        })
    }

    async fn send_keys(&self, _target: &Target, keys: &str) -> Result<RawOutcome> {
        let keys = keys.to_string();
        self.primitive(StepKind::SendKeys, |state| {
            if keys == "Enter" {
                state.apply_enter();
            } else if keys == "Control+a" && state.focused.is_some() {
                state.frame += 1;
                state.select_all = true;
            } else {
                state.frame += 1;
            }
            RawOutcome::performed(format!("pressed {}", keys))
        })
    }
}

#[async_trait]
impl Perceiver for FakeCanvas {
    async fn perceive(&self, _capture: &ScreenCapture) -> Result<Perception> {
        let state = self.state.lock().unwrap();
        let elements = state
            .widgets
            .iter()
            .filter(|w| state.captures >= w.visible_from_capture)
            .map(|w| {
                let mut el = w.element.clone();
                el.focused = state.focused.as_deref() == Some(el.label.as_str());
                el.selected = state.selected.contains(&el.label);
                el.value = state.values.get(&el.label).cloned();
                el
            })
            .collect();
        Ok(Perception {
            elements,
            visible_text: state.texts.clone(),
        })
    }
}

/// What the scripted secondary model does when asked.
#[derive(Debug, Clone, Copy)]
pub enum ModelBehavior {
    Refuse,
    /// Lands a click on the plan's target, ignoring injected faults.
    Click,
    PressEnter,
    Type,
}

pub struct ScriptedModel {
    canvas: Arc<FakeCanvas>,
    behavior: ModelBehavior,
    payloads: Mutex<Vec<FallbackPayload>>,
}

impl ScriptedModel {
    pub fn new(canvas: &Arc<FakeCanvas>, behavior: ModelBehavior) -> Arc<Self> {
        Arc::new(Self {
            canvas: canvas.clone(),
            behavior,
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn payloads(&self) -> Vec<FallbackPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecondaryActionModel for ScriptedModel {
    async fn dispatch(&self, payload: &FallbackPayload) -> Result<RawOutcome> {
        self.payloads.lock().unwrap().push(payload.clone());
        let label = match &payload.fallback_plan {
            canvas_pilot::FallbackPlan::Click { target }
            | canvas_pilot::FallbackPlan::ClickOrScroll { target }
            | canvas_pilot::FallbackPlan::Scroll { target, .. } => target.clone(),
            canvas_pilot::FallbackPlan::KeyPress { .. } => String::new(),
        };
        Ok(match self.behavior {
            ModelBehavior::Refuse => RawOutcome::rejected("could not find the target"),
            ModelBehavior::Click => {
                let target = Target::element(label.clone(), 200, 120);
                self.canvas
                    .force_click(&label, 200, 120)
                    .with_gesture(ActionStep::Click { target })
            }
            ModelBehavior::PressEnter => self.canvas.force_enter().with_gesture(ActionStep::SendKeys {
                target: Target::Focused,
                keys: "Enter".into(),
            }),
            ModelBehavior::Type => RawOutcome::performed("typed").with_gesture(ActionStep::InputText {
                target: Target::Focused,
                text: "x@y.com".into(),
            }),
        })
    }
}

pub const PAUSE_MS: u64 = 3;

pub fn fast_config() -> AgentConfig {
    AgentConfig::default()
        .processing_pause(Duration::from_millis(PAUSE_MS))
        .recheck_pause(Duration::from_millis(1))
}

pub fn host(canvas: &Arc<FakeCanvas>, model: Arc<ScriptedModel>, config: AgentConfig) -> SessionHost {
    SessionHost::new(canvas.clone(), canvas.clone(), model, config).unwrap()
}
