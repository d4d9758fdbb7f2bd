use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a primitive lands on screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A located element, addressed by the centre of its bounds in viewport pixels.
    Element { label: String, x: i32, y: i32 },
    /// Whatever currently holds keyboard focus.
    Focused,
    /// The page as a whole (scrolling without a specific anchor).
    Viewport,
}

impl Target {
    pub fn element(label: impl Into<String>, x: i32, y: i32) -> Self {
        Target::Element {
            label: label.into(),
            x,
            y,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Target::Element { label, .. } => Some(label),
            _ => None,
        }
    }

    pub fn point(&self) -> Option<(i32, i32)> {
        match self {
            Target::Element { x, y, .. } => Some((*x, *y)),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Element { label, x, y } => write!(f, "'{}' @({}, {})", label, x, y),
            Target::Focused => write!(f, "focused element"),
            Target::Viewport => write!(f, "viewport"),
        }
    }
}

/// A single atomic primitive. Compound gestures are sequences of these, never one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ActionStep {
    Click { target: Target },
    Scroll { target: Target, delta_y: i32 },
    InputText { target: Target, text: String },
    SendKeys { target: Target, keys: String },
    Wait { millis: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    Click,
    Scroll,
    InputText,
    SendKeys,
    Wait,
}

impl ActionStep {
    pub fn kind(&self) -> StepKind {
        match self {
            ActionStep::Click { .. } => StepKind::Click,
            ActionStep::Scroll { .. } => StepKind::Scroll,
            ActionStep::InputText { .. } => StepKind::InputText,
            ActionStep::SendKeys { .. } => StepKind::SendKeys,
            ActionStep::Wait { .. } => StepKind::Wait,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            ActionStep::Click { target }
            | ActionStep::Scroll { target, .. }
            | ActionStep::InputText { target, .. }
            | ActionStep::SendKeys { target, .. } => Some(target),
            ActionStep::Wait { .. } => None,
        }
    }

    /// Label of the element this step acts on, if it acts on a located element.
    pub fn target_label(&self) -> Option<&str> {
        self.target().and_then(Target::label)
    }
}

impl fmt::Display for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStep::Click { target } => write!(f, "Click({})", target),
            ActionStep::Scroll { target, delta_y } => write!(f, "Scroll({}, {})", target, delta_y),
            ActionStep::InputText { target, text } => {
                write!(f, "InputText({}, {:?})", target, text)
            }
            ActionStep::SendKeys { target, keys } => write!(f, "SendKeys({}, {})", target, keys),
            ActionStep::Wait { millis } => write!(f, "Wait({}ms)", millis),
        }
    }
}

/// What the driver (or the secondary model) reports after trying a primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutcome {
    pub performed: bool,
    pub detail: String,
    /// The primitive actually performed, when the performer chose it itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<ActionStep>,
}

impl RawOutcome {
    pub fn performed(detail: impl Into<String>) -> Self {
        Self {
            performed: true,
            detail: detail.into(),
            gesture: None,
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            performed: false,
            detail: detail.into(),
            gesture: None,
        }
    }

    pub fn with_gesture(mut self, gesture: ActionStep) -> Self {
        self.gesture = Some(gesture);
        self
    }
}

/// Lower-case, trim and collapse whitespace so labels from the vision model and labels
/// from the request compare on content only.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
