//! Screenshot capture and the immutable snapshot value the rest of the loop reasons over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::driver::{Perceiver, ScreenDriver};
use crate::error::AgentError;
use crate::types::normalize_label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Raw pixels as returned by the driver.
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    pub png: Vec<u8>,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementRole {
    Input,
    Button,
    Link,
    MenuItem,
    Tab,
    Dropdown,
    Option,
    Checkbox,
    Modal,
    Text,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn contains(&self, other: &Bounds) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }
}

/// One element the vision model could make out on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub label: String,
    pub role: ElementRole,
    pub bounds: Bounds,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub value: Option<String>,
}

impl ElementDescriptor {
    pub fn new(label: impl Into<String>, role: ElementRole, bounds: Bounds) -> Self {
        Self {
            label: label.into(),
            role,
            bounds,
            focused: false,
            selected: false,
            value: None,
        }
    }
}

/// What the vision oracle derives from a capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Perception {
    #[serde(default)]
    pub elements: Vec<ElementDescriptor>,
    #[serde(default)]
    pub visible_text: Vec<String>,
}

/// Visual state at one point in time. Superseded by the next capture, never mutated.
#[derive(Debug, Clone)]
pub struct BrowserSnapshot {
    sequence: u64,
    captured_at: DateTime<Utc>,
    image: Arc<[u8]>,
    viewport: Viewport,
    fingerprint: u64,
    elements: Vec<ElementDescriptor>,
    visible_text: Vec<String>,
}

impl BrowserSnapshot {
    pub(crate) fn from_parts(sequence: u64, capture: ScreenCapture, perception: Perception) -> Self {
        let mut hasher = DefaultHasher::new();
        capture.png.hash(&mut hasher);
        Self {
            sequence,
            captured_at: Utc::now(),
            fingerprint: hasher.finish(),
            image: capture.png.into(),
            viewport: capture.viewport,
            elements: perception.elements,
            visible_text: perception.visible_text,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Hash of the raw pixels; two snapshots with different fingerprints rendered differently.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn elements(&self) -> &[ElementDescriptor] {
        &self.elements
    }

    pub fn visible_text(&self) -> &[String] {
        &self.visible_text
    }

    /// Find the element a request label refers to: exact normalized match first, then
    /// containment in either direction.
    pub fn find(&self, label: &str) -> Option<&ElementDescriptor> {
        let wanted = normalize_label(label);
        if wanted.is_empty() {
            return None;
        }
        self.elements
            .iter()
            .find(|e| normalize_label(&e.label) == wanted)
            .or_else(|| {
                self.elements.iter().find(|e| {
                    let have = normalize_label(&e.label);
                    !have.is_empty() && (have.contains(&wanted) || wanted.contains(&have))
                })
            })
    }

    pub fn find_with_role(&self, label: &str, role: ElementRole) -> Option<&ElementDescriptor> {
        let wanted = normalize_label(label);
        self.elements
            .iter()
            .filter(|e| e.role == role)
            .find(|e| normalize_label(&e.label).contains(&wanted))
    }

    /// True when `text` shows anywhere: loose text, element labels or element values.
    pub fn shows_text(&self, text: &str) -> bool {
        let wanted = normalize_label(text);
        if wanted.is_empty() {
            return false;
        }
        self.visible_text
            .iter()
            .any(|t| normalize_label(t).contains(&wanted))
            || self.elements.iter().any(|e| {
                normalize_label(&e.label).contains(&wanted)
                    || e.value
                        .as_deref()
                        .is_some_and(|v| normalize_label(v).contains(&wanted))
            })
    }

    pub fn is_blank(&self) -> bool {
        self.elements.is_empty() && self.visible_text.is_empty()
    }
}

/// Turns driver captures plus vision annotations into snapshots.
pub struct SnapshotObserver {
    driver: Arc<dyn ScreenDriver>,
    perceiver: Arc<dyn Perceiver>,
    sequence: AtomicU64,
}

impl SnapshotObserver {
    pub fn new(driver: Arc<dyn ScreenDriver>, perceiver: Arc<dyn Perceiver>) -> Self {
        Self {
            driver,
            perceiver,
            sequence: AtomicU64::new(0),
        }
    }

    pub async fn capture(&self) -> Result<BrowserSnapshot, AgentError> {
        let capture = self
            .driver
            .capture()
            .await
            .map_err(|e| AgentError::Capture(format!("{:#}", e)))?;
        let perception = self
            .perceiver
            .perceive(&capture)
            .await
            .map_err(|e| AgentError::Capture(format!("perception failed: {:#}", e)))?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = BrowserSnapshot::from_parts(sequence, capture, perception);
        debug!(
            sequence,
            elements = snapshot.elements().len(),
            fingerprint = snapshot.fingerprint(),
            "captured snapshot"
        );
        Ok(snapshot)
    }
}
