//! Seams to the outside world: the browser/canvas driver, the vision oracle that annotates
//! screenshots, and the secondary action model used as a last resort.

use anyhow::Result;
use async_trait::async_trait;

use crate::fallback::FallbackPayload;
use crate::snapshot::{Perception, ScreenCapture};
use crate::types::{RawOutcome, Target};

/// Raw primitives plus screenshot capture. Implementations perform exactly one primitive per
/// call and report rejection through `RawOutcome` or an error, never by retrying internally.
#[async_trait]
pub trait ScreenDriver: Send + Sync {
    /// Load the page a session starts on.
    async fn open(&self, url: &str) -> Result<()>;

    async fn capture(&self) -> Result<ScreenCapture>;

    async fn click(&self, target: &Target) -> Result<RawOutcome>;

    async fn scroll(&self, target: &Target, delta_y: i32) -> Result<RawOutcome>;

    async fn input_text(&self, target: &Target, text: &str) -> Result<RawOutcome>;

    async fn send_keys(&self, target: &Target, keys: &str) -> Result<RawOutcome>;
}

/// Vision model that describes what a screenshot shows.
#[async_trait]
pub trait Perceiver: Send + Sync {
    async fn perceive(&self, capture: &ScreenCapture) -> Result<Perception>;
}

/// Constrained computer-use model. Performs at most one gesture per call.
#[async_trait]
pub trait SecondaryActionModel: Send + Sync {
    async fn dispatch(&self, payload: &FallbackPayload) -> Result<RawOutcome>;
}
