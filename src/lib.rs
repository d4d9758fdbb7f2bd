//! Screenshot-driven control loop for automating canvas-rendered web UIs.
//!
//! Every decision comes from rendered pixels plus explicitly tracked state: a [`planner`]
//! proposes one primitive at a time, the [`executor`] performs it, the [`verifier`] confirms
//! it against a fresh [`snapshot`], and [`session::SessionHost`] ties it together with
//! bounded retries, post-action pauses and a constrained [`fallback`].

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod form_state;
pub mod history;
pub mod planner;
pub mod request;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod verifier;
pub mod wait;

pub use config::AgentConfig;
pub use driver::{Perceiver, ScreenDriver, SecondaryActionModel};
pub use error::{AgentError, ConfigError, RequestError};
pub use fallback::{FallbackPayload, FallbackPlan};
pub use form_state::{FormState, GoalId, GoalStatus};
pub use history::{AgentHistory, HistoryEntry, StepOrigin};
pub use request::{Instruction, UserRequest};
pub use session::{EvidenceGap, SessionEvent, SessionHost, SessionOutcome, SessionReport};
pub use snapshot::{
    Bounds, BrowserSnapshot, ElementDescriptor, ElementRole, Perception, ScreenCapture, Viewport,
};
pub use types::{ActionStep, RawOutcome, StepKind, Target};
pub use verifier::ExpectedEvidence;
