//! Hands one step at a time to the screen driver.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::driver::ScreenDriver;
use crate::types::{ActionStep, RawOutcome};

/// Dispatches exactly one primitive per call.
pub struct ActionExecutor {
    driver: Arc<dyn ScreenDriver>,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn ScreenDriver>) -> Self {
        Self { driver }
    }

    pub async fn execute(&self, step: &ActionStep) -> RawOutcome {
        debug!(step = %step, "executing");
        let result = match step {
            ActionStep::Click { target } => self.driver.click(target).await,
            ActionStep::Scroll { target, delta_y } => self.driver.scroll(target, *delta_y).await,
            ActionStep::InputText { target, text } => self.driver.input_text(target, text).await,
            ActionStep::SendKeys { target, keys } => self.driver.send_keys(target, keys).await,
            ActionStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                Ok(RawOutcome::performed(format!("waited {}ms", millis)))
            }
        };

        match result {
            Ok(outcome) => {
                if !outcome.performed {
                    warn!(step = %step, detail = %outcome.detail, "driver did not perform step");
                }
                outcome
            }
            Err(e) => {
                warn!(step = %step, error = %format!("{:#}", e), "driver rejected step");
                RawOutcome::rejected(format!("{:#}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ScreenCapture;
    use crate::types::Target;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ScreenDriver for Counting {
        async fn open(&self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn capture(&self) -> Result<ScreenCapture> {
            bail!("not used")
        }

        async fn click(&self, _target: &Target) -> Result<RawOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawOutcome::performed("clicked"))
        }

        async fn scroll(&self, _target: &Target, _delta_y: i32) -> Result<RawOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawOutcome::performed("scrolled"))
        }

        async fn input_text(&self, _target: &Target, _text: &str) -> Result<RawOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("input lost focus")
        }

        async fn send_keys(&self, _target: &Target, _keys: &str) -> Result<RawOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawOutcome::rejected("no window"))
        }
    }

    #[tokio::test]
    async fn one_driver_call_per_step() {
        let driver = Arc::new(Counting::default());
        let executor = ActionExecutor::new(driver.clone());

        let outcome = executor
            .execute(&ActionStep::Click {
                target: Target::element("Save", 1, 1),
            })
            .await;
        assert!(outcome.performed);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);

        executor.execute(&ActionStep::Wait { millis: 1 }).await;
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn driver_errors_become_rejections() {
        let executor = ActionExecutor::new(Arc::new(Counting::default()));
        let outcome = executor
            .execute(&ActionStep::InputText {
                target: Target::Focused,
                text: "hi".into(),
            })
            .await;
        assert!(!outcome.performed);
        assert!(outcome.detail.contains("lost focus"));

        let outcome = executor
            .execute(&ActionStep::SendKeys {
                target: Target::Focused,
                keys: "Enter".into(),
            })
            .await;
        assert!(!outcome.performed);
        assert_eq!(outcome.detail, "no window");
    }
}
