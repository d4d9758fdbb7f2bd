use anyhow::{Result, anyhow};
use async_trait::async_trait;
use canvas_pilot::request::normalize_keys;
use canvas_pilot::{
    ActionStep, FallbackPayload, FallbackPlan, RawOutcome, ScreenDriver, SecondaryActionModel,
    Target,
};
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::brain::encode_for_model;
use crate::hands::ChromeDriver;

const DEFAULT_MODEL: &str = "computer-use-preview";

/// Secondary action model: one computer-use call per dispatch, click/scroll/keypress only.
pub struct ComputerUseModel {
    client: Client,
    api_key: String,
    model: String,
    driver: Arc<ChromeDriver>,
}

impl ComputerUseModel {
    pub fn from_env(driver: Arc<ChromeDriver>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        let model =
            std::env::var("AGENT_FALLBACK_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self {
            client: Client::new(),
            api_key,
            model,
            driver,
        })
    }

    async fn perform(&self, plan: &FallbackPlan, action: &Value) -> Result<RawOutcome> {
        let kind = action["type"].as_str().unwrap_or_default();
        let label = match plan {
            FallbackPlan::Click { target }
            | FallbackPlan::Scroll { target, .. }
            | FallbackPlan::ClickOrScroll { target } => target.clone(),
            FallbackPlan::KeyPress { .. } => String::new(),
        };
        let point = || -> Result<(i32, i32)> {
            let x = action["x"].as_i64().ok_or_else(|| anyhow!("{} without x", kind))?;
            let y = action["y"].as_i64().ok_or_else(|| anyhow!("{} without y", kind))?;
            Ok((x as i32, y as i32))
        };

        let allowed = match plan {
            FallbackPlan::Click { .. } => kind == "click",
            FallbackPlan::Scroll { .. } => kind == "scroll",
            FallbackPlan::KeyPress { .. } => kind == "keypress",
            FallbackPlan::ClickOrScroll { .. } => kind == "click" || kind == "scroll",
        };
        if !allowed {
            return Ok(RawOutcome::rejected(format!(
                "model chose '{}', outside the requested gesture",
                kind
            )));
        }

        match kind {
            "click" => {
                let (x, y) = point()?;
                let target = Target::element(label, x, y);
                let outcome = self.driver.click(&target).await?;
                Ok(outcome.with_gesture(ActionStep::Click { target }))
            }
            "scroll" => {
                let (x, y) = point()?;
                let delta_y = action["scroll_y"].as_i64().unwrap_or_default() as i32;
                let target = Target::element(label, x, y);
                let outcome = self.driver.scroll(&target, delta_y).await?;
                Ok(outcome.with_gesture(ActionStep::Scroll { target, delta_y }))
            }
            "keypress" => {
                let keys: Vec<&str> = action["keys"]
                    .as_array()
                    .map(|ks| ks.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let keys = normalize_keys(&keys.join("+"));
                let outcome = self.driver.send_keys(&Target::Focused, &keys).await?;
                Ok(outcome.with_gesture(ActionStep::SendKeys {
                    target: Target::Focused,
                    keys,
                }))
            }
            other => Ok(RawOutcome::rejected(format!("unsupported gesture '{}'", other))),
        }
    }
}

#[async_trait]
impl SecondaryActionModel for ComputerUseModel {
    async fn dispatch(&self, payload: &FallbackPayload) -> Result<RawOutcome> {
        let capture = self.driver.capture().await?;
        let screenshot = encode_for_model(&capture)?;
        let (width, height) = (capture.viewport.width, capture.viewport.height);

        let prompt = format!(
            "TASK: {}\n\n\
             Perform exactly ONE action. Allowed: {}.\n\
             Afterwards the screen must show: {}.\n\
             - If the target is visible, click the centre of its bounds.\n\
             - If it must be brought into view, scroll (choose direction, amount and origin).\n\
             - Never type text.\n\n\
             Viewport size: width={}, height={}",
            payload.description,
            serde_json::to_string(&payload.fallback_plan)?,
            payload.expected_visual_evidence,
            width,
            height
        );

        let response = self
            .client
            .post("https://api.openai.com/v1/responses")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "tools": [{
                    "type": "computer_use_preview",
                    "display_width": width,
                    "display_height": height,
                    "environment": "browser",
                }],
                "input": [{
                    "role": "user",
                    "content": [
                        {"type": "input_text", "text": prompt},
                        {"type": "input_image", "detail": "high",
                         "image_url": format!("data:image/png;base64,{}", screenshot)},
                    ],
                }],
                "truncation": "auto",
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: Value = response.json().await?;
        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            return Err(anyhow!("OpenAI API error ({}): {}", status, err_msg));
        }

        let output = json_resp["output"].as_array().cloned().unwrap_or_default();
        let Some(call) = output.iter().find(|item| item["type"] == "computer_call") else {
            let text = output
                .iter()
                .flat_map(|item| item["content"].as_array().cloned().unwrap_or_default())
                .filter_map(|c| c["text"].as_str().map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ");
            warn!(text = %text, "no computer call in response");
            return Ok(RawOutcome::rejected(format!("no gesture returned: {}", text)));
        };

        let action = &call["action"];
        if action["type"] == "type" {
            let text = action["text"].as_str().unwrap_or_default().to_string();
            // not executed; reported so the dispatcher refuses it
            return Ok(RawOutcome::rejected("model asked to type").with_gesture(
                ActionStep::InputText {
                    target: Target::Focused,
                    text,
                },
            ));
        }
        info!(action = %action, "executing computer-use gesture");
        self.perform(&payload.fallback_plan, action).await
    }
}
