use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use canvas_pilot::{Perception, Perceiver, ScreenCapture};
use image::ImageFormat;
use image::imageops::FilterType;
use reqwest::Client;
use serde_json::json;
use std::io::Cursor;
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4o";

const SYSTEM_PROMPT: &str = r#"You describe screenshots of web applications that render into a canvas, so there is no DOM to read. Report only what is visibly rendered.

Return ONE JSON object and nothing else:
{
  "elements": [
    {"label": "Email", "role": "input", "bounds": {"x": 100, "y": 200, "width": 240, "height": 32},
     "focused": false, "selected": false, "value": null}
  ],
  "visible_text": ["Sign in to continue", "..."]
}

Rules:
1. Coordinates are CSS pixels of the screenshot, origin top-left.
2. role is one of: input, button, link, menu_item, tab, dropdown, option, checkbox, modal, text, other.
3. label is the visible caption, placeholder or field label. Never invent elements.
4. focused is true only when a caret or focus ring is visible. selected is true for a highlighted tab, menu item or option.
5. value is the text currently shown inside an input or dropdown, otherwise null.
6. visible_text lists headings, messages, toasts and other readable text."#;

/// Vision oracle behind an OpenAI-compatible chat endpoint.
pub struct VisionPerceiver {
    client: Client,
    api_key: String,
    model: String,
}

impl VisionPerceiver {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        let model =
            std::env::var("AGENT_PERCEPTION_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self {
            client: Client::new(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl Perceiver for VisionPerceiver {
    async fn perceive(&self, capture: &ScreenCapture) -> Result<Perception> {
        let image_url = format!("data:image/png;base64,{}", encode_for_model(capture)?);

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": [
                        {"type": "text", "text": format!(
                            "Viewport is {}x{}. Describe this screen.",
                            capture.viewport.width, capture.viewport.height
                        )},
                        {"type": "image_url", "image_url": {"url": image_url, "detail": "high"}},
                    ]},
                ],
                "temperature": 0.0,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: serde_json::Value = response.json().await?;
        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            warn!(%status, err_msg, "perception request failed");
            return Err(anyhow!("OpenAI API error ({}): {}", status, err_msg));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("No content in vision response: {}", json_resp))?;

        // Strip possible markdown fences the model might add
        let cleaned = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let perception: Perception = serde_json::from_str(cleaned)
            .map_err(|e| anyhow!("Failed to parse vision response: {}. Content: {}", e, cleaned))?;
        debug!(
            elements = perception.elements.len(),
            texts = perception.visible_text.len(),
            "perceived screen"
        );
        Ok(perception)
    }
}

/// Screenshot rescaled to CSS pixels so model coordinates map 1:1 onto the page, as base64.
pub fn encode_for_model(capture: &ScreenCapture) -> Result<String> {
    let img = image::load_from_memory(&capture.png)?;
    let (width, height) = (capture.viewport.width, capture.viewport.height);
    let img = if width > 0 && height > 0 && (img.width(), img.height()) != (width, height) {
        img.resize_exact(width, height, FilterType::Triangle)
    } else {
        img
    };
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(STANDARD.encode(buf))
}
