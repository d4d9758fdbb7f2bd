use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use canvas_pilot::{RawOutcome, ScreenCapture, ScreenDriver, Target, Viewport};
use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::protocol::cdp::{Input, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chrome tab driven purely through pointer, wheel and keyboard input plus screenshots.
/// Created once, reused for every session.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeDriver {
    /// Attach to a Chrome already listening on `port`, or launch one on a persistent
    /// profile under `profile_dir`.
    pub fn launch(port: u16, profile_dir: &Path) -> Result<Self> {
        info!(port, "attempting to attach to a running Chrome");
        if let Ok(browser) = Browser::connect(format!("http://127.0.0.1:{}", port)) {
            let existing = {
                let tabs = browser.get_tabs();
                let tabs = tabs
                    .lock()
                    .map_err(|_| anyhow!("Chrome tab list lock poisoned"))?;
                tabs.first().cloned()
            };
            let tab = match existing {
                Some(tab) => {
                    info!("attached to existing Chrome tab");
                    tab
                }
                None => browser.new_tab()?,
            };
            return Ok(Self {
                _browser: browser,
                tab,
            });
        }

        warn!("could not attach, launching Chrome with the agent profile");
        std::fs::create_dir_all(profile_dir)
            .with_context(|| format!("creating profile dir {}", profile_dir.display()))?;

        let options = LaunchOptions {
            headless: false,
            path: find_chrome(),
            user_data_dir: Some(profile_dir.to_path_buf()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        let browser =
            Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {}", e))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Run blocking CDP work off the async runtime.
    async fn on_tab<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || work(&tab))
            .await
            .map_err(|e| anyhow!("browser task panicked: {}", e))?
    }
}

#[async_trait]
impl ScreenDriver for ChromeDriver {
    async fn open(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.on_tab(move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn capture(&self) -> Result<ScreenCapture> {
        self.on_tab(|tab| {
            let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
            let viewport = viewport_of(tab)?;
            debug!(bytes = png.len(), width = viewport.width, height = viewport.height, "screenshot");
            Ok(ScreenCapture { png, viewport })
        })
        .await
    }

    async fn click(&self, target: &Target) -> Result<RawOutcome> {
        let Some((x, y)) = target.point() else {
            return Ok(RawOutcome::rejected(format!("cannot click {}: no screen position", target)));
        };
        self.on_tab(move |tab| {
            tab.click_point(Point {
                x: x as f64,
                y: y as f64,
            })?;
            Ok(RawOutcome::performed(format!("clicked at ({}, {})", x, y)))
        })
        .await
    }

    async fn scroll(&self, target: &Target, delta_y: i32) -> Result<RawOutcome> {
        let point = target.point();
        self.on_tab(move |tab| {
            let (x, y) = match point {
                Some(p) => p,
                None => {
                    let vp = viewport_of(tab)?;
                    ((vp.width / 2) as i32, (vp.height / 2) as i32)
                }
            };
            // real wheel input, delivered to whatever is rendered under the pointer
            tab.move_mouse_to_point(Point {
                x: x as f64,
                y: y as f64,
            })?;
            tab.call_method(wheel_event(x, y, delta_y))?;
            Ok(RawOutcome::performed(format!("scrolled {}px at ({}, {})", delta_y, x, y)))
        })
        .await
    }

    async fn input_text(&self, target: &Target, text: &str) -> Result<RawOutcome> {
        // types into whatever holds focus; focusing is a separate click
        let text = text.to_string();
        let target = target.to_string();
        self.on_tab(move |tab| {
            tab.type_str(&text)?;
            Ok(RawOutcome::performed(format!("typed {} chars into {}", text.chars().count(), target)))
        })
        .await
    }

    async fn send_keys(&self, _target: &Target, keys: &str) -> Result<RawOutcome> {
        let keys = keys.to_string();
        self.on_tab(move |tab| {
            let mut parts: Vec<&str> = keys.split('+').map(str::trim).collect();
            let key = match parts.pop() {
                Some(k) if !k.is_empty() => cdp_key(k),
                _ => return Ok(RawOutcome::rejected(format!("no key in '{}'", keys))),
            };
            let mut modifiers = Vec::new();
            for part in parts {
                match modifier(part) {
                    Some(m) => modifiers.push(m),
                    None => return Ok(RawOutcome::rejected(format!("unknown modifier '{}'", part))),
                }
            }
            if modifiers.is_empty() {
                tab.press_key(key)?;
            } else {
                tab.press_key_with_modifiers(key, Some(&modifiers))?;
            }
            Ok(RawOutcome::performed(format!("pressed {}", keys)))
        })
        .await
    }
}

fn viewport_of(tab: &Tab) -> Result<Viewport> {
    let metrics = tab.call_method(Page::GetLayoutMetrics(None))?;
    let layout = metrics.css_layout_viewport;
    Ok(Viewport {
        width: layout.client_width,
        height: layout.client_height,
    })
}

fn wheel_event(x: i32, y: i32, delta_y: i32) -> Input::DispatchMouseEvent {
    Input::DispatchMouseEvent {
        Type: Input::DispatchMouseEventTypeOption::MouseWheel,
        x: x as f64,
        y: y as f64,
        modifiers: None,
        timestamp: None,
        button: None,
        buttons: None,
        click_count: None,
        force: None,
        tangential_pressure: None,
        tilt_x: None,
        tilt_y: None,
        twist: None,
        delta_x: Some(0.0),
        delta_y: Some(delta_y as f64),
        pointer_Type: None,
    }
}

fn cdp_key(name: &str) -> &str {
    match name {
        "Space" => " ",
        other => other,
    }
}

fn modifier(name: &str) -> Option<ModifierKey> {
    match name {
        "Control" => Some(ModifierKey::Ctrl),
        "Shift" => Some(ModifierKey::Shift),
        "Alt" => Some(ModifierKey::Alt),
        "Meta" => Some(ModifierKey::Meta),
        _ => None,
    }
}

fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join(r"Google\Chrome\Application\chrome.exe"));
    }
    // None lets headless_chrome search on its own
    candidates.into_iter().find(|p| p.exists())
}
