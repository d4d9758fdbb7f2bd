use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use canvas_pilot::SessionEvent;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

/// Events streamed to the browser via SSE.
#[derive(Clone, Debug)]
pub enum UiEvent {
    Session(SessionEvent),
    /// The typed command could not be turned into a request.
    Rejected { message: String },
}

impl UiEvent {
    fn name(&self) -> &'static str {
        match self {
            UiEvent::Session(event) => match event {
                SessionEvent::Planning { .. } => "planning",
                SessionEvent::Step { .. } => "step",
                SessionEvent::StepFailed { .. } => "step_failed",
                SessionEvent::Waiting { .. } => "waiting",
                SessionEvent::Blocked { .. } => "blocked",
                SessionEvent::Fallback { .. } => "fallback",
                SessionEvent::Finished { .. } => "finished",
                // "error" is reserved by EventSource for connection failures
                SessionEvent::Error { .. } => "session_error",
            },
            UiEvent::Rejected { .. } => "rejected",
        }
    }

    fn payload(&self) -> String {
        let value = match self {
            UiEvent::Session(event) => serde_json::to_value(event),
            UiEvent::Rejected { message } => Ok(serde_json::json!({ "message": message })),
        };
        value.map(|v| v.to_string()).unwrap_or_else(|_| "{}".to_string())
    }

    fn to_sse_event(&self) -> Event {
        Event::default().event(self.name()).data(self.payload())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<UiEvent>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Start the web server on localhost:3000. Returns the shared channels.
pub async fn start_server() -> Result<(mpsc::Receiver<String>, broadcast::Sender<UiEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(1);
    let (event_tx, _) = broadcast::channel::<UiEvent>(64);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    // Try port 3000, fall back to 3001-3009 if in use
    let mut bound = None;
    for p in 3000..3010 {
        if let Ok(l) = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", p)).await {
            bound = Some((l, p));
            break;
        }
    }
    let (listener, port) =
        bound.ok_or_else(|| anyhow!("Could not bind to any port 3000-3009. Stop the old agent first."))?;

    info!("Web UI running at http://localhost:{}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "web UI server stopped");
        }
    });

    Ok((cmd_rx, event_tx))
}

async fn index_handler() -> Html<&'static str> {
    debug!("GET /");
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    info!(command = %payload.command, "POST /command");
    let _ = state.cmd_tx.send(payload.command).await;
    "ok"
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<UiEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Canvas Pilot</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font: 14px system-ui, sans-serif; max-width: 800px; margin: 0 auto; padding: 24px; }
  #log { height: 70vh; overflow-y: auto; }
  .row { padding: 6px 10px; margin: 4px 0; border-left: 3px solid #3b82f6; font-family: monospace; }
  .row.note { border-color: #f59e0b; }
  .row.bad { border-color: #ef4444; color: #fca5a5; }
  .row.good { border-color: #22c55e; color: #86efac; }
  form { display: flex; gap: 8px; }
  input { flex: 1; padding: 10px; background: #111118; color: #fff; border: 1px solid #333; }
</style>
</head>
<body>
<h1>Canvas Pilot</h1>
<div id="log"></div>
<form id="f"><input id="cmd" placeholder="enter email me@example.com, press Enter" autofocus><button>Run</button></form>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const add = (cls, text) => {
    const row = document.createElement('div');
    row.className = 'row ' + cls;
    row.textContent = text;
    log.appendChild(row);
    log.scrollTop = log.scrollHeight;
  };
  const busy = b => { cmd.disabled = b; if (!b) cmd.focus(); };

  document.getElementById('f').onsubmit = e => {
    e.preventDefault();
    const text = cmd.value.trim();
    if (!text) return;
    cmd.value = '';
    add('note', '> ' + text);
    busy(true);
    fetch('/command', { method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify({command: text}) });
  };

  const outcome = o => o.outcome === 'completed' ? 'completed'
    : o.outcome === 'aborted' ? 'aborted: ' + o.detail
    : 'failed: ' + o.detail.reason + ' (saw ' + o.detail.observed + ')';

  const render = {
    planning: d => ['note', 'planning cycle ' + d.cycle],
    step: d => ['', d.number + '. ' + d.description + (d.origin.origin === 'planned' ? '' : ' [' + d.origin.origin + ']')],
    step_failed: d => ['bad', 'not confirmed: ' + d.message],
    waiting: d => ['note', 'waiting ' + d.millis + 'ms'],
    blocked: d => ['note', 'blocked: ' + d.detail],
    fallback: d => ['note', 'fallback: ' + d.description],
    finished: d => [d.outcome.outcome === 'completed' ? 'good' : 'bad', outcome(d.outcome)],
    session_error: d => ['bad', 'session stopped: ' + d.message],
    rejected: d => ['bad', 'request rejected: ' + d.message],
  };
  const es = new EventSource('/events');
  for (const [name, fmt] of Object.entries(render)) {
    es.addEventListener(name, e => {
      const [cls, text] = fmt(JSON.parse(e.data));
      add(cls, text);
      if (name === 'finished' || name === 'session_error' || name === 'rejected') busy(false);
    });
  }
</script>
</body>
</html>
"##;
