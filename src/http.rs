//! HTTP status surface: `GET /api/stats` and a small dashboard at `/`

use std::future::Future;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{Html, Json};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::error::Result;
use crate::relay::PLATFORMS;
use crate::stats::{StatsAggregator, StatsSnapshot};

#[derive(Clone)]
pub struct HttpState {
    stats: StatsAggregator,
    rtmp_port: u16,
    app: String,
}

impl HttpState {
    pub fn new(stats: StatsAggregator, rtmp_port: u16, app: impl Into<String>) -> Self {
        Self {
            stats,
            rtmp_port,
            app: app.into(),
        }
    }
}

/// Stats are public, so any origin may poll them
pub fn router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(dashboard))
        .route("/api/stats", get(stats))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: HttpState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "HTTP server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn stats(State(state): State<HttpState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn dashboard(State(state): State<HttpState>, headers: HeaderMap) -> Html<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.rsplit_once(':').map_or(h, |(name, _)| name))
        .unwrap_or("localhost");
    Html(render_dashboard(&state, host, &state.stats.snapshot()))
}

fn render_dashboard(state: &HttpState, host: &str, snapshot: &StatsSnapshot) -> String {
    let ingest_url = escape(&format!("rtmp://{}:{}/{}", host, state.rtmp_port, state.app));

    let mut platforms = String::new();
    for (name, _, env) in PLATFORMS {
        let configured = snapshot
            .active_platforms_list
            .iter()
            .any(|p| p.as_str() == *name);
        let (class, label) = if configured {
            ("on", "configured")
        } else {
            ("off", "not configured")
        };
        platforms.push_str(&format!(
            "<li class=\"{class}\" data-platform=\"{name}\"><b>{name}</b> \
             <span class=\"state\">{label}</span> <small>{env}</small></li>\n"
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>rtmp-fanout</title>
<style>
body {{ font-family: sans-serif; max-width: 720px; margin: 2em auto; color: #222; }}
code {{ background: #eee; padding: 2px 6px; }}
li {{ margin: .4em 0; }}
li.on b {{ color: #1a7f37; }}
li.off b {{ color: #999; }}
.stat {{ font-size: 2em; font-weight: bold; }}
</style>
</head>
<body>
<h1>rtmp-fanout</h1>
<p>Ingest URL: <code>{ingest_url}</code>, stream key of your choice.</p>
<h2>Platforms</h2>
<ul id="platforms">
{platforms}</ul>
<h2>Status</h2>
<p>Active streams: <span class="stat" id="activeStreams">{active}</span></p>
<p>Configured platforms: <span class="stat" id="connectedPlatforms">{configured}</span></p>
<script>
async function refresh() {{
  try {{
    const stats = await (await fetch('/api/stats')).json();
    document.getElementById('activeStreams').textContent = stats.activeStreams;
    document.getElementById('connectedPlatforms').textContent = stats.connectedPlatforms;
    for (const relay of stats.relays) {{
      const item = document.querySelector(`li[data-platform="${{relay.platform}}"] .state`);
      if (item) item.textContent = relay.state + ' (' + relay.stream + ')';
    }}
  }} catch (e) {{}}
}}
setInterval(refresh, 5000);
</script>
</body>
</html>
"#,
        active = snapshot.active_streams,
        configured = snapshot.connected_platforms,
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
