//! Demo server exposing the session engine over WebSocket and SSE.
//!
//! Run with: cargo run -p ws-server-demo
//!
//! Then open http://localhost:3000 to watch session events, and drive the
//! engine by sending protocol frames to ws://localhost:3000/ws.
//!
//! `FOLDBACK_CONFIG` points at a TOML config file, `FOLDBACK_ADDR` overrides
//! the bind address.

use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use axum::{
    Router,
    extract::State,
    response::{
        Html,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use foldback_core::{EngineConfig, EventStore};
use foldback_session::{SessionManager, storage};
use foldback_transport::{Dispatcher, websocket::create_ws_router};
use futures::Stream;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::var_os("FOLDBACK_CONFIG") {
        Some(path) => EngineConfig::load(Path::new(&path))
            .with_context(|| format!("loading config from {}", path.to_string_lossy()))?,
        None => EngineConfig::default(),
    };

    let storage = storage::from_config(&config.storage)
        .await
        .context("opening session storage")?;
    let manager = SessionManager::restore(storage, &config)
        .await
        .context("restoring sessions")?;
    let events = manager.events();
    let dispatcher = Dispatcher::new(Arc::new(manager));

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/events", get(events_handler))
        .with_state(events)
        .merge(create_ws_router(dispatcher))
        .layer(CorsLayer::permissive());

    // Start server
    let addr: SocketAddr = std::env::var("FOLDBACK_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".into())
        .parse()
        .context("parsing FOLDBACK_ADDR")?;
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn events_handler(
    State(events): State<Arc<EventStore>>,
) -> Sse<impl Stream<Item = Result<Event, std::io::Error>>> {
    Sse::new(events.sse_stream()).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>foldback - Session Events</title>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: Menlo, Monaco, "Courier New", monospace;
        }
        h1 { color: #fff; font-family: system-ui, sans-serif; margin-bottom: 10px; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        .event { white-space: pre-wrap; margin: 2px 0; }
        .reverted { color: #e5c07b; }
        .child_terminated { color: #e06c75; }
    </style>
</head>
<body>
    <h1>foldback session events</h1>
    <div class="status" id="status">Connecting...</div>
    <div id="events"></div>

    <script>
        const status = document.getElementById('status');
        const list = document.getElementById('events');

        function decode(b64) {
            try { return atob(b64); } catch (e) { return b64; }
        }

        function render(name, data) {
            const line = document.createElement('div');
            line.className = `event ${name}`;
            if (data.content) data.content = decode(data.content);
            if (data.summary) data.summary = decode(data.summary);
            line.textContent = `${name} ${JSON.stringify(data)}`;
            list.appendChild(line);
            window.scrollTo(0, document.body.scrollHeight);
        }

        const source = new EventSource('/events');
        source.onopen = () => {
            status.textContent = 'Connected';
            status.className = 'status connected';
        };
        source.onerror = () => {
            status.textContent = 'Disconnected - reconnecting...';
            status.className = 'status disconnected';
        };
        for (const name of [
            'session_created', 'entry_appended', 'checkpoint_registered',
            'reverted', 'child_spawned', 'child_completed', 'child_terminated',
        ]) {
            source.addEventListener(name, (event) => render(name, JSON.parse(event.data)));
        }
    </script>
</body>
</html>
"#;
