//! Notepad demo server.
//!
//! Serves one synced notepad per client session over `/ws`. Connect with
//! any WebSocket client, answer the `_IDENTIFY` request with
//! `{"type": "_IDENTITY", "data": {"user": "me", "session": "s1"}}` and
//! the full notepad state arrives; actions and tasks drive it from there.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use syncwire::axum_ws::WsTransport;
use syncwire::{Session, SessionRegistry, SyncUnit, TypeSpec, UnitBuilder};

struct AppState {
    registry: SessionRegistry,
    started_at: std::time::Instant,
}

#[derive(Debug, Serialize, Deserialize)]
struct Notepad {
    title: String,
    notes: Vec<String>,
    #[serde(skip)]
    stop_fill: bool,
}

fn build_notepad(_session: &Session) {
    let built = UnitBuilder::new("NOTEPAD")
        .camel_case()
        .typed("title", TypeSpec::String)
        .expose_running_tasks()
        .action(
            "rename",
            &[("title", TypeSpec::String)],
            |unit: SyncUnit<Notepad>, args: Value| async move {
                unit.lock().title = args["title"].as_str().unwrap_or_default().to_string();
                unit.sync().await?;
                Ok(())
            },
        )
        .action(
            "add_note",
            &[("note", TypeSpec::String)],
            |unit: SyncUnit<Notepad>, args: Value| async move {
                let note = args["note"].as_str().unwrap_or_default().to_string();
                unit.lock().notes.push(note);
                unit.sync().await?;
                Ok(())
            },
        )
        .action(
            "clear",
            &[],
            |unit: SyncUnit<Notepad>, _: Value| async move {
                unit.lock().notes.clear();
                unit.sync().await?;
                Ok(())
            },
        )
        .task(
            "fill",
            &[("count", TypeSpec::Int)],
            |unit: SyncUnit<Notepad>, args: Value| async move {
                let count = args["count"].as_u64().unwrap_or(10);
                unit.lock().stop_fill = false;
                for i in 0..count {
                    if unit.lock().stop_fill {
                        break;
                    }
                    unit.lock().notes.push(format!("note {i}"));
                    unit.sync().await?;
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Ok(())
            },
        )
        .task_cancel("fill", |unit: SyncUnit<Notepad>, _: Value| async move {
            unit.lock().stop_fill = true;
            Ok(())
        })
        .build(Notepad {
            title: "Untitled".into(),
            notes: Vec::new(),
            stop_fill: false,
        });

    if let Err(e) = built {
        warn!(error = %e, "failed to register notepad");
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_sessions: usize,
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_sessions: state.registry.len(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let transport = Box::new(WsTransport::new(socket));
        if let Err(e) = state.registry.serve(transport, build_notepad).await {
            warn!(error = %e, "connection ended with error");
        }
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo=info,syncwire=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let state = Arc::new(AppState {
        registry: SessionRegistry::new(),
        started_at: std::time::Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("notepad demo v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
