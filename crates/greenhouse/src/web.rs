use axum::extract::{Form, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::app::App;
use crate::audit::LogRow;
use crate::config::{GreenhouseConfig, Settings};
use crate::state::SensorKind;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Rows returned by `/api/log` when `n` is not given.
const DEFAULT_LOG_ROWS: usize = 50;
const MAX_LOG_ROWS: usize = 500;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: App) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/log", get(api_log))
        .route("/toggleled", get(toggle_led))
        .route("/soilcheck", get(soil_check))
        .route("/water", get(water))
        .route("/config", get(get_config).post(post_config))
        .route("/config/", get(get_config).post(post_config))
        .route("/stop", get(stop))
        .with_state(app)
}

#[derive(Deserialize)]
struct LightQuery {
    id: Option<String>,
}

#[derive(Deserialize)]
struct LogQuery {
    n: Option<usize>,
}

#[derive(Serialize)]
struct ConfigView {
    settings: Settings,
    greenhouse: GreenhouseConfig,
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(app): State<App>) -> impl IntoResponse {
    let st = app.state.read().await;
    Json(st.to_status())
}

async fn api_log(State(app): State<App>, Query(q): Query<LogQuery>) -> Response {
    let n = q.n.unwrap_or(DEFAULT_LOG_ROWS).min(MAX_LOG_ROWS);
    match app.audit.recent(n) {
        Ok(rows) => Json::<Vec<LogRow>>(rows).into_response(),
        Err(e) => {
            tracing::error!("reading audit log failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
    }
}

async fn toggle_led(State(app): State<App>, Query(q): Query<LightQuery>) -> Response {
    match app.toggle_light(q.id.as_deref()).await {
        Some(_) => Redirect::to("/").into_response(),
        None => (StatusCode::NOT_FOUND, "no such light").into_response(),
    }
}

async fn soil_check(State(app): State<App>) -> Response {
    match app.sample_now(SensorKind::Soil).await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(e) => {
            app.state
                .write()
                .await
                .record_error(format!("forced soil check failed: {e}"));
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn water(State(app): State<App>) -> Response {
    app.manual_water().await;
    Redirect::to("/").into_response()
}

async fn get_config(State(app): State<App>) -> impl IntoResponse {
    let st = app.state.read().await;
    Json(ConfigView {
        settings: st.settings.clone(),
        greenhouse: st.to_config(),
    })
}

async fn post_config(
    State(app): State<App>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    match app.update_config(&form).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            tracing::error!("config update failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
    }
}

async fn stop(State(app): State<App>) -> impl IntoResponse {
    app.stop().await;
    "Shutting down..."
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until `stop` is requested.
pub async fn serve(app: App, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("web ui listening on http://{addr}");

    let mut shutdown = app.shutdown_signal();
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
