mod adc;
mod app;
mod audit;
mod board;
mod config;
mod controller;
mod light;
mod parse;
mod sampler;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod supervisor;
mod web;

#[cfg(all(not(feature = "gpio"), not(feature = "sim")))]
compile_error!("enable the `gpio` feature for hardware or `sim` for development");

use anyhow::{Context, Result};
use chrono::Local;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use app::App;
use audit::AuditLog;
use board::Board;
use config::ConfigStore;
use state::Greenhouse;

/// How long to wait for loops to finish after a stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let log_path = env::var("LOG_PATH").unwrap_or_else(|_| "greenhouse_log.csv".to_string());

    // ── Config files ────────────────────────────────────────────────
    let store = ConfigStore::new(&config_dir);
    let settings = store.load_settings()?;
    let greenhouse = store.load_greenhouse()?;

    info!(
        id = %greenhouse.id,
        lights = greenhouse.lights.len(),
        soil_sensors = greenhouse.soil_sensors.len(),
        temp_sensors = greenhouse.temp_sensors.len(),
        servos = greenhouse.servos.len(),
        pump = greenhouse.pump.is_some(),
        "greenhouse loaded"
    );

    // ── Outputs ─────────────────────────────────────────────────────
    let relay_pins: Vec<u8> = greenhouse
        .lights
        .iter()
        .map(|l| l.pin)
        .chain(greenhouse.pump.iter().map(|p| p.pin))
        .collect();
    let servo_pins: Vec<u8> = greenhouse.servos.iter().map(|s| s.pin).collect();

    let mut board = Board::new(&relay_pins, &servo_pins, settings.relay_active_low)
        .context("failed to initialise GPIO outputs")?;
    board.all_safe();

    // ── ADC bus ─────────────────────────────────────────────────────
    #[cfg(feature = "gpio")]
    let bus = sampler::shared_bus(adc::Mcp3008::new());
    #[cfg(not(feature = "gpio"))]
    let bus = sampler::shared_bus(sim::SimBus::new(adc::MAX_READING / 2));

    // ── Shared state ────────────────────────────────────────────────
    let port = settings.port;
    let state = Arc::new(RwLock::new(Greenhouse::new(
        &greenhouse,
        settings,
        Local::now(),
    )));
    state
        .write()
        .await
        .record_system("controller started".to_string());

    let audit = AuditLog::new(&log_path);
    info!(path = %audit.path().display(), "audit log");

    let app = App::new(state, Arc::new(Mutex::new(board)), bus, audit, store);

    // ── Loops ───────────────────────────────────────────────────────
    let mut tasks = supervisor::spawn_all(&app).await;

    // ── Web server ──────────────────────────────────────────────────
    let web_app = app.clone();
    let mut web = tokio::spawn(async move { web::serve(web_app, port).await });

    let mut stopped = app.shutdown_signal();
    let mut web_failure = None;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for ctrl-c: {e}");
            }
            info!("interrupt received");
        }
        _ = stopped.wait_for(|stop| *stop) => {}
        res = &mut web => {
            match res {
                Ok(Ok(())) => warn!("web server exited"),
                Ok(Err(e)) => {
                    error!("web server failed: {e:#}");
                    web_failure = Some(e);
                }
                Err(e) => {
                    error!("web server task panicked: {e}");
                    web_failure = Some(anyhow::anyhow!("web server task panicked: {e}"));
                }
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    if !app.is_stopping() {
        app.stop().await;
    }

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("loop task failed: {e}");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("loops did not stop in time, aborting");
        tasks.abort_all();
    }
    if !web.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, &mut web).await;
    }

    // A loop may have written an output after the first stop.
    app.board.lock().await.all_safe();
    info!("stopped");
    match web_failure {
        Some(e) => Err(e.context("web server failed")),
        None => Ok(()),
    }
}
