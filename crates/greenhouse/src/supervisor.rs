//! Starts the long-lived loops and owns their timing: sliced waits that
//! react to config changes and shutdown, and backoff after hardware faults.

use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::adc::HardwareError;
use crate::app::App;
use crate::audit::LogRow;
use crate::controller;
use crate::light::run_light_loop;
use crate::sampler::{self, SampleReport};
use crate::state::SensorKind;

/// Longest single sleep; loops re-check their deadline at least this often.
pub const MAX_SLICE: Duration = Duration::from_secs(1);

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The slice elapsed.
    Elapsed,
    /// Config changed.
    Changed,
    Shutdown,
}

/// Sleep for at most `MAX_SLICE` of `dur`, returning early on a config
/// change or shutdown.
pub async fn wait(dur: Duration, changed: &Notify, shutdown: &mut watch::Receiver<bool>) -> Wake {
    if *shutdown.borrow() {
        return Wake::Shutdown;
    }
    tokio::select! {
        _ = tokio::time::sleep(dur.min(MAX_SLICE)) => Wake::Elapsed,
        _ = changed.notified() => Wake::Changed,
        res = shutdown.changed() => {
            if res.is_err() || *shutdown.borrow() {
                Wake::Shutdown
            } else {
                Wake::Changed
            }
        }
    }
}

/// Wait until `deadline`, slice by slice.  `false` on shutdown.
async fn wait_until(deadline: Instant, changed: &Notify, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        if wait(deadline - now, changed, shutdown).await == Wake::Shutdown {
            return false;
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// One scheduled cycle: sample, log, decide.
pub async fn run_cycle(app: &App, kind: SensorKind) -> Result<Option<SampleReport>, HardwareError> {
    let report = sampler::sample(&app.state, &app.bus, kind).await?;
    if let Some(report) = &report {
        app.audit.record(&LogRow::sample(report));
        controller::act(app, report).await;
    }
    Ok(report)
}

/// Sample `kind` every `sample_interval` until shutdown.  The interval is
/// re-read on every wake so edits apply to the pending wait.
pub async fn run_sample_loop(app: App, kind: SensorKind) {
    let mut shutdown = app.shutdown_signal();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let started = Instant::now();
        match run_cycle(&app, kind).await {
            Ok(_) => backoff = INITIAL_BACKOFF,
            Err(e) => {
                error!(group = %kind, retry_secs = backoff.as_secs(), "sample cycle failed: {e}");
                app.state
                    .write()
                    .await
                    .record_error(format!("{kind} sampling failed: {e}"));
                let delay = backoff;
                backoff = next_backoff(backoff);
                if !wait_until(Instant::now() + delay, &app.changed, &mut shutdown).await {
                    break;
                }
                continue;
            }
        }

        loop {
            let interval = app.state.read().await.sample_interval;
            let now = Instant::now();
            let next = started + interval;
            if now >= next {
                break;
            }
            if wait(next - now, &app.changed, &mut shutdown).await == Wake::Shutdown {
                info!(group = %kind, "sample loop stopped");
                return;
            }
        }
    }
    info!(group = %kind, "sample loop stopped");
}

/// Spawn one loop per light and one per non-empty sensor group.
pub async fn spawn_all(app: &App) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    let (lights, groups) = {
        let st = app.state.read().await;
        let groups: Vec<SensorKind> = SensorKind::ALL
            .into_iter()
            .filter(|k| !st.group(*k).sensors.is_empty())
            .collect();
        (st.lights.len(), groups)
    };

    for index in 0..lights {
        tasks.spawn(run_light_loop(app.clone(), index));
    }
    for kind in groups {
        tasks.spawn(run_sample_loop(app.clone(), kind));
    }
    if tasks.is_empty() {
        warn!("nothing configured: no lights and no sensors");
    }
    info!(lights, loops = tasks.len(), "loops started");
    tasks
}

// ===========================================================================
// Tests
// ===========================================================================
