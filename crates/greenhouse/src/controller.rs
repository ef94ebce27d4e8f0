//! Threshold decisions run after every sample cycle, and the actuator
//! commands they lead to.

use chrono::Local;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::audit::LogRow;
use crate::sampler::SampleReport;
use crate::state::SensorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoCommand {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Idle,
    Water,
    Servos(ServoCommand),
}

/// Water when the soil aggregate is at or below the minimum.
pub fn decide_soil(aggregate: u16, moist_min: u16) -> Action {
    if aggregate <= moist_min {
        Action::Water
    } else {
        Action::Idle
    }
}

/// Open above `max`, close below `min`, hold in between.  No hysteresis.
pub fn decide_temperature(aggregate: u16, min: u16, max: u16) -> Action {
    if aggregate > max {
        Action::Servos(ServoCommand::Open)
    } else if aggregate < min {
        Action::Servos(ServoCommand::Close)
    } else {
        Action::Idle
    }
}

/// Evaluate a finished cycle against the current thresholds and act.
pub async fn act(app: &App, report: &SampleReport) -> Action {
    let action = {
        let st = app.state.read().await;
        match report.kind {
            SensorKind::Soil => decide_soil(report.aggregate, st.moist_min),
            SensorKind::Temperature => {
                decide_temperature(report.aggregate, st.temp_min, st.temp_max)
            }
        }
    };

    match action {
        Action::Idle => {}
        Action::Water => {
            if start_pump(app, report.aggregate).await {
                app.audit.record(&LogRow::event(
                    report.time,
                    "pump",
                    report.aggregate,
                    "moisture at or below minimum",
                ));
            }
        }
        Action::Servos(cmd) => set_servos(app, cmd, report.aggregate).await,
    }
    action
}

/// Switch the pump on and schedule it off after its run time.  Returns
/// `false` when there is no pump or it is already running.
pub async fn start_pump(app: &App, value: u16) -> bool {
    let (id, pin, run) = {
        let mut st = app.state.write().await;
        let Some(pump) = st.pump.as_mut() else {
            warn!(value, "moisture low but no pump configured");
            return false;
        };
        if pump.running {
            debug!(pump = %pump.id, "pump already running");
            return false;
        }
        pump.running = true;
        pump.last_run = Some(Local::now());
        let claimed = (pump.id.clone(), pump.pin, Duration::from_secs(pump.run_sec));
        st.record_actuator(format!("{} on for {}s (value {value})", claimed.0, claimed.2.as_secs()));
        claimed
    };

    app.board.lock().await.set_relay(pin, true);
    info!(pump = %id, value, run_secs = run.as_secs(), "pump on");

    let app = app.clone();
    tokio::spawn(async move {
        let mut shutdown = app.shutdown_signal();
        tokio::select! {
            _ = tokio::time::sleep(run) => {}
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
        app.board.lock().await.set_relay(pin, false);
        let mut st = app.state.write().await;
        if let Some(pump) = st.pump.as_mut() {
            pump.running = false;
        }
        st.record_actuator(format!("{id} off"));
        info!(pump = %id, "pump off");
    });
    true
}

/// Drive every servo to `cmd`.  Servos already there are left alone.
pub async fn set_servos(app: &App, cmd: ServoCommand, value: u16) {
    let open = cmd == ServoCommand::Open;
    let targets: Vec<(String, u8)> = {
        let mut st = app.state.write().await;
        let mut targets = Vec::new();
        for servo in st.servos.iter_mut() {
            if servo.open == open {
                debug!(servo = %servo.id, open, "servo already in position");
            } else {
                servo.open = open;
                targets.push((servo.id.clone(), servo.pin));
            }
        }
        targets
    };
    if targets.is_empty() {
        return;
    }

    let verb = if open { "open" } else { "close" };
    let mut failed = Vec::new();
    {
        let mut board = app.board.lock().await;
        for (id, pin) in &targets {
            if let Err(e) = board.set_servo(*pin, open) {
                warn!(servo = %id, "servo {verb} failed: {e}");
                failed.push(format!("{id}: {e}"));
            }
        }
    }

    let names: Vec<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
    info!(servos = ?names, value, "servos {verb}");
    app.audit.record(&LogRow::event(
        Local::now(),
        "servos",
        value,
        format!("{verb} {}", names.join(";")),
    ));

    let mut st = app.state.write().await;
    st.record_actuator(format!("servos {verb} ({}) at {value}", names.join(", ")));
    for f in failed {
        st.record_error(format!("servo {verb} failed: {f}"));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
