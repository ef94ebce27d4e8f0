//! Handles shared by the loops and the HTTP surface, plus the one-shot
//! operations the HTTP surface can force.

use anyhow::Context;
use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::adc::HardwareError;
use crate::audit::{AuditLog, LogRow};
use crate::board::SharedBoard;
use crate::config::{apply_form, ConfigStore, FormOutcome};
use crate::controller;
use crate::sampler::{self, SampleReport, SharedBus};
use crate::state::{SensorKind, SharedState};

#[derive(Clone)]
pub struct App {
    pub state: SharedState,
    pub board: SharedBoard,
    pub bus: SharedBus,
    pub audit: AuditLog,
    pub store: ConfigStore,
    /// Woken when timing-relevant config changes.
    pub changed: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl App {
    pub fn new(
        state: SharedState,
        board: SharedBoard,
        bus: SharedBus,
        audit: AuditLog,
        store: ConfigStore,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            board,
            bus,
            audit,
            store,
            changed: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Receiver that flips to `true` once `stop` has been called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flip a light now.  The schedule takes over again at the next window
    /// boundary.  Returns the new level, or `None` for an unknown light.
    pub async fn toggle_light(&self, id: Option<&str>) -> Option<bool> {
        let (light_id, pin, on) = {
            let mut st = self.state.write().await;
            let index = st.light_index(id)?;
            let light = &mut st.lights[index];
            light.active = !light.active;
            let toggled = (light.id.clone(), light.pin, light.active);
            st.record_light(&toggled.0, toggled.2, "manual toggle");
            toggled
        };
        self.board.lock().await.set_relay(pin, on);
        info!(light = %light_id, on, "light toggled");
        Some(on)
    }

    /// Run a full sample cycle for `kind` immediately, including the
    /// threshold decision.  The loop's own schedule is not touched.
    pub async fn sample_now(&self, kind: SensorKind) -> Result<Option<SampleReport>, HardwareError> {
        let report = sampler::sample(&self.state, &self.bus, kind).await?;
        if let Some(report) = &report {
            self.audit.record(&LogRow::sample(report));
            controller::act(self, report).await;
        }
        Ok(report)
    }

    /// Log a manual watering against the latest soil aggregate.
    pub async fn manual_water(&self) -> u16 {
        let value = {
            let mut st = self.state.write().await;
            let value = st.soil.value;
            st.record_actuator(format!("manual watering (soil {value})"));
            value
        };
        self.audit
            .record(&LogRow::event(Local::now(), "manual watering", value, ""));
        info!(value, "manual watering logged");
        value
    }

    /// Apply config form fields, persist, and wake the loops.
    pub async fn update_config(&self, form: &HashMap<String, String>) -> anyhow::Result<FormOutcome> {
        let mut st = self.state.write().await;
        let mut settings = st.settings.clone();
        let mut config = st.to_config();

        let outcome = apply_form(&mut settings, &mut config, form);
        for msg in &outcome.messages {
            warn!("config form: {msg}");
        }
        if outcome.changed.is_empty() {
            return Ok(outcome);
        }

        // Saved under the lock so concurrent submissions land in order.
        self.store
            .save_settings(&settings)
            .context("failed to save settings")?;
        self.store
            .save_greenhouse(&config)
            .context("failed to save greenhouse config")?;

        st.apply_config(&config, &settings, Local::now());
        st.record_config(format!("updated: {}", outcome.changed.join(", ")));
        drop(st);

        info!(fields = ?outcome.changed, "config updated");
        self.changed.notify_waiters();
        Ok(outcome)
    }

    /// Put every actuator in its safe state and signal all loops to stop.
    pub async fn stop(&self) {
        {
            let mut st = self.state.write().await;
            for light in st.lights.iter_mut() {
                light.active = false;
            }
            for servo in st.servos.iter_mut() {
                servo.open = false;
            }
            if let Some(pump) = st.pump.as_mut() {
                pump.running = false;
            }
            st.record_system("stopping, outputs safe".to_string());
        }
        self.board.lock().await.all_safe();
        self.shutdown.send_replace(true);
        info!("stop requested, outputs in safe state");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
