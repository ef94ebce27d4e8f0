use chrono::{DateTime, Local, NaiveTime};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::{
    GreenhouseConfig, LightEntry, PumpEntry, SensorEntry, ServoEntry, Settings, SCHEMA_VERSION,
};
use crate::light::anchor_today;
use crate::parse::hhmm;
use crate::sampler::average;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<Greenhouse>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Runtime model of the greenhouse.  Every read or mutation goes through
/// the `SharedState` lock.
pub struct Greenhouse {
    pub id: String,
    pub started_at: Instant,
    pub settings: Settings,
    pub lights: Vec<Light>,
    pub soil: SensorGroup,
    pub temp: SensorGroup,
    pub moist_min: u16,
    pub temp_min: u16,
    pub temp_max: u16,
    pub sample_interval: Duration,
    pub pump: Option<Pump>,
    pub servos: Vec<Servo>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Light {
    pub id: String,
    pub pin: u8,
    pub active: bool,
    /// Configured window, as times of day.
    #[serde(with = "hhmm")]
    pub on_at: NaiveTime,
    #[serde(with = "hhmm")]
    pub off_at: NaiveTime,
    /// The concrete window currently being tracked.
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Soil,
    Temperature,
}

impl SensorKind {
    pub const ALL: [SensorKind; 2] = [SensorKind::Soil, SensorKind::Temperature];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Soil => "soil",
            SensorKind::Temperature => "temperature",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    pub id: String,
    pub channel: u8,
    pub value: u16,
    pub time: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorGroup {
    pub kind: SensorKind,
    pub sensors: Vec<Sensor>,
    /// Mean of the latest per-sensor values.
    pub value: u16,
    /// Completion time of the latest cycle; never moves backwards.
    pub time: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pump {
    pub id: String,
    pub pin: u8,
    pub run_sec: u64,
    pub running: bool,
    pub last_run: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Servo {
    pub id: String,
    pub pin: u8,
    pub open: bool,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Local>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Light,
    Sample,
    Actuator,
    Config,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub id: String,
    pub uptime_secs: u64,
    pub time: DateTime<Local>,
    pub refresh_rate_sec: u64,
    pub sample_interval_sec: u64,
    pub moist_min: u16,
    pub temp_min: u16,
    pub temp_max: u16,
    pub lights: Vec<Light>,
    pub soil: SensorGroup,
    pub temp: SensorGroup,
    pub pump: Option<Pump>,
    pub servos: Vec<Servo>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SensorGroup {
    fn new(kind: SensorKind, entries: &[SensorEntry]) -> Self {
        Self {
            kind,
            sensors: entries
                .iter()
                .map(|e| Sensor {
                    id: e.id.clone(),
                    channel: e.channel,
                    value: 0,
                    time: None,
                })
                .collect(),
            value: 0,
            time: None,
        }
    }

    /// `(id, channel)` for every sensor, in configured order.
    pub fn channels(&self) -> Vec<(String, u8)> {
        self.sensors
            .iter()
            .map(|s| (s.id.clone(), s.channel))
            .collect()
    }
}

impl Greenhouse {
    pub fn new(config: &GreenhouseConfig, settings: Settings, now: DateTime<Local>) -> Self {
        let lights = config
            .lights
            .iter()
            .map(|l| Light {
                id: l.id.clone(),
                pin: l.pin,
                active: false,
                on_at: l.start,
                off_at: l.end,
                start: anchor_today(l.start, now),
                end: anchor_today(l.end, now),
            })
            .collect();

        let pump = config.pump.as_ref().map(|p| Pump {
            id: p.id.clone(),
            pin: p.pin,
            run_sec: p.run_sec,
            running: false,
            last_run: None,
        });

        let servos = config
            .servos
            .iter()
            .map(|s| Servo {
                id: s.id.clone(),
                pin: s.pin,
                open: false,
            })
            .collect();

        Self {
            id: config.id.clone(),
            started_at: Instant::now(),
            settings,
            lights,
            soil: SensorGroup::new(SensorKind::Soil, &config.soil_sensors),
            temp: SensorGroup::new(SensorKind::Temperature, &config.temp_sensors),
            moist_min: config.moist_min,
            temp_min: config.temp_min,
            temp_max: config.temp_max,
            sample_interval: Duration::from_secs(config.sample_interval_sec),
            pump,
            servos,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Snapshot of the persisted part of the aggregate.
    pub fn to_config(&self) -> GreenhouseConfig {
        GreenhouseConfig {
            version: SCHEMA_VERSION,
            id: self.id.clone(),
            lights: self
                .lights
                .iter()
                .map(|l| LightEntry {
                    id: l.id.clone(),
                    pin: l.pin,
                    start: l.on_at,
                    end: l.off_at,
                })
                .collect(),
            soil_sensors: sensor_entries(&self.soil),
            temp_sensors: sensor_entries(&self.temp),
            moist_min: self.moist_min,
            temp_min: self.temp_min,
            temp_max: self.temp_max,
            sample_interval_sec: self.sample_interval.as_secs(),
            pump: self.pump.as_ref().map(|p| PumpEntry {
                id: p.id.clone(),
                pin: p.pin,
                run_sec: p.run_sec,
            }),
            servos: self
                .servos
                .iter()
                .map(|s| ServoEntry {
                    id: s.id.clone(),
                    pin: s.pin,
                })
                .collect(),
        }
    }

    /// Take over edited values from `config`.  Lights whose window changed
    /// are re-anchored to today; topology (pins, channels) is left alone.
    pub fn apply_config(&mut self, config: &GreenhouseConfig, settings: &Settings, now: DateTime<Local>) {
        self.id = config.id.clone();
        self.settings = settings.clone();
        self.moist_min = config.moist_min;
        self.temp_min = config.temp_min;
        self.temp_max = config.temp_max;
        self.sample_interval = Duration::from_secs(config.sample_interval_sec);

        if let (Some(pump), Some(entry)) = (self.pump.as_mut(), config.pump.as_ref()) {
            pump.run_sec = entry.run_sec;
        }

        for entry in &config.lights {
            let Some(light) = self.lights.iter_mut().find(|l| l.id == entry.id) else {
                continue;
            };
            if light.on_at != entry.start || light.off_at != entry.end {
                light.on_at = entry.start;
                light.off_at = entry.end;
                light.start = anchor_today(entry.start, now);
                light.end = anchor_today(entry.end, now);
            }
        }
    }

    pub fn group(&self, kind: SensorKind) -> &SensorGroup {
        match kind {
            SensorKind::Soil => &self.soil,
            SensorKind::Temperature => &self.temp,
        }
    }

    pub fn group_mut(&mut self, kind: SensorKind) -> &mut SensorGroup {
        match kind {
            SensorKind::Soil => &mut self.soil,
            SensorKind::Temperature => &mut self.temp,
        }
    }

    /// Index of the light named `id`, or the first light when `id` is `None`.
    pub fn light_index(&self, id: Option<&str>) -> Option<usize> {
        match id {
            Some(id) => self.lights.iter().position(|l| l.id == id),
            None if self.lights.is_empty() => None,
            None => Some(0),
        }
    }

    /// Store one cycle's readings and return the new group aggregate.
    pub fn record_sample(
        &mut self,
        kind: SensorKind,
        readings: &[(String, u16)],
        now: DateTime<Local>,
    ) -> u16 {
        let group = self.group_mut(kind);
        for (id, value) in readings {
            if let Some(sensor) = group.sensors.iter_mut().find(|s| &s.id == id) {
                sensor.value = *value;
                sensor.time = Some(now);
            }
        }

        let values: Vec<u16> = group.sensors.iter().map(|s| s.value).collect();
        group.value = average(&values).unwrap_or(0);
        group.time = Some(match group.time {
            Some(prev) if prev > now => prev,
            _ => now,
        });
        let aggregate = group.value;

        let detail = format!(
            "{kind} {aggregate} ({})",
            readings
                .iter()
                .map(|(id, v)| format!("{id}={v}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.push_event(EventKind::Sample, detail);
        aggregate
    }

    /// Record a light switching.
    pub fn record_light(&mut self, light_id: &str, on: bool, reason: &str) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(
            EventKind::Light,
            format!("{light_id} set {state_str} ({reason})"),
        );
    }

    /// Record a pump or servo action.
    pub fn record_actuator(&mut self, detail: String) {
        self.push_event(EventKind::Actuator, detail);
    }

    pub fn record_config(&mut self, detail: String) {
        self.push_event(EventKind::Config, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            id: self.id.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            time: Local::now(),
            refresh_rate_sec: self.settings.refresh_rate_sec,
            sample_interval_sec: self.sample_interval.as_secs(),
            moist_min: self.moist_min,
            temp_min: self.temp_min,
            temp_max: self.temp_max,
            lights: self.lights.clone(),
            soil: self.soil.clone(),
            temp: self.temp.clone(),
            pump: self.pump.clone(),
            servos: self.servos.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Local::now(),
            kind,
            detail,
        });
    }
}

fn sensor_entries(group: &SensorGroup) -> Vec<SensorEntry> {
    group
        .sensors
        .iter()
        .map(|s| SensorEntry {
            id: s.id.clone(),
            channel: s.channel,
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
