//! JSON config files: process settings (`config.json`) and greenhouse
//! topology (`greenhouse.json`).  Loading, validation, atomic saving, and
//! the per-field updates accepted from the config form.

use chrono::NaiveTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::adc::{MAX_CHANNEL, MAX_READING};
use crate::parse::{format_duration, hhmm, parse_duration, parse_hhmm};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

pub const SETTINGS_FILE: &str = "config.json";
pub const GREENHOUSE_FILE: &str = "greenhouse.json";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    /// Auto-refresh period of the status page.
    pub refresh_rate_sec: u64,
    pub port: u16,
    pub relay_active_low: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            refresh_rate_sec: 30,
            port: 8081,
            relay_active_low: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GreenhouseConfig {
    pub version: u32,
    pub id: String,
    pub lights: Vec<LightEntry>,
    pub soil_sensors: Vec<SensorEntry>,
    pub temp_sensors: Vec<SensorEntry>,
    /// Pump triggers when the soil aggregate is at or below this value.
    pub moist_min: u16,
    pub temp_min: u16,
    pub temp_max: u16,
    pub sample_interval_sec: u64,
    pub pump: Option<PumpEntry>,
    pub servos: Vec<ServoEntry>,
}

impl Default for GreenhouseConfig {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            id: "Greenhouse".to_string(),
            lights: Vec::new(),
            soil_sensors: Vec::new(),
            temp_sensors: Vec::new(),
            moist_min: 0,
            temp_min: 0,
            temp_max: MAX_READING,
            sample_interval_sec: 1800,
            pump: None,
            servos: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightEntry {
    pub id: String,
    pub pin: u8,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub channel: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEntry {
    pub id: String,
    pub pin: u8,
    pub run_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoEntry {
    pub id: String,
    pub pin: u8,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is corrupt, fix or delete the file: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(
        "{} has schema version {found}, this build supports up to {}",
        .path.display(),
        SCHEMA_VERSION
    )]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error(
        "invalid config {}:\n  - {}",
        .path.display(),
        .errors.join("\n  - ")
    )]
    Invalid { path: PathBuf, errors: Vec<String> },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// SPI0 pins (MISO, MOSI, SCLK, CE0, CE1) are taken by the ADC.
const SPI0_PINS: &[u8] = &[7, 8, 9, 10, 11];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

trait Versioned {
    fn version(&self) -> u32;
    fn validate(&self) -> Result<(), Vec<String>>;
}

impl Versioned for Settings {
    fn version(&self) -> u32 {
        self.version
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.refresh_rate_sec == 0 {
            errors.push("refresh_rate_sec must be positive".to_string());
        }
        if self.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Versioned for GreenhouseConfig {
    fn version(&self) -> u32 {
        self.version
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        GreenhouseConfig::validate(self)
    }
}

impl GreenhouseConfig {
    /// Validate every entry, reporting all violations rather than the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id is empty".to_string());
        }

        self.validate_outputs(&mut errors);
        validate_sensors("soil_sensors", &self.soil_sensors, &mut errors);
        validate_sensors("temp_sensors", &self.temp_sensors, &mut errors);

        // ── Thresholds ──────────────────────────────────────
        for (name, v) in [
            ("moist_min", self.moist_min),
            ("temp_min", self.temp_min),
            ("temp_max", self.temp_max),
        ] {
            if v > MAX_READING {
                errors.push(format!("{name} {v} out of ADC range [0, {MAX_READING}]"));
            }
        }
        if self.temp_min > self.temp_max {
            errors.push(format!(
                "temp_min ({}) must not exceed temp_max ({})",
                self.temp_min, self.temp_max
            ));
        }
        if self.sample_interval_sec == 0 {
            errors.push("sample_interval_sec must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_outputs(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<u8> = HashSet::new();
        let mut check_pin = |ctx: &str, pin: u8, errors: &mut Vec<String>| {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{ctx}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if SPI0_PINS.contains(&pin) {
                errors.push(format!("{ctx}: pin {pin} is reserved for the SPI bus"));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("{ctx}: pin {pin} is already used by another output"));
            }
        };

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, l) in self.lights.iter().enumerate() {
            let ctx = entry_ctx("lights", i, &l.id);
            check_id(&ctx, &l.id, &mut seen_ids, errors);
            check_pin(&ctx, l.pin, &mut *errors);
            if l.start >= l.end {
                errors.push(format!(
                    "{ctx}: start ({}) must be before end ({})",
                    l.start.format("%H:%M"),
                    l.end.format("%H:%M")
                ));
            }
        }

        if let Some(p) = &self.pump {
            let ctx = format!("pump '{}'", p.id);
            if p.id.trim().is_empty() {
                errors.push("pump: id is empty".to_string());
            }
            check_pin(&ctx, p.pin, &mut *errors);
            if p.run_sec == 0 {
                errors.push(format!("{ctx}: run_sec must be positive"));
            }
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, s) in self.servos.iter().enumerate() {
            let ctx = entry_ctx("servos", i, &s.id);
            check_id(&ctx, &s.id, &mut seen_ids, errors);
            check_pin(&ctx, s.pin, &mut *errors);
        }
    }
}

fn entry_ctx(list: &str, i: usize, id: &str) -> String {
    if id.trim().is_empty() {
        format!("{list}[{i}]")
    } else {
        format!("{list} '{id}'")
    }
}

fn check_id<'a>(ctx: &str, id: &'a str, seen: &mut HashSet<&'a str>, errors: &mut Vec<String>) {
    if id.trim().is_empty() {
        errors.push(format!("{ctx}: id is empty"));
    } else if !seen.insert(id) {
        errors.push(format!("{ctx}: duplicate id"));
    }
}

fn validate_sensors(list: &str, sensors: &[SensorEntry], errors: &mut Vec<String>) {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for (i, s) in sensors.iter().enumerate() {
        let ctx = entry_ctx(list, i, &s.id);
        check_id(&ctx, &s.id, &mut seen_ids, errors);
        if s.channel > MAX_CHANNEL {
            errors.push(format!(
                "{ctx}: channel {} out of MCP3008 range [0, {MAX_CHANNEL}]",
                s.channel
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load + save
// ---------------------------------------------------------------------------

/// Location of the two config files.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    pub fn greenhouse_path(&self) -> PathBuf {
        self.dir.join(GREENHOUSE_FILE)
    }

    pub fn load_settings(&self) -> Result<Settings, ConfigError> {
        load_or_create(&self.settings_path())
    }

    pub fn load_greenhouse(&self) -> Result<GreenhouseConfig, ConfigError> {
        load_or_create(&self.greenhouse_path())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), ConfigError> {
        write_atomic(&self.settings_path(), settings)
    }

    pub fn save_greenhouse(&self, config: &GreenhouseConfig) -> Result<(), ConfigError> {
        write_atomic(&self.greenhouse_path(), config)
    }
}

/// Read, parse, and validate a config file.  A missing file is replaced by
/// a blank default, which is written back so it can be edited.
fn load_or_create<T>(path: &Path) -> Result<T, ConfigError>
where
    T: Versioned + Default + Serialize + DeserializeOwned,
{
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file does not exist, creating blank");
        let blank = T::default();
        write_atomic(path, &blank)?;
        return Ok(blank);
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: T = serde_json::from_str(&contents).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    if value.version() > SCHEMA_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: value.version(),
        });
    }
    value.validate().map_err(|errors| ConfigError::Invalid {
        path: path.to_path_buf(),
        errors,
    })?;

    tracing::info!(path = %path.display(), "config loaded");
    Ok(value)
}

/// Write `value` as pretty JSON to a sibling temp file, then rename it over
/// `path` so readers never observe a half-written file.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, json).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Config form
// ---------------------------------------------------------------------------

/// Result of applying a submitted config form.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FormOutcome {
    /// Fields that were accepted and applied.
    pub changed: Vec<String>,
    /// One line per rejected field or notice.
    pub messages: Vec<String>,
}

impl FormOutcome {
    fn accept(&mut self, field: &str) {
        self.changed.push(field.to_string());
    }

    fn reject(&mut self, field: &str, reason: impl std::fmt::Display) {
        self.messages.push(format!("{field}: {reason}, not saved"));
    }
}

const FORM_FIELDS: &[&str] = &[
    "id",
    "refresh_rate",
    "sample_interval",
    "pump_run",
    "moist_min",
    "temp_min",
    "temp_max",
    "light",
    "light_start",
    "light_end",
    "port",
];

const REFRESH_RANGE: (Duration, Duration) = (Duration::from_secs(1), Duration::from_secs(3600));
const SAMPLE_RANGE: (Duration, Duration) = (Duration::from_secs(1), Duration::from_secs(86_400));
const PUMP_RANGE: (Duration, Duration) = (Duration::from_secs(1), Duration::from_secs(600));

fn duration_in(raw: &str, (lo, hi): (Duration, Duration)) -> Result<Duration, String> {
    let d = parse_duration(raw)?;
    if d < lo || d > hi {
        return Err(format!(
            "{} outside [{}, {}]",
            format_duration(d),
            format_duration(lo),
            format_duration(hi)
        ));
    }
    Ok(d)
}

fn reading(raw: &str) -> Result<u16, String> {
    let v: u16 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a whole number", raw.trim()))?;
    if v > MAX_READING {
        return Err(format!("{v} outside [0, {MAX_READING}]"));
    }
    Ok(v)
}

/// Apply submitted form fields to `settings` and `config`.
///
/// Every field is validated on its own: invalid fields are skipped with a
/// message while valid ones are still applied.  Empty values mean "not
/// submitted".  Paired fields (`temp_min`/`temp_max`,
/// `light_start`/`light_end`) are also checked against each other.
pub fn apply_form(
    settings: &mut Settings,
    config: &mut GreenhouseConfig,
    form: &HashMap<String, String>,
) -> FormOutcome {
    let mut out = FormOutcome::default();
    let field = |name: &str| {
        form.get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };

    let mut unknown: Vec<&String> = form
        .keys()
        .filter(|k| !FORM_FIELDS.contains(&k.as_str()))
        .collect();
    unknown.sort();
    for k in unknown {
        out.messages.push(format!("{k}: unknown field ignored"));
    }

    if let Some(v) = field("id") {
        config.id = v.to_string();
        out.accept("id");
    }

    if let Some(v) = field("refresh_rate") {
        match duration_in(v, REFRESH_RANGE) {
            Ok(d) => {
                settings.refresh_rate_sec = d.as_secs();
                out.accept("refresh_rate");
            }
            Err(e) => out.reject("refresh_rate", e),
        }
    }

    if let Some(v) = field("sample_interval") {
        match duration_in(v, SAMPLE_RANGE) {
            Ok(d) => {
                config.sample_interval_sec = d.as_secs();
                out.accept("sample_interval");
            }
            Err(e) => out.reject("sample_interval", e),
        }
    }

    if let Some(v) = field("pump_run") {
        match (duration_in(v, PUMP_RANGE), config.pump.as_mut()) {
            (Ok(d), Some(pump)) => {
                pump.run_sec = d.as_secs();
                out.accept("pump_run");
            }
            (Ok(_), None) => out.reject("pump_run", "no pump configured"),
            (Err(e), _) => out.reject("pump_run", e),
        }
    }

    if let Some(v) = field("moist_min") {
        match reading(v) {
            Ok(n) => {
                config.moist_min = n;
                out.accept("moist_min");
            }
            Err(e) => out.reject("moist_min", e),
        }
    }

    // ── Temperature band ────────────────────────────────────────
    let temp_min = field("temp_min").map(reading);
    let temp_max = field("temp_max").map(reading);
    if let Some(Err(e)) = &temp_min {
        out.reject("temp_min", e);
    }
    if let Some(Err(e)) = &temp_max {
        out.reject("temp_max", e);
    }
    let new_min = match &temp_min {
        Some(Ok(v)) => Some(*v),
        _ => None,
    };
    let new_max = match &temp_max {
        Some(Ok(v)) => Some(*v),
        _ => None,
    };
    if new_min.is_some() || new_max.is_some() {
        let lo = new_min.unwrap_or(config.temp_min);
        let hi = new_max.unwrap_or(config.temp_max);
        if lo > hi {
            let reason = format!("temp_min ({lo}) must not exceed temp_max ({hi})");
            for (name, v) in [("temp_min", new_min), ("temp_max", new_max)] {
                if v.is_some() {
                    out.reject(name, &reason);
                }
            }
        } else {
            if let Some(v) = new_min {
                config.temp_min = v;
                out.accept("temp_min");
            }
            if let Some(v) = new_max {
                config.temp_max = v;
                out.accept("temp_max");
            }
        }
    }

    // ── Light window ────────────────────────────────────────────
    let start = field("light_start").map(parse_hhmm);
    let end = field("light_end").map(parse_hhmm);
    if start.is_some() || end.is_some() {
        let target = match field("light") {
            Some(id) => config.lights.iter().position(|l| l.id == id),
            None if config.lights.is_empty() => None,
            None => Some(0),
        };
        match target {
            None => {
                let reason = match field("light") {
                    Some(id) => format!("unknown light '{id}'"),
                    None => "no light configured".to_string(),
                };
                for (name, v) in [("light_start", &start), ("light_end", &end)] {
                    if v.is_some() {
                        out.reject(name, &reason);
                    }
                }
            }
            Some(idx) => {
                if let Some(Err(e)) = &start {
                    out.reject("light_start", e);
                }
                if let Some(Err(e)) = &end {
                    out.reject("light_end", e);
                }
                let new_start = start.as_ref().and_then(|r| r.as_ref().ok().copied());
                let new_end = end.as_ref().and_then(|r| r.as_ref().ok().copied());
                let light = &mut config.lights[idx];
                let s = new_start.unwrap_or(light.start);
                let e = new_end.unwrap_or(light.end);
                if new_start.is_none() && new_end.is_none() {
                    // Nothing parsed.
                } else if s >= e {
                    let reason = format!(
                        "start ({}) must be before end ({})",
                        s.format("%H:%M"),
                        e.format("%H:%M")
                    );
                    for (name, v) in [("light_start", new_start), ("light_end", new_end)] {
                        if v.is_some() {
                            out.reject(name, &reason);
                        }
                    }
                } else {
                    if new_start.is_some() {
                        light.start = s;
                        out.accept("light_start");
                    }
                    if new_end.is_some() {
                        light.end = e;
                        out.accept("light_end");
                    }
                }
            }
        }
    }

    if let Some(v) = field("port") {
        match v.parse::<u16>() {
            Ok(p) if p > 0 => {
                settings.port = p;
                out.accept("port");
                out.messages
                    .push("port: change takes effect after restart".to_string());
            }
            _ => out.reject("port", format!("'{v}' is not a port number (1-65535)")),
        }
    }

    out
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -- Helpers ----------------------------------------------------------

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn valid_config() -> GreenhouseConfig {
        GreenhouseConfig {
            id: "My Greenhouse".into(),
            lights: vec![LightEntry {
                id: "Main Led".into(),
                pin: 23,
                start: hm(8, 30),
                end: hm(21, 45),
            }],
            soil_sensors: vec![
                SensorEntry { id: "Left".into(), channel: 2 },
                SensorEntry { id: "Middle".into(), channel: 1 },
                SensorEntry { id: "Right".into(), channel: 0 },
            ],
            temp_sensors: vec![SensorEntry { id: "Air".into(), channel: 3 }],
            moist_min: 1000,
            temp_min: 400,
            temp_max: 600,
            sample_interval_sec: 1800,
            pump: Some(PumpEntry {
                id: "Pump".into(),
                pin: 24,
                run_sec: 30,
            }),
            servos: vec![ServoEntry { id: "Roof".into(), pin: 18 }],
            ..GreenhouseConfig::default()
        }
    }

    fn assert_validation_err(cfg: &GreenhouseConfig, needle: &str) {
        let errors = cfg.validate().unwrap_err();
        assert!(
            errors.iter().any(|e| e.contains(needle)),
            "expected error containing {needle:?}, got: {errors:?}"
        );
    }

    /// Fresh, empty directory under the system temp dir.
    fn temp_store() -> ConfigStore {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "greenhouse-config-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        ConfigStore::new(dir)
    }

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_greenhouse() {
        let json = r#"{
            "id": "gh",
            "lights": [{"id": "main", "pin": 23, "start": "08:30", "end": "21:45"}],
            "soil_sensors": [{"id": "left", "channel": 0}]
        }"#;
        let cfg: GreenhouseConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.version, SCHEMA_VERSION);
        assert_eq!(cfg.lights[0].start, hm(8, 30));
        assert_eq!(cfg.sample_interval_sec, 1800);
        assert!(cfg.pump.is_none());
        assert!(cfg.temp_sensors.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_empty_object_gives_defaults() {
        let cfg: GreenhouseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, GreenhouseConfig::default());
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn light_times_serialize_as_hhmm() {
        let json = serde_json::to_value(valid_config()).unwrap();
        assert_eq!(json["lights"][0]["start"], "08:30");
        assert_eq!(json["lights"][0]["end"], "21:45");
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
        GreenhouseConfig::default().validate().unwrap();
    }

    #[test]
    fn light_start_must_precede_end() {
        let mut cfg = valid_config();
        cfg.lights[0].start = hm(22, 0);
        assert_validation_err(&cfg, "must be before end");
    }

    #[test]
    fn duplicate_light_id_rejected() {
        let mut cfg = valid_config();
        let mut second = cfg.lights[0].clone();
        second.pin = 25;
        cfg.lights.push(second);
        assert_validation_err(&cfg, "duplicate id");
    }

    #[test]
    fn shared_output_pin_rejected() {
        let mut cfg = valid_config();
        cfg.servos[0].pin = 23;
        assert_validation_err(&cfg, "already used by another output");
    }

    #[test]
    fn reserved_and_invalid_pins_rejected() {
        let mut cfg = valid_config();
        cfg.lights[0].pin = 1;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");

        let mut cfg = valid_config();
        cfg.lights[0].pin = 10;
        assert_validation_err(&cfg, "reserved for the SPI bus");
    }

    #[test]
    fn sensor_channel_out_of_range() {
        let mut cfg = valid_config();
        cfg.soil_sensors[0].channel = 8;
        assert_validation_err(&cfg, "out of MCP3008 range");
    }

    #[test]
    fn empty_sensor_id_rejected() {
        let mut cfg = valid_config();
        cfg.temp_sensors[0].id = " ".into();
        assert_validation_err(&cfg, "temp_sensors[0]: id is empty");
    }

    #[test]
    fn thresholds_checked() {
        let mut cfg = valid_config();
        cfg.temp_min = 700;
        assert_validation_err(&cfg, "must not exceed temp_max");

        let mut cfg = valid_config();
        cfg.moist_min = MAX_READING + 1;
        assert_validation_err(&cfg, "moist_min");
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut cfg = valid_config();
        cfg.sample_interval_sec = 0;
        cfg.pump.as_mut().unwrap().run_sec = 0;
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2, "{errors:?}");
    }

    // -- Load / save ------------------------------------------------------

    #[test]
    fn missing_files_are_created_blank() {
        let store = temp_store();
        let settings = store.load_settings().unwrap();
        let gh = store.load_greenhouse().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(gh, GreenhouseConfig::default());
        assert!(store.settings_path().exists());
        assert!(store.greenhouse_path().exists());

        // Second load reads the files back.
        assert_eq!(store.load_greenhouse().unwrap(), gh);
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = temp_store();
        let cfg = valid_config();
        store.save_greenhouse(&cfg).unwrap();
        assert_eq!(store.load_greenhouse().unwrap(), cfg);

        let settings = Settings {
            refresh_rate_sec: 10,
            port: 9000,
            relay_active_low: false,
            ..Settings::default()
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), settings);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let store = temp_store();
        store.save_greenhouse(&valid_config()).unwrap();
        let mut tmp = store.greenhouse_path().into_os_string();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
    }

    #[test]
    fn malformed_file_names_the_file() {
        let store = temp_store();
        store.save_greenhouse(&valid_config()).unwrap();
        std::fs::write(store.greenhouse_path(), "{ not json").unwrap();
        let err = store.load_greenhouse().unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
        assert!(err.to_string().contains(GREENHOUSE_FILE), "{err}");
    }

    #[test]
    fn newer_schema_version_rejected() {
        let store = temp_store();
        let cfg = GreenhouseConfig {
            version: SCHEMA_VERSION + 1,
            ..GreenhouseConfig::default()
        };
        store.save_greenhouse(&cfg).unwrap();
        let err = store.load_greenhouse().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found, .. } if found == SCHEMA_VERSION + 1));
    }

    #[test]
    fn invalid_contents_rejected_at_load() {
        let store = temp_store();
        let mut cfg = valid_config();
        cfg.lights[0].end = hm(7, 0);
        store.save_greenhouse(&cfg).unwrap();
        let err = store.load_greenhouse().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("must be before end"), "{err}");
    }

    // -- Form -------------------------------------------------------------

    #[test]
    fn form_applies_valid_fields() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(
            &mut settings,
            &mut cfg,
            &form(&[
                ("refresh_rate", "1m"),
                ("sample_interval", "1h30m"),
                ("pump_run", "45s"),
                ("moist_min", "900"),
                ("light_start", "07:00"),
                ("light_end", "20:00"),
            ]),
        );
        assert!(out.messages.is_empty(), "{:?}", out.messages);
        assert_eq!(settings.refresh_rate_sec, 60);
        assert_eq!(cfg.sample_interval_sec, 5400);
        assert_eq!(cfg.pump.as_ref().unwrap().run_sec, 45);
        assert_eq!(cfg.moist_min, 900);
        assert_eq!(cfg.lights[0].start, hm(7, 0));
        assert_eq!(cfg.lights[0].end, hm(20, 0));
        assert_eq!(out.changed.len(), 6);
    }

    #[test]
    fn form_skips_invalid_field_but_saves_the_rest() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(
            &mut settings,
            &mut cfg,
            &form(&[("moist_min", "lots"), ("sample_interval", "10m")]),
        );
        assert_eq!(cfg.moist_min, 1000);
        assert_eq!(cfg.sample_interval_sec, 600);
        assert_eq!(out.changed, vec!["sample_interval".to_string()]);
        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].starts_with("moist_min:"), "{:?}", out.messages);
    }

    #[test]
    fn form_empty_values_are_ignored() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(&mut settings, &mut cfg, &form(&[("moist_min", ""), ("id", "  ")]));
        assert!(out.changed.is_empty());
        assert!(out.messages.is_empty());
        assert_eq!(cfg, valid_config());
    }

    #[test]
    fn form_rejects_out_of_range_values() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(
            &mut settings,
            &mut cfg,
            &form(&[("refresh_rate", "2h"), ("moist_min", "20000"), ("port", "0")]),
        );
        assert!(out.changed.is_empty());
        assert_eq!(out.messages.len(), 3, "{:?}", out.messages);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn form_temp_band_checked_against_current_values() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        // Current max is 600.
        let out = apply_form(&mut settings, &mut cfg, &form(&[("temp_min", "650")]));
        assert_eq!(cfg.temp_min, 400);
        assert!(out.messages[0].contains("must not exceed"), "{:?}", out.messages);

        let out = apply_form(
            &mut settings,
            &mut cfg,
            &form(&[("temp_min", "650"), ("temp_max", "700")]),
        );
        assert!(out.messages.is_empty(), "{:?}", out.messages);
        assert_eq!((cfg.temp_min, cfg.temp_max), (650, 700));
    }

    #[test]
    fn form_light_window_must_stay_ordered() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(&mut settings, &mut cfg, &form(&[("light_start", "22:00")]));
        assert_eq!(cfg.lights[0].start, hm(8, 30));
        assert!(out.messages[0].contains("must be before end"), "{:?}", out.messages);
    }

    #[test]
    fn form_light_selects_by_id() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(
            &mut settings,
            &mut cfg,
            &form(&[("light", "nope"), ("light_end", "20:00")]),
        );
        assert!(out.messages[0].contains("unknown light 'nope'"), "{:?}", out.messages);

        let out = apply_form(
            &mut settings,
            &mut cfg,
            &form(&[("light", "Main Led"), ("light_end", "20:00")]),
        );
        assert!(out.messages.is_empty());
        assert_eq!(cfg.lights[0].end, hm(20, 0));
    }

    #[test]
    fn form_pump_run_without_pump() {
        let mut settings = Settings::default();
        let mut cfg = GreenhouseConfig::default();
        let out = apply_form(&mut settings, &mut cfg, &form(&[("pump_run", "30s")]));
        assert!(out.messages[0].contains("no pump configured"));
    }

    #[test]
    fn form_port_change_notes_restart() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(&mut settings, &mut cfg, &form(&[("port", "9090")]));
        assert_eq!(settings.port, 9090);
        assert!(out.messages.iter().any(|m| m.contains("after restart")));
    }

    #[test]
    fn form_unknown_field_reported() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        let out = apply_form(&mut settings, &mut cfg, &form(&[("colour", "green")]));
        assert_eq!(out.messages, vec!["colour: unknown field ignored".to_string()]);
    }

    #[test]
    fn form_result_still_validates() {
        let mut settings = Settings::default();
        let mut cfg = valid_config();
        apply_form(
            &mut settings,
            &mut cfg,
            &form(&[("temp_max", "0"), ("light_end", "08:00"), ("id", "New")]),
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.id, "New");
    }
}
