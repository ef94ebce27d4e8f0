//! Parsing and formatting for the human-entered values accepted by the
//! config form: durations (`90s`, `30m`, `1h30m`, bare seconds) and
//! times of day (`HH:MM`).

use chrono::NaiveTime;
use std::time::Duration;

/// Parse a duration such as `"45s"`, `"30m"`, `"1h30m"`, `"2h"` or a bare
/// number of seconds (`"90"`).  Units may be combined in any order but each
/// at most once.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut seen = Vec::with_capacity(3);

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let mult = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid duration '{s}': unexpected '{c}'")),
        };
        if digits.is_empty() {
            return Err(format!("invalid duration '{s}': missing number before '{c}'"));
        }
        if seen.contains(&c) {
            return Err(format!("invalid duration '{s}': unit '{c}' repeated"));
        }
        seen.push(c);

        let n: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{s}': number too large"))?;
        total = n
            .checked_mul(mult)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("invalid duration '{s}': overflow"))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("invalid duration '{s}': trailing number without unit"));
    }

    Ok(Duration::from_secs(total))
}

/// Render a duration the way `parse_duration` reads it back, e.g. `1h30m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

/// Parse a wall-clock time of day in `HH:MM` form.
pub fn parse_hhmm(input: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .map_err(|_| format!("invalid time '{}' (expected HH:MM)", input.trim()))
}

pub fn format_hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Serde adapter persisting a `NaiveTime` as `"HH:MM"`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_hhmm(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
