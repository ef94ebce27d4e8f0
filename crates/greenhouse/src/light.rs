//! Grow-light schedule: one loop per light keeps its relay in line with
//! the daily on/off window.

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveDate, NaiveTime, TimeZone};
use tracing::{debug, info};

use crate::app::App;
use crate::state::Light;
use crate::supervisor::{wait, Wake};

// ---------------------------------------------------------------------------
// Window anchoring
// ---------------------------------------------------------------------------

/// `time` on `date` in local time.  An ambiguous instant (DST fall-back)
/// takes the earlier one; a skipped instant (DST spring-forward) takes the
/// same wall time an hour later.
pub fn anchor(date: NaiveDate, time: NaiveTime) -> DateTime<Local> {
    let naive = date.and_time(time);
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(first, _) => first,
        LocalResult::None => {
            let shifted = naive + ChronoDuration::hours(1);
            match Local.from_local_datetime(&shifted) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
                // No zone skips two consecutive hours.
                LocalResult::None => Local.from_utc_datetime(&naive),
            }
        }
    }
}

pub fn anchor_today(time: NaiveTime, now: DateTime<Local>) -> DateTime<Local> {
    anchor(now.date_naive(), time)
}

/// Move `light`'s window to the next day, same times of day.
pub fn advance_day(light: &mut Light) {
    let date = light
        .start
        .date_naive()
        .succ_opt()
        .unwrap_or_else(|| light.start.date_naive());
    light.start = anchor(date, light.on_at);
    light.end = anchor(date, light.off_at);
}

// ---------------------------------------------------------------------------
// Phase machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BeforeWindow,
    InWindow,
    WindowEnded,
}

/// Where `now` falls relative to the window `[start, end)`.
pub fn phase(light: &Light, now: DateTime<Local>) -> Phase {
    if now >= light.end {
        Phase::WindowEnded
    } else if now < light.start {
        Phase::BeforeWindow
    } else {
        Phase::InWindow
    }
}

/// Advance ended windows by a day until `now` is before or inside one.
pub fn settle(light: &mut Light, now: DateTime<Local>) -> Phase {
    loop {
        match phase(light, now) {
            Phase::WindowEnded => {
                advance_day(light);
                debug!(
                    light = %light.id,
                    start = %light.start,
                    end = %light.end,
                    "window advanced a day"
                );
            }
            p => return p,
        }
    }
}

/// Decision for one evaluation of a light.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub phase: Phase,
    /// Relay level to write, if it differs from the last level written.
    pub switch_to: Option<bool>,
    /// Next boundary to wake at.
    pub wake_at: DateTime<Local>,
}

/// Settle the window and decide whether the relay must change.  `applied`
/// is the level the schedule last wrote, `None` before the first write.
pub fn step(light: &mut Light, applied: Option<bool>, now: DateTime<Local>) -> Step {
    let phase = settle(light, now);
    let desired = phase == Phase::InWindow;
    let switch_to = if applied != Some(desired) {
        light.active = desired;
        Some(desired)
    } else {
        None
    };
    let wake_at = if desired { light.end } else { light.start };
    Step {
        phase,
        switch_to,
        wake_at,
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Drive the light at `index` until shutdown.  Wakes at the next window
/// boundary, when the config changes, or at the latest every second.
pub async fn run_light_loop(app: App, index: usize) {
    let mut shutdown = app.shutdown_signal();
    let mut applied: Option<bool> = None;

    loop {
        let now = Local::now();
        let (id, pin, next) = {
            let mut st = app.state.write().await;
            let Some(light) = st.lights.get_mut(index) else {
                return;
            };
            let next = step(light, applied, now);
            let (id, pin) = (light.id.clone(), light.pin);
            if let Some(on) = next.switch_to {
                st.record_light(&id, on, "schedule");
            }
            (id, pin, next)
        };

        if let Some(on) = next.switch_to {
            app.board.lock().await.set_relay(pin, on);
            applied = Some(on);
            let until = next.wake_at;
            if on {
                info!(light = %id, %until, "light on");
            } else {
                info!(light = %id, %until, "light off, snoozing");
            }
        }

        let remaining = (next.wake_at - Local::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        if wait(remaining, &app.changed, &mut shutdown).await == Wake::Shutdown {
            debug!(light = %id, "light loop stopped");
            return;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Local> {
        anchor(day(d), hm(h, m))
    }

    fn light(start: NaiveTime, end: NaiveTime, date: NaiveDate) -> Light {
        Light {
            id: "main".into(),
            pin: 23,
            active: false,
            on_at: start,
            off_at: end,
            start: anchor(date, start),
            end: anchor(date, end),
        }
    }

    #[test]
    fn phase_is_half_open() {
        let l = light(hm(8, 30), hm(21, 45), day(1));
        assert_eq!(phase(&l, at(1, 8, 29)), Phase::BeforeWindow);
        assert_eq!(phase(&l, at(1, 8, 30)), Phase::InWindow);
        assert_eq!(phase(&l, at(1, 21, 44)), Phase::InWindow);
        assert_eq!(phase(&l, at(1, 21, 45)), Phase::WindowEnded);
    }

    #[test]
    fn settle_after_end_moves_to_tomorrow() {
        let mut l = light(hm(8, 30), hm(21, 45), day(1));
        let p = settle(&mut l, at(1, 22, 0));
        assert_eq!(p, Phase::BeforeWindow);
        assert_eq!(l.start, at(2, 8, 30));
        assert_eq!(l.end, at(2, 21, 45));
    }

    #[test]
    fn settle_skips_several_days() {
        let mut l = light(hm(8, 30), hm(21, 45), day(1));
        let p = settle(&mut l, at(4, 12, 0));
        assert_eq!(p, Phase::InWindow);
        assert_eq!(l.start, at(4, 8, 30));
    }

    #[test]
    fn step_writes_once_per_transition() {
        let mut l = light(hm(8, 30), hm(21, 45), day(1));

        let s = step(&mut l, None, at(1, 7, 0));
        assert_eq!(s.switch_to, Some(false));
        assert_eq!(s.wake_at, at(1, 8, 30));

        // Spurious wake before start: nothing to write.
        let s = step(&mut l, Some(false), at(1, 7, 30));
        assert_eq!(s.switch_to, None);

        let s = step(&mut l, Some(false), at(1, 8, 30));
        assert_eq!(s.switch_to, Some(true));
        assert!(l.active);
        assert_eq!(s.wake_at, at(1, 21, 45));

        let s = step(&mut l, Some(true), at(1, 12, 0));
        assert_eq!(s.switch_to, None);

        let s = step(&mut l, Some(true), at(1, 21, 45));
        assert_eq!(s.switch_to, Some(false));
        assert!(!l.active);
        assert_eq!(s.wake_at, at(2, 8, 30));
    }

    #[test]
    fn step_inside_window_at_startup_turns_on() {
        let mut l = light(hm(8, 30), hm(21, 45), day(1));
        let s = step(&mut l, None, at(1, 12, 0));
        assert_eq!(s.phase, Phase::InWindow);
        assert_eq!(s.switch_to, Some(true));
    }

    #[test]
    fn anchor_today_uses_date_of_now() {
        assert_eq!(anchor_today(hm(8, 30), at(3, 23, 0)), at(3, 8, 30));
    }
}
