//! Actuator outputs: relays (grow-lights, pump) and window servos.
//!
//! The `gpio` feature gates the real rppal driver; without it, a mock board
//! records output levels and logs every change.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::adc::HardwareError;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use std::time::Duration;

pub type SharedBoard = Arc<Mutex<Board>>;

/// Standard hobby servo timing.
#[cfg(feature = "gpio")]
const SERVO_PERIOD: Duration = Duration::from_millis(20);
#[cfg(feature = "gpio")]
const SERVO_OPEN_PULSE: Duration = Duration::from_micros(2000);
#[cfg(feature = "gpio")]
const SERVO_CLOSED_PULSE: Duration = Duration::from_micros(1000);

// ---------------------------------------------------------------------------
// Real GPIO board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct Board {
    relays: HashMap<u8, OutputPin>,
    servos: HashMap<u8, OutputPin>,
    active_low: bool, // the LED and pump relay boards are active-low
}

#[cfg(feature = "gpio")]
impl Board {
    pub fn new(relay_pins: &[u8], servo_pins: &[u8], active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut relays = HashMap::new();
        let mut servos = HashMap::new();

        for &pin_num in relay_pins {
            let mut pin = gpio.get(pin_num)?.into_output();
            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            relays.insert(pin_num, pin);
        }

        for &pin_num in servo_pins {
            let mut pin = gpio.get(pin_num)?.into_output();
            pin.set_pwm(SERVO_PERIOD, SERVO_CLOSED_PULSE)?;
            servos.insert(pin_num, pin);
        }

        Ok(Self {
            relays,
            servos,
            active_low,
        })
    }

    pub fn set_relay(&mut self, pin_num: u8, on: bool) {
        if let Some(pin) = self.relays.get_mut(&pin_num) {
            // active-low: LOW = ON, HIGH = OFF
            if on != self.active_low {
                pin.set_high()
            } else {
                pin.set_low()
            }
            tracing::debug!(pin = pin_num, on, "relay set");
        } else {
            tracing::warn!(pin = pin_num, "unknown relay pin");
        }
    }

    pub fn set_servo(&mut self, pin_num: u8, open: bool) -> Result<(), HardwareError> {
        let pin = self
            .servos
            .get_mut(&pin_num)
            .ok_or_else(|| HardwareError::Output {
                pin: pin_num,
                reason: "not registered as a servo".to_string(),
            })?;
        let pulse = if open {
            SERVO_OPEN_PULSE
        } else {
            SERVO_CLOSED_PULSE
        };
        pin.set_pwm(SERVO_PERIOD, pulse)
            .map_err(|e| HardwareError::Output {
                pin: pin_num,
                reason: e.to_string(),
            })?;
        tracing::debug!(pin = pin_num, open, "servo set");
        Ok(())
    }

    /// Relays off, servos closed.
    pub fn all_safe(&mut self) {
        let relays: Vec<u8> = self.relays.keys().copied().collect();
        for pin in relays {
            self.set_relay(pin, false);
        }
        let servos: Vec<u8> = self.servos.keys().copied().collect();
        for pin in servos {
            if let Err(e) = self.set_servo(pin, false) {
                tracing::error!(pin, "failed to close servo: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock board (development — no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct Board {
    pub(crate) relays: HashMap<u8, bool>, // pin -> on
    pub(crate) servos: HashMap<u8, bool>, // pin -> open
    pub(crate) writes: usize,
}

#[cfg(not(feature = "gpio"))]
impl Board {
    pub fn new(relay_pins: &[u8], servo_pins: &[u8], _active_low: bool) -> anyhow::Result<Self> {
        let relays = relay_pins.iter().map(|&p| (p, false)).collect();
        let servos = servo_pins.iter().map(|&p| (p, false)).collect();
        tracing::info!(
            relays = ?relay_pins,
            servos = ?servo_pins,
            "[mock-gpio] board initialised (no hardware)"
        );
        Ok(Self {
            relays,
            servos,
            writes: 0,
        })
    }

    pub fn set_relay(&mut self, pin: u8, on: bool) {
        if let Some(state) = self.relays.get_mut(&pin) {
            *state = on;
            self.writes += 1;
            tracing::debug!(pin, on, "[mock-gpio] relay set");
        } else {
            tracing::warn!(pin, "[mock-gpio] unknown relay pin");
        }
    }

    pub fn set_servo(&mut self, pin: u8, open: bool) -> Result<(), HardwareError> {
        let state = self.servos.get_mut(&pin).ok_or_else(|| HardwareError::Output {
            pin,
            reason: "not registered as a servo".to_string(),
        })?;
        *state = open;
        self.writes += 1;
        tracing::debug!(pin, open, "[mock-gpio] servo set");
        Ok(())
    }

    pub fn all_safe(&mut self) {
        let relays: Vec<u8> = self.relays.keys().copied().collect();
        for pin in relays {
            self.set_relay(pin, false);
        }
        let servos: Vec<u8> = self.servos.keys().copied().collect();
        for pin in servos {
            // Registered pins cannot fail on the mock.
            let _ = self.set_servo(pin, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
