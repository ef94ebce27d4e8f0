//! Simulated MCP3008 for development without a Pi.
//!
//! Each channel follows a slow random walk with mean reversion, per-read
//! electronic noise and the occasional spike.  Values are pushed through
//! the same frame decoding as the real chip so they land on the values the
//! hardware can actually report.

use std::collections::HashMap;

use crate::adc::{decode_frame, request_frame, AdcBus, HardwareError, MAX_CHANNEL, MAX_READING};

/// Approximate a sample from N(0,1) using the Irwin-Hall method.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Pack a value into a response frame so `decode_frame` yields the nearest
/// representable reading at or below it.
fn encode_frame(value: u16) -> [u8; 3] {
    let b2 = (value >> 6).min(0xFF);
    let rest = value - (b2 << 6);
    let b1 = (rest >> 8).min(0x03);
    [0x00, b1 as u8, b2 as u8]
}

/// Channel selected by a request frame, as the chip reads it.
fn addressed_channel(request: [u8; 3]) -> u8 {
    (request[1] >> 4) & MAX_CHANNEL
}

struct ChannelState {
    base: f64,
}

pub struct SimBus {
    channels: HashMap<u8, ChannelState>,
    center: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    open: bool,
}

impl SimBus {
    /// `center` is the value every channel drifts around.
    pub fn new(center: u16) -> Self {
        tracing::info!(center, "simulated adc bus initialised (no hardware)");
        Self {
            channels: HashMap::new(),
            center: f64::from(center),
            walk_sigma: 40.0,
            mean_reversion: 0.05,
            noise_sigma: 60.0,
            spike_prob: 0.02,
            spike_sigma: 1500.0,
            open: false,
        }
    }
}

impl AdcBus for SimBus {
    fn begin(&mut self) -> Result<(), HardwareError> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self, channel: u8) -> Result<u16, HardwareError> {
        if !self.open {
            return Err(HardwareError::NotOpen);
        }
        if channel > MAX_CHANNEL {
            return Err(HardwareError::Transfer {
                channel,
                reason: "no such channel".to_string(),
            });
        }

        let addressed = addressed_channel(request_frame(channel));
        let center = self.center;
        let state = self.channels.entry(addressed).or_insert_with(|| ChannelState {
            base: gaussian(center, center * 0.05),
        });

        let pull = self.mean_reversion * (center - state.base);
        state.base += pull + gaussian(0.0, self.walk_sigma);

        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };
        let reading = (state.base + gaussian(0.0, self.noise_sigma) + spike)
            .round()
            .clamp(0.0, f64::from(MAX_READING)) as u16;

        Ok(decode_frame(encode_frame(reading)))
    }

    fn end(&mut self) {
        self.open = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
