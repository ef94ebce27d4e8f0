//! One sampling cycle: read every sensor of a group over the shared ADC
//! bus, smooth each sensor over a short burst, and store the results.

use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::adc::{AdcBus, HardwareError};
use crate::state::{SensorKind, SharedState};

pub type SharedBus = Arc<Mutex<Box<dyn AdcBus>>>;

pub fn shared_bus<B: AdcBus + 'static>(bus: B) -> SharedBus {
    let boxed: Box<dyn AdcBus> = Box::new(bus);
    Arc::new(Mutex::new(boxed))
}

/// Reads averaged into one sensor value.
pub const READS_PER_SENSOR: usize = 5;

/// Pause between consecutive reads of the same sensor.
pub const READ_GAP: Duration = Duration::from_millis(1);

/// Outcome of a completed cycle.
#[derive(Debug, Clone)]
pub struct SampleReport {
    pub kind: SensorKind,
    /// Per-sensor values in configured order.
    pub readings: Vec<(String, u16)>,
    pub aggregate: u16,
    pub time: DateTime<Local>,
}

/// Arithmetic mean with truncating integer division.
pub fn average(values: &[u16]) -> Option<u16> {
    if values.is_empty() {
        return None;
    }
    let sum: u64 = values.iter().map(|&v| u64::from(v)).sum();
    // The mean of u16 values always fits.
    Some((sum / values.len() as u64) as u16)
}

/// Read one channel `READS_PER_SENSOR` times and average.
pub async fn read_sensor(bus: &mut dyn AdcBus, channel: u8) -> Result<u16, HardwareError> {
    let mut reads = [0u16; READS_PER_SENSOR];
    for (i, slot) in reads.iter_mut().enumerate() {
        if i > 0 {
            tokio::time::sleep(READ_GAP).await;
        }
        *slot = bus.read(channel)?;
    }
    Ok(average(&reads).unwrap_or(0))
}

/// Open the bus, read every `(id, channel)` in order and close it again,
/// also when a read fails.
pub async fn read_group(
    bus: &mut dyn AdcBus,
    sensors: &[(String, u8)],
) -> Result<Vec<(String, u16)>, HardwareError> {
    bus.begin()?;
    let mut out = Vec::with_capacity(sensors.len());
    let mut result = Ok(());
    for (id, channel) in sensors {
        match read_sensor(bus, *channel).await {
            Ok(v) => out.push((id.clone(), v)),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    bus.end();
    result.map(|_| out)
}

/// Run one cycle for `kind`.
///
/// The bus lock is held from the first read until the results are stored,
/// so forced and scheduled cycles never interleave.  Returns `None` when
/// the group has no sensors.
pub async fn sample(
    state: &SharedState,
    bus: &SharedBus,
    kind: SensorKind,
) -> Result<Option<SampleReport>, HardwareError> {
    let mut bus = bus.lock().await;

    let sensors = state.read().await.group(kind).channels();
    if sensors.is_empty() {
        return Ok(None);
    }

    let readings = read_group(&mut **bus, &sensors).await?;
    let time = Local::now();
    let aggregate = state.write().await.record_sample(kind, &readings, time);
    drop(bus);

    tracing::info!(
        group = %kind,
        aggregate,
        sensors = readings.len(),
        "sample cycle complete"
    );

    Ok(Some(SampleReport {
        kind,
        readings,
        aggregate,
        time,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{GreenhouseConfig, SensorEntry, Settings};
    use crate::state::Greenhouse;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::RwLock;

    /// Bus returning scripted values per channel, then repeating the last.
    pub(crate) struct ScriptedBus {
        pub script: HashMap<u8, VecDeque<u16>>,
        pub open: bool,
        pub begins: usize,
        pub ends: usize,
        pub fail_channel: Option<u8>,
    }

    impl ScriptedBus {
        pub(crate) fn new(script: &[(u8, &[u16])]) -> Self {
            Self {
                script: script
                    .iter()
                    .map(|(ch, vals)| (*ch, vals.iter().copied().collect()))
                    .collect(),
                open: false,
                begins: 0,
                ends: 0,
                fail_channel: None,
            }
        }
    }

    impl AdcBus for ScriptedBus {
        fn begin(&mut self) -> Result<(), HardwareError> {
            self.open = true;
            self.begins += 1;
            Ok(())
        }

        fn read(&mut self, channel: u8) -> Result<u16, HardwareError> {
            if !self.open {
                return Err(HardwareError::NotOpen);
            }
            if self.fail_channel == Some(channel) {
                return Err(HardwareError::Transfer {
                    channel,
                    reason: "scripted failure".into(),
                });
            }
            let queue = self.script.entry(channel).or_default();
            let v = if queue.len() > 1 {
                queue.pop_front().unwrap_or(0)
            } else {
                queue.front().copied().unwrap_or(0)
            };
            Ok(v)
        }

        fn end(&mut self) {
            self.open = false;
            self.ends += 1;
        }
    }

    #[test]
    fn average_truncates() {
        assert_eq!(average(&[10, 11, 12, 13, 14]), Some(12));
        assert_eq!(average(&[1, 2]), Some(1));
        assert_eq!(average(&[512, 500]), Some(506));
        assert_eq!(average(&[]), None);
    }

    #[test]
    fn average_does_not_overflow() {
        assert_eq!(average(&[u16::MAX; 5]), Some(u16::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn read_sensor_averages_five_reads() {
        let mut bus = ScriptedBus::new(&[(0, &[10, 11, 12, 13, 14])]);
        bus.begin().unwrap();
        assert_eq!(read_sensor(&mut bus, 0).await.unwrap(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn read_group_ends_bus_on_failure() {
        let mut bus = ScriptedBus::new(&[(0, &[100]), (1, &[200])]);
        bus.fail_channel = Some(1);
        let sensors = vec![("a".to_string(), 0), ("b".to_string(), 1)];
        assert!(read_group(&mut bus, &sensors).await.is_err());
        assert_eq!(bus.begins, 1);
        assert_eq!(bus.ends, 1);
        assert!(!bus.open);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_stores_values_and_aggregate() {
        let cfg = GreenhouseConfig {
            soil_sensors: vec![
                SensorEntry { id: "left".into(), channel: 0 },
                SensorEntry { id: "right".into(), channel: 1 },
            ],
            ..GreenhouseConfig::default()
        };
        let state: SharedState = Arc::new(RwLock::new(Greenhouse::new(
            &cfg,
            Settings::default(),
            Local::now(),
        )));
        let bus = shared_bus(ScriptedBus::new(&[(0, &[512]), (1, &[500])]));

        let report = sample(&state, &bus, SensorKind::Soil).await.unwrap().unwrap();
        assert_eq!(report.aggregate, 506);
        assert_eq!(report.readings[0], ("left".to_string(), 512));

        let st = state.read().await;
        assert_eq!(st.soil.value, 506);
        assert!(st.soil.time.is_some());
    }

    #[tokio::test]
    async fn sample_empty_group_is_a_no_op() {
        let state: SharedState = Arc::new(RwLock::new(Greenhouse::new(
            &GreenhouseConfig::default(),
            Settings::default(),
            Local::now(),
        )));
        let bus = shared_bus(ScriptedBus::new(&[]));
        assert!(sample(&state, &bus, SensorKind::Temperature)
            .await
            .unwrap()
            .is_none());
    }
}
