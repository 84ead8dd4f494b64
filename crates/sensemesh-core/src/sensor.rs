//! Sensor acquisition boundary
//!
//! The mesh core only needs "give me the next reading, or tell me it is
//! not ready". A failing sensor must not silence the node: errors and
//! invalid samples (a CO2 value of exactly zero) are replaced with random
//! in-range values so the mesh traffic pattern stays observable.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::debug;

/// Range of substituted CO2 values (ppm)
pub const SYNTHETIC_CO2: RangeInclusive<f32> = 100.0..=1000.0;
/// Range of substituted temperature values (°C)
pub const SYNTHETIC_TEMPERATURE: RangeInclusive<f32> = 0.0..=40.0;
/// Range of substituted humidity values
pub const SYNTHETIC_HUMIDITY: RangeInclusive<f32> = 90.0..=1030.0;

/// One environmental sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// CO2 concentration in ppm
    pub co2: f32,
    /// Temperature in °C
    pub temperature: f32,
    /// Relative humidity
    pub humidity: f32,
}

impl SensorReading {
    pub fn new(co2: f32, temperature: f32, humidity: f32) -> Self {
        Self {
            co2,
            temperature,
            humidity,
        }
    }

    /// Random reading inside the substitution ranges
    pub fn synthetic<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            co2: rng.gen_range(SYNTHETIC_CO2),
            temperature: rng.gen_range(SYNTHETIC_TEMPERATURE),
            humidity: rng.gen_range(SYNTHETIC_HUMIDITY),
        }
    }

    /// A zero CO2 value is the sensor's way of reporting a bad sample
    pub fn is_valid(&self) -> bool {
        self.co2 != 0.0
    }
}

/// Result of polling a sensor
#[derive(Debug, Clone, PartialEq)]
pub enum SensorPoll {
    Ready(SensorReading),
    NotReady,
    Error(String),
}

/// Something that produces readings
pub trait SensorSource {
    fn poll_reading(&mut self) -> SensorPoll;
}

impl<S: SensorSource + ?Sized> SensorSource for Box<S> {
    fn poll_reading(&mut self) -> SensorPoll {
        (**self).poll_reading()
    }
}

/// A reading ready to be sent, with its provenance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acquired {
    pub reading: SensorReading,
    /// True when the values were substituted
    pub synthetic: bool,
}

/// Poll `source` once, substituting random values on error or invalid sample
pub fn acquire<S, R>(source: &mut S, rng: &mut R) -> Option<Acquired>
where
    S: SensorSource + ?Sized,
    R: Rng + ?Sized,
{
    match source.poll_reading() {
        SensorPoll::NotReady => None,
        SensorPoll::Ready(reading) if reading.is_valid() => Some(Acquired {
            reading,
            synthetic: false,
        }),
        SensorPoll::Ready(_) => {
            debug!("Invalid sample, substituting random values");
            Some(Acquired {
                reading: SensorReading::synthetic(rng),
                synthetic: true,
            })
        }
        SensorPoll::Error(reason) => {
            debug!(%reason, "Sensor error, substituting random values");
            Some(Acquired {
                reading: SensorReading::synthetic(rng),
                synthetic: true,
            })
        }
    }
}

/// Rate limiter for sensor polls
#[derive(Debug, Clone)]
pub struct SensorSampler {
    interval: Duration,
    last_poll: Option<Duration>,
}

impl SensorSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_poll: None,
        }
    }

    /// Returns true (and starts a new interval) if a poll is due at `now`
    pub fn due(&mut self, now: Duration) -> bool {
        let due = match self.last_poll {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval,
        };
        if due {
            self.last_poll = Some(now);
        }
        due
    }
}

/// Sensor producing random in-range readings
#[derive(Debug, Clone)]
pub struct SyntheticSensor {
    rng: rand::rngs::StdRng,
}

impl SyntheticSensor {
    pub fn new(seed: u64) -> Self {
        use rand::SeedableRng;
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }
}

impl SensorSource for SyntheticSensor {
    fn poll_reading(&mut self) -> SensorPoll {
        SensorPoll::Ready(SensorReading::synthetic(&mut self.rng))
    }
}

/// Sensor replaying a fixed sequence of poll results, then `NotReady`
#[derive(Debug, Clone, Default)]
pub struct ScriptedSensor {
    script: VecDeque<SensorPoll>,
}

impl ScriptedSensor {
    pub fn new(script: impl IntoIterator<Item = SensorPoll>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }
}

impl SensorSource for ScriptedSensor {
    fn poll_reading(&mut self) -> SensorPoll {
        self.script.pop_front().unwrap_or(SensorPoll::NotReady)
    }
}
