//! Core mesh types: errors, configuration, statistics
//!
//! This module also defines the [`MeshNetwork`] trait, the surface a host
//! loop (real-time or simulated) uses to drive one node without caring
//! which radio or sensor sits underneath.

use super::packet::NodeAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default retry waiting threshold in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;

/// Default number of timer expirations before the head next hop is evicted
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Default sensor poll interval in milliseconds
pub const DEFAULT_SENSOR_INTERVAL_MS: u64 = 1000;

/// Default cooperative delay between loop iterations in milliseconds
pub const DEFAULT_LOOP_DELAY_MS: u64 = 2;

/// Errors that can occur in mesh operations
///
/// Only [`MeshError::RadioInit`] and [`MeshError::RadioFatal`] ever escape a
/// dispatcher iteration. Everything else that goes wrong on the air is
/// logged, counted and absorbed by the queues and retry timer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// The radio could not be put into receive mode at startup
    #[error("radio initialization failed: {0}")]
    RadioInit(String),

    /// The radio refused to re-arm receive mode
    #[error("radio failure: {0}")]
    RadioFatal(String),

    /// A node address failed to parse
    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    /// Configuration values are out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshError {
    /// Whether the node must halt after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::RadioInit(_) | MeshError::RadioFatal(_))
    }
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Role a node plays in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Samples readings and relays traffic toward the sink
    #[default]
    Sensor,
    /// Terminal node at level 0 that consumes readings
    Sink,
}

/// Per-node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// This node's address
    pub address: NodeAddress,
    /// Sensor or sink
    pub role: NodeRole,
    /// Time without an ack before the in-flight log is replayed
    pub ack_timeout_ms: u64,
    /// Timer expirations tolerated before evicting the head next hop
    pub max_retries: u8,
    /// Minimum spacing between sensor polls
    pub sensor_interval_ms: u64,
    /// Delay between loop iterations in real-time mode
    pub loop_delay_ms: u64,
    /// Seed for nonce and synthetic-reading generation (entropy if None)
    pub seed: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            address: NodeAddress::from_index(1),
            role: NodeRole::Sensor,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            sensor_interval_ms: DEFAULT_SENSOR_INTERVAL_MS,
            loop_delay_ms: DEFAULT_LOOP_DELAY_MS,
            seed: None,
        }
    }
}

impl MeshConfig {
    /// Create a sensor configuration for `address`
    pub fn sensor(address: NodeAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Create a sink configuration for `address`
    pub fn sink(address: NodeAddress) -> Self {
        Self {
            address,
            role: NodeRole::Sink,
            ..Default::default()
        }
    }

    /// Set the node address from its text form
    pub fn with_address_str(mut self, address: &str) -> MeshResult<Self> {
        self.address = NodeAddress::parse(address)
            .map_err(|_| MeshError::InvalidAddress(address.to_string()))?;
        Ok(self)
    }

    /// Set the ack timeout
    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the sensor poll interval
    pub fn with_sensor_interval_ms(mut self, ms: u64) -> Self {
        self.sensor_interval_ms = ms;
        self
    }

    /// Set the RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> MeshResult<()> {
        if self.max_retries == 0 {
            return Err(MeshError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "ack_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.sensor_interval_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "sensor_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_interval_ms)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }
}

/// Statistics for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    /// Frames accepted by the radio for transmission
    pub frames_tx: u64,
    /// Frames drained from the radio
    pub frames_rx: u64,
    /// Data messages queued for relay
    pub forwarded: u64,
    /// Acks queued in answer to data addressed here
    pub acks_sent: u64,
    /// Acks that cleared an in-flight entry
    pub acks_matched: u64,
    /// Acks with no matching in-flight entry
    pub acks_unmatched: u64,
    /// Discovery requests transmitted
    pub discovery_sent: u64,
    /// Discovery replies queued
    pub replies_sent: u64,
    /// Ack timer expirations
    pub retries: u64,
    /// Next hops evicted after retry exhaustion
    pub evictions: u64,
    /// Records that failed to decode
    pub decode_failures: u64,
    /// Receive errors reported by the radio (CRC and similar)
    pub receive_errors: u64,
    /// Data messages addressed to some other node
    pub overheard: u64,
    /// Transmit attempts the radio rejected with an error
    pub transmit_failures: u64,
    /// Readings taken locally (real or synthetic)
    pub readings_generated: u64,
    /// Readings substituted with synthetic values
    pub synthetic_readings: u64,
    /// Readings consumed at the sink
    pub readings_delivered: u64,
    /// Radio events dropped while a previous one was undrained
    pub events_lost: u64,
}

/// Operations a host loop needs from a mesh node
pub trait MeshNetwork {
    /// This node's address
    fn address(&self) -> NodeAddress;

    /// Current hop distance to the sink, `None` while unknown
    fn level(&self) -> Option<u32>;

    /// True when no next hop is known
    fn is_isolated(&self) -> bool;

    /// Run one dispatcher iteration at time `now` (monotonic since start)
    fn step(&mut self, now: Duration) -> MeshResult<()>;

    /// Snapshot of the node's counters
    fn stats(&self) -> MeshStats;
}
