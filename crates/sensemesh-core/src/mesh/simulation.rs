//! Multi-Node Mesh Simulation
//!
//! Runs many [`MeshNode`]s in one process on a shared discrete clock. Each
//! node gets a [`SimRadio`]; the simulator plays the part of the air:
//!
//! - nodes placed on a line, a grid, or at random inside an area
//! - a frame reaches every live node within `range` meters of the sender
//! - airtime derived from frame length and modem settings
//! - a receiver that is itself transmitting hears nothing (half duplex)
//! - random frame loss
//! - per-node clock drift, so identical timer periods do not stay in phase
//! - nodes can be killed at runtime to exercise route repair
//!
//! Node 0 is the sink.
//!
//! ## Example
//!
//! ```ignore
//! use sensemesh_core::mesh::simulation::{MeshSimulator, SimConfig, Topology};
//!
//! let config = SimConfig::default()
//!     .with_node_count(5)
//!     .with_topology(Topology::Line);
//! let mut sim = MeshSimulator::new(config)?;
//! sim.run(3000);
//! println!("Delivery rate: {:.1}%", sim.stats().delivery_rate() * 100.0);
//! ```

use super::node::{DeliveredReading, MeshNode};
use super::packet::NodeAddress;
use super::sim_radio::{SimRadio, SimRadioHandle};
use super::traits::{MeshConfig, MeshError, MeshResult, MeshStats, NodeRole};
use crate::sensor::SyntheticSensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Node position in 2D space (meters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

impl NodePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance to another node in meters
    pub fn distance_to(&self, other: &NodePosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// How nodes are placed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Topology {
    /// A chain; each node hears only its immediate neighbors
    Line,
    /// A square grid; each node hears its horizontal and vertical neighbors
    Grid,
    /// Uniformly random positions in a `width` x `height` area
    Random { width: f64, height: f64 },
}

impl std::str::FromStr for Topology {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "line" => Ok(Topology::Line),
            "grid" => Ok(Topology::Grid),
            "random" => Ok(Topology::Random {
                width: 1000.0,
                height: 1000.0,
            }),
            other => Err(MeshError::InvalidConfig(format!("unknown topology {:?}", other))),
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of nodes, sink included
    pub node_count: usize,
    /// Node placement
    pub topology: Topology,
    /// Radio range in meters
    pub range: f64,
    /// Simulated time per step in milliseconds
    pub step_ms: u64,
    /// LoRa spreading factor used for airtime
    pub spreading_factor: u8,
    /// LoRa bandwidth in Hz used for airtime
    pub bandwidth_hz: u32,
    /// Probability that a frame is lost on a given link
    pub loss_probability: f64,
    /// Largest per-step deviation of a node's local clock, as a fraction
    /// of `step_ms` (0.0 keeps every node on the shared clock)
    pub clock_jitter: f64,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Settings applied to every node (address, role and seed are overridden)
    pub node: MeshConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            topology: Topology::Line,
            range: 100.0,
            step_ms: 10,
            spreading_factor: 9,
            bandwidth_hz: 812_500, // SX1280 wideband
            loss_probability: 0.0,
            clock_jitter: 0.25,
            seed: 42,
            node: MeshConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_range(mut self, range: f64) -> Self {
        self.range = range;
        self
    }

    pub fn with_step_ms(mut self, step_ms: u64) -> Self {
        self.step_ms = step_ms;
        self
    }

    pub fn with_loss_probability(mut self, p: f64) -> Self {
        self.loss_probability = p;
        self
    }

    pub fn with_clock_jitter(mut self, jitter: f64) -> Self {
        self.clock_jitter = jitter;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_node_config(mut self, node: MeshConfig) -> Self {
        self.node = node;
        self
    }

    fn validate(&self) -> MeshResult<()> {
        if self.node_count == 0 {
            return Err(MeshError::InvalidConfig("node_count must be at least 1".to_string()));
        }
        if self.node_count > u16::MAX as usize {
            return Err(MeshError::InvalidConfig(format!(
                "node_count must be at most {}",
                u16::MAX
            )));
        }
        if self.step_ms == 0 {
            return Err(MeshError::InvalidConfig("step_ms must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(MeshError::InvalidConfig(
                "loss_probability must be within 0..=1".to_string(),
            ));
        }
        // Below one step so local clocks stay strictly monotonic
        if !(0.0..1.0).contains(&self.clock_jitter) {
            return Err(MeshError::InvalidConfig(
                "clock_jitter must be within 0..1".to_string(),
            ));
        }
        if !(5..=12).contains(&self.spreading_factor) || self.bandwidth_hz == 0 {
            return Err(MeshError::InvalidConfig("invalid modem settings".to_string()));
        }
        self.node.validate()
    }
}

/// A frame on the air
#[derive(Debug, Clone)]
struct InFlightFrame {
    data: Vec<u8>,
    source_idx: usize,
    sent_step: u64,
    duration_steps: u64,
}

/// Simulation statistics
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Readings taken by all sensor nodes
    pub readings_generated: u64,
    /// Distinct readings that reached the sink
    pub readings_delivered: u64,
    /// Readings that reached the sink more than once
    pub duplicate_deliveries: u64,
    /// Frames put on the air
    pub frames_transmitted: u64,
    /// Frame copies handed to a listening receiver
    pub frames_received: u64,
    /// Frame copies dropped by random loss
    pub frames_lost: u64,
    /// Frame copies missed because the receiver was transmitting
    pub frames_missed_busy: u64,
    /// Per-node snapshot
    pub per_node: Vec<NodeReport>,
}

impl SimStats {
    /// Fraction of generated readings that reached the sink (0.0 - 1.0)
    pub fn delivery_rate(&self) -> f64 {
        if self.readings_generated == 0 {
            0.0
        } else {
            self.readings_delivered as f64 / self.readings_generated as f64
        }
    }
}

/// Per-node snapshot
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub index: usize,
    pub address: NodeAddress,
    pub role: NodeRole,
    pub alive: bool,
    pub level: Option<u32>,
    pub next_hops: Vec<NodeAddress>,
    pub stats: MeshStats,
}

/// Simulation events for logging
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    NodeJoined { node_idx: usize, address: NodeAddress, position: NodePosition },
    FrameTransmitted { node_idx: usize, record: String },
    FrameLost { from_idx: usize, to_idx: usize },
    FrameMissed { from_idx: usize, to_idx: usize },
    ReadingDelivered { source: NodeAddress, nonce: u16, step: u64 },
    NodeKilled { node_idx: usize },
    NodeHalted { node_idx: usize, error: String },
}

type SimMeshNode = MeshNode<SimRadio, SyntheticSensor>;

/// Simulated node wrapper
struct SimNode {
    node: SimMeshNode,
    radio: SimRadioHandle,
    position: NodePosition,
    /// First step on which the node runs (staggers sensor schedules)
    start_step: u64,
    /// Node-local time, advanced every step with jitter
    clock: Duration,
    alive: bool,
}

/// Multi-node mesh network simulator
pub struct MeshSimulator {
    config: SimConfig,
    nodes: Vec<SimNode>,
    in_flight: Vec<InFlightFrame>,
    step_count: u64,
    rng: StdRng,
    stats: SimStats,
    delivered: Vec<DeliveredReading>,
    seen: HashSet<(NodeAddress, u16)>,
    event_log: Vec<SimEvent>,
}

impl MeshSimulator {
    /// Create a simulator and start every node's radio
    pub fn new(config: SimConfig) -> MeshResult<Self> {
        config.validate()?;

        let mut sim = Self {
            nodes: Vec::with_capacity(config.node_count),
            in_flight: Vec::new(),
            step_count: 0,
            rng: StdRng::seed_from_u64(config.seed),
            stats: SimStats::default(),
            delivered: Vec::new(),
            seen: HashSet::new(),
            event_log: Vec::new(),
            config,
        };

        sim.initialize_nodes()?;
        Ok(sim)
    }

    fn initialize_nodes(&mut self) -> MeshResult<()> {
        let positions = self.place_nodes();
        let stagger_steps = (self.config.node.sensor_interval_ms / self.config.step_ms).max(1);

        for (i, position) in positions.into_iter().enumerate() {
            let index = u16::try_from(i + 1).map_err(|_| {
                MeshError::InvalidConfig(format!("node index {} exceeds address space", i))
            })?;
            let address = NodeAddress::from_index(index);
            let node_seed = self.config.seed.wrapping_add((i as u64 + 1) * 0x9e37_79b9);
            let mut node_config = self.config.node.clone();
            node_config.address = address;
            node_config.role = if i == 0 { NodeRole::Sink } else { NodeRole::Sensor };
            node_config.seed = Some(node_seed);

            let (radio, handle) = SimRadio::new();
            let node = MeshNode::new(node_config, radio, SyntheticSensor::new(node_seed))?;
            let start_step = if i == 0 { 0 } else { self.rng.gen_range(0..stagger_steps) };

            self.event_log.push(SimEvent::NodeJoined {
                node_idx: i,
                address,
                position,
            });
            self.nodes.push(SimNode {
                node,
                radio: handle,
                position,
                start_step,
                clock: Duration::ZERO,
                alive: true,
            });
        }

        info!(
            nodes = self.nodes.len(),
            topology = ?self.config.topology,
            "Initialized simulation"
        );
        Ok(())
    }

    fn place_nodes(&mut self) -> Vec<NodePosition> {
        let n = self.config.node_count;
        // Neighbors sit inside range, diagonal and second neighbors outside
        let spacing = self.config.range * 0.8;
        match self.config.topology {
            Topology::Line => (0..n)
                .map(|i| NodePosition::new(i as f64 * spacing, 0.0))
                .collect(),
            Topology::Grid => {
                let side = (n as f64).sqrt().ceil().max(1.0) as usize;
                (0..n)
                    .map(|i| {
                        NodePosition::new((i % side) as f64 * spacing, (i / side) as f64 * spacing)
                    })
                    .collect()
            }
            Topology::Random { width, height } => (0..n)
                .map(|_| {
                    NodePosition::new(
                        self.rng.gen::<f64>() * width,
                        self.rng.gen::<f64>() * height,
                    )
                })
                .collect(),
        }
    }

    /// Airtime of a frame in simulation steps (at least one)
    fn calculate_tx_duration_steps(size: usize, config: &SimConfig) -> u64 {
        let sf = config.spreading_factor as f64;

        // LoRa symbol time: Ts = 2^SF / BW (in microseconds)
        let symbol_time_us = (1u64 << config.spreading_factor) as f64 / config.bandwidth_hz as f64
            * 1_000_000.0;

        // Approximate symbols per byte (with coding rate 4/5)
        let symbols_per_byte = 8.0 * 5.0 / 4.0 / sf;

        // Preamble (12.25 symbols) + payload
        let total_symbols = 12.25 + (size as f64 * symbols_per_byte);
        let duration_ms = total_symbols * symbol_time_us / 1000.0;

        (duration_ms / config.step_ms as f64).ceil().max(1.0) as u64
    }

    /// How far one node's clock moves during one step
    fn clock_advance(&mut self) -> Duration {
        let step_us = self.config.step_ms.saturating_mul(1000);
        let max_jitter_us = (step_us as f64 * self.config.clock_jitter) as i64;
        let jitter_us = if max_jitter_us > 0 {
            self.rng.gen_range(-max_jitter_us..=max_jitter_us)
        } else {
            0
        };
        Duration::from_micros(step_us.saturating_add_signed(jitter_us))
    }

    /// Run one simulation step
    pub fn step(&mut self) {
        self.step_count += 1;

        // 1. Run every node's dispatcher on its own clock
        self.step_nodes();

        // 2. Pick up frames the nodes started sending
        self.collect_transmissions();

        // 3. Finish frames whose airtime is over
        self.propagate_frames();
    }

    fn step_nodes(&mut self) {
        for i in 0..self.nodes.len() {
            let advance = self.clock_advance();
            let sim_node = &mut self.nodes[i];
            sim_node.clock += advance;
            if !sim_node.alive || self.step_count < sim_node.start_step {
                continue;
            }
            if let Err(e) = sim_node.node.step(sim_node.clock) {
                warn!(node = i, error = %e, "Node halted");
                sim_node.alive = false;
                self.event_log.push(SimEvent::NodeHalted {
                    node_idx: i,
                    error: e.to_string(),
                });
                continue;
            }

            for reading in sim_node.node.take_deliveries() {
                if self.seen.insert((reading.source, reading.nonce)) {
                    self.stats.readings_delivered += 1;
                    self.event_log.push(SimEvent::ReadingDelivered {
                        source: reading.source,
                        nonce: reading.nonce,
                        step: self.step_count,
                    });
                    self.delivered.push(reading);
                } else {
                    self.stats.duplicate_deliveries += 1;
                }
            }
        }
    }

    fn collect_transmissions(&mut self) {
        for i in 0..self.nodes.len() {
            if !self.nodes[i].alive {
                continue;
            }
            let Some(data) = self.nodes[i].radio.take_transmission() else {
                continue;
            };

            let duration_steps = Self::calculate_tx_duration_steps(data.len(), &self.config);
            let record = String::from_utf8_lossy(&data).into_owned();
            debug!(node = i, %record, duration_steps, "Frame on air");

            self.stats.frames_transmitted += 1;
            self.event_log.push(SimEvent::FrameTransmitted { node_idx: i, record });
            self.in_flight.push(InFlightFrame {
                data,
                source_idx: i,
                sent_step: self.step_count,
                duration_steps,
            });
        }
    }

    fn propagate_frames(&mut self) {
        let current_step = self.step_count;
        let mut completed = Vec::new();

        self.in_flight.retain(|frame| {
            if current_step >= frame.sent_step + frame.duration_steps {
                completed.push(frame.clone());
                false
            } else {
                true
            }
        });

        for frame in completed {
            self.deliver_frame(&frame);
            self.nodes[frame.source_idx].radio.complete_transmission();
        }
    }

    fn deliver_frame(&mut self, frame: &InFlightFrame) {
        let source_pos = self.nodes[frame.source_idx].position;
        let range = self.config.range;
        let loss = self.config.loss_probability;

        for i in 0..self.nodes.len() {
            if i == frame.source_idx || !self.nodes[i].alive {
                continue;
            }
            if source_pos.distance_to(&self.nodes[i].position) > range {
                continue;
            }

            if loss > 0.0 && self.rng.gen::<f64>() < loss {
                self.stats.frames_lost += 1;
                self.event_log.push(SimEvent::FrameLost {
                    from_idx: frame.source_idx,
                    to_idx: i,
                });
                continue;
            }

            if self.nodes[i].radio.deliver(&frame.data) {
                self.stats.frames_received += 1;
            } else {
                self.stats.frames_missed_busy += 1;
                self.event_log.push(SimEvent::FrameMissed {
                    from_idx: frame.source_idx,
                    to_idx: i,
                });
            }
        }
    }

    /// Run simulation for a number of steps
    pub fn run(&mut self, steps: u64) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Run until `condition` holds or `max_steps` have elapsed
    ///
    /// Returns true if the condition was met.
    pub fn run_until<F>(&mut self, max_steps: u64, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..max_steps {
            self.step();
            if condition(self) {
                return true;
            }
        }
        false
    }

    /// Switch a node off; its in-progress frame is dropped
    pub fn kill_node(&mut self, idx: usize) -> bool {
        match self.nodes.get_mut(idx) {
            Some(sim_node) if sim_node.alive => {
                sim_node.alive = false;
                self.in_flight.retain(|frame| frame.source_idx != idx);
                self.event_log.push(SimEvent::NodeKilled { node_idx: idx });
                info!(node = idx, address = %sim_node.node.address(), "Node killed");
                true
            }
            _ => false,
        }
    }

    /// True when every live sensor node has a route to the sink
    pub fn is_converged(&self) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.alive && n.node.role() == NodeRole::Sensor)
            .all(|n| !n.node.is_isolated())
    }

    /// Current level of every node
    pub fn levels(&self) -> Vec<Option<u32>> {
        self.nodes.iter().map(|n| n.node.level()).collect()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> SimStats {
        let mut stats = self.stats.clone();
        stats.readings_generated = self
            .nodes
            .iter()
            .map(|n| n.node.stats().readings_generated)
            .sum();
        stats.per_node = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, n)| NodeReport {
                index,
                address: n.node.address(),
                role: n.node.role(),
                alive: n.alive,
                level: n.node.level(),
                next_hops: n.node.next_hops(),
                stats: n.node.stats(),
            })
            .collect();
        stats
    }

    /// Get event log
    pub fn events(&self) -> &[SimEvent] {
        &self.event_log
    }

    /// Readings that reached the sink, first copies only
    pub fn delivered(&self) -> &[DeliveredReading] {
        &self.delivered
    }

    /// Take readings delivered since the last call
    pub fn take_delivered(&mut self) -> Vec<DeliveredReading> {
        std::mem::take(&mut self.delivered)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: usize) -> Option<&SimMeshNode> {
        self.nodes.get(idx).map(|n| &n.node)
    }

    pub fn node_position(&self, idx: usize) -> Option<NodePosition> {
        self.nodes.get(idx).map(|n| n.position)
    }

    pub fn node_address(&self, idx: usize) -> Option<NodeAddress> {
        self.nodes.get(idx).map(|n| n.node.address())
    }

    /// Local time of node `idx`
    pub fn node_time(&self, idx: usize) -> Option<Duration> {
        self.nodes.get(idx).map(|n| n.clock)
    }

    pub fn is_alive(&self, idx: usize) -> bool {
        self.nodes.get(idx).map(|n| n.alive).unwrap_or(false)
    }

    /// Index of the node with `address`
    pub fn index_of(&self, address: NodeAddress) -> Option<usize> {
        self.nodes.iter().position(|n| n.node.address() == address)
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Simulated time elapsed
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.step_count * self.config.step_ms)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Print a summary of the simulation
    pub fn print_summary(&self) {
        let stats = self.stats();
        println!("\n=== Mesh Simulation Summary ===");
        println!("Steps: {} ({:.1} s simulated)", self.step_count, self.elapsed().as_secs_f64());
        println!("Nodes: {}", self.nodes.len());
        println!();
        println!("Readings:");
        println!("  Generated: {}", stats.readings_generated);
        println!("  Delivered: {}", stats.readings_delivered);
        println!("  Duplicates at sink: {}", stats.duplicate_deliveries);
        println!("  Delivery rate: {:.1}%", stats.delivery_rate() * 100.0);
        println!();
        println!("Frames:");
        println!("  Transmitted: {}", stats.frames_transmitted);
        println!("  Received: {}", stats.frames_received);
        println!("  Lost: {}", stats.frames_lost);
        println!("  Missed (receiver busy): {}", stats.frames_missed_busy);
        println!();
        println!("Per-node:");
        for report in &stats.per_node {
            let level = report
                .level
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string());
            let next_hop = report
                .next_hops
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  Node {:2} {} {:6} {:5} level={:>2} via={} tx={} rx={} retries={} evictions={} lost_irq={}",
                report.index,
                report.address,
                format!("{:?}", report.role),
                if report.alive { "up" } else { "down" },
                level,
                next_hop,
                report.stats.frames_tx,
                report.stats.frames_rx,
                report.stats.retries,
                report.stats.evictions,
                report.stats.events_lost,
            );
        }
    }
}
