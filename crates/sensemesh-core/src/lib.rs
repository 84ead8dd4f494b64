//! # SenseMesh Core
//!
//! Multi-hop sensor mesh for low-power, half-duplex radios. Battery-powered
//! sensor nodes relay periodic CO2, temperature and humidity readings toward
//! a single sink without any pre-configured topology.
//!
//! ## Overview
//!
//! - **Route discovery**: nodes learn their hop level from discovery replies
//!   and keep a list of next hops one level closer to the sink
//! - **Reliable delivery**: one outstanding message per node, acked hop by
//!   hop, retried on timeout, with next-hop eviction after repeated failure
//! - **Dispatcher**: a single-threaded loop that sequences sensor sampling,
//!   radio events, timers and transmissions on one radio
//! - **Simulation**: an in-process radio and a multi-node simulator for
//!   exercising the protocol without hardware
//!
//! ## Wire Format
//!
//! ```text
//! 0                                                   discovery request
//! 1,<level>,<origin>                                  discovery reply
//! 2,<dest>,<source>,<co2>,<temp>,<humidity>,<nonce>   data
//! 3,<nonce>                                           data ack
//! ```

pub mod mesh;
pub mod sensor;

pub use mesh::{
    DecodeError, MeshConfig, MeshError, MeshNode, MeshResult, MeshSimulator, Message, NodeAddress,
    NodeRole, SimConfig,
};
pub use sensor::{SensorPoll, SensorReading, SensorSource};
