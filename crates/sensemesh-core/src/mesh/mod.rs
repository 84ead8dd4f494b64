//! Sensor Mesh Protocol
//!
//! A self-organizing multi-hop mesh over a half-duplex, single-channel
//! radio. Sensor nodes learn their hop distance to a single sink, relay
//! readings hop by hop, and recover from dead relays through retries and
//! next-hop eviction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MeshNode (dispatcher)                            │
//! │   sensor tick ─► outbound ─► transmit gate ─► RadioAdapter              │
//! │   RadioAdapter ─► inbound ─► dispatch ─► routing / delivery             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │                    │                        │
//!          ▼                    ▼                        ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌────────────────────────────────┐
//! │   RouteState     │ │  DeliveryState   │ │        RadioAdapter            │
//! │ level, next hops │ │ in-flight log,   │ │ interrupt flags, one-slot rx   │
//! │                  │ │ ack timer, retry │ │ channel, RadioDriver calls     │
//! └──────────────────┘ └──────────────────┘ └────────────────────────────────┘
//!          │                    │                        │
//!          └────────────────────┴────── DedupQueue ──────┘
//!                                       Message codec
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sensemesh_core::mesh::{MeshConfig, MeshNode, NodeAddress, SimRadio};
//! use sensemesh_core::sensor::SyntheticSensor;
//!
//! let (radio, air) = SimRadio::new();
//! let config = MeshConfig::sensor(NodeAddress::parse("aa:bb:cc:dd:ee:02")?);
//! let mut node = MeshNode::new(config, radio, SyntheticSensor::new(1))?;
//!
//! node.step(Duration::from_millis(0))?;
//! assert_eq!(air.take_transmission(), Some(b"0".to_vec())); // discovery
//! ```

pub mod traits;
pub mod packet;
pub mod queue;
pub mod routing;
pub mod delivery;
pub mod radio;
pub mod sim_radio;
pub mod node;
pub mod simulation;

// Re-export main types
pub use traits::{MeshConfig, MeshError, MeshNetwork, MeshResult, MeshStats, NodeRole};
pub use packet::{DataMessage, DecodeError, Message, MessageKind, NodeAddress};
pub use queue::DedupQueue;
pub use routing::{ReplyOutcome, RouteState};
pub use delivery::{DeliveryState, RetryExpiry};
pub use radio::{
    DriverError, InterruptHandle, RadioAdapter, RadioDriver, ReceiveErrorKind, RxEvent,
    TransmitStatus,
};
pub use sim_radio::{SimRadio, SimRadioHandle};
pub use node::{DeliveredReading, MeshNode};
pub use simulation::{MeshSimulator, NodeReport, SimConfig, SimEvent, SimStats, Topology};
