//! Mesh node and protocol dispatcher
//!
//! A [`MeshNode`] owns everything one radio node needs: routing state,
//! delivery state, the outbound and inbound queues, the radio adapter and
//! the sensor. [`MeshNode::step`] runs one loop iteration and must be
//! called repeatedly with a monotonic timestamp.
//!
//! # Iteration Order
//!
//! ```text
//! 1. sample sensor (if due)          ──► outbound.push_back(Data)
//! 2. drain radio receive event       ──► inbound (acks/replies first)
//! 3. consume transmit-complete       ──► radio back to receive
//! 4. ack timer                       ──► requeue / evict next hop
//! 5. isolation check                 ──► outbound.push_front(DiscoveryRequest)
//! 6. transmit outbound head          (gated by isolation and pending ack)
//! 7. dispatch inbound head
//! ```
//!
//! Only radio failures escape `step`; every other problem is logged,
//! counted in [`MeshStats`] and absorbed.

use super::delivery::DeliveryState;
use super::packet::{DataMessage, Message, NodeAddress, NONCE_MAX, NONCE_MIN};
use super::queue::DedupQueue;
use super::radio::{RadioAdapter, RadioDriver, RxEvent, TransmitStatus};
use super::routing::{ReplyOutcome, RouteState};
use super::traits::{MeshConfig, MeshNetwork, MeshResult, MeshStats, NodeRole};
use crate::sensor::{acquire, SensorReading, SensorSampler, SensorSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// A reading that reached the sink
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredReading {
    /// Node that took the reading
    pub source: NodeAddress,
    pub reading: SensorReading,
    pub nonce: u16,
    /// Sink-local time of arrival
    pub received_at: Duration,
}

impl fmt::Display for DeliveredReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.2},{:.2},{:.2}",
            self.source, self.reading.co2, self.reading.temperature, self.reading.humidity
        )
    }
}

/// One mesh node
pub struct MeshNode<D, S> {
    config: MeshConfig,
    radio: RadioAdapter<D>,
    sensor: S,
    sampler: SensorSampler,
    rng: StdRng,
    route: RouteState,
    delivery: DeliveryState,
    outbound: DedupQueue<Message>,
    inbound: DedupQueue<Message>,
    deliveries: Vec<DeliveredReading>,
    stats: MeshStats,
    now: Duration,
}

impl<D: RadioDriver, S: SensorSource> MeshNode<D, S> {
    /// Create a node and put its radio into receive mode
    ///
    /// Fails with `InvalidConfig` for out-of-range settings and with
    /// `RadioInit` if the radio refuses to start receiving.
    pub fn new(config: MeshConfig, driver: D, sensor: S) -> MeshResult<Self> {
        config.validate()?;

        let mut radio = RadioAdapter::new(driver);
        radio.start()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let route = match config.role {
            NodeRole::Sink => RouteState::sink(),
            NodeRole::Sensor => RouteState::new(),
        };

        info!(address = %config.address, role = ?config.role, "Node started");

        Ok(Self {
            sampler: SensorSampler::new(config.sensor_interval()),
            delivery: DeliveryState::new(config.ack_timeout(), config.max_retries),
            config,
            radio,
            sensor,
            rng,
            route,
            outbound: DedupQueue::new(),
            inbound: DedupQueue::new(),
            deliveries: Vec::new(),
            stats: MeshStats::default(),
            now: Duration::ZERO,
        })
    }

    /// Run one dispatcher iteration
    pub fn step(&mut self, now: Duration) -> MeshResult<()> {
        self.now = now;

        self.sample_sensor(now);
        self.drain_radio()?;
        if self.radio.poll_transmit_complete()? {
            trace!(address = %self.config.address, "Transmission complete");
        }
        self.check_retry_timer(now);
        self.check_isolation();
        self.transmit_next(now);
        self.dispatch_next();

        self.stats.events_lost = self.radio.events_lost();
        Ok(())
    }

    fn sample_sensor(&mut self, now: Duration) {
        if self.config.role == NodeRole::Sink || !self.sampler.due(now) {
            return;
        }
        let Some(acquired) = acquire(&mut self.sensor, &mut self.rng) else {
            return;
        };

        let nonce = self.rng.gen_range(NONCE_MIN..=NONCE_MAX);
        let data = DataMessage::new(self.config.address, acquired.reading, nonce);
        self.stats.readings_generated += 1;
        if acquired.synthetic {
            self.stats.synthetic_readings += 1;
        }
        debug!(nonce, synthetic = acquired.synthetic, "Queued reading");
        self.outbound.push_back(Message::Data(data));
    }

    fn drain_radio(&mut self) -> MeshResult<()> {
        match self.radio.poll_received()? {
            Some(RxEvent::Frame(bytes)) => {
                self.stats.frames_rx += 1;
                match Message::from_bytes(&bytes) {
                    Ok(message) => {
                        trace!(record = %message, "Received");
                        if message.is_priority() {
                            self.inbound.push_front(message);
                        } else {
                            self.inbound.push_back(message);
                        }
                    }
                    Err(e) => {
                        self.stats.decode_failures += 1;
                        debug!(error = %e, "Dropped undecodable frame");
                    }
                }
            }
            Some(RxEvent::Error(kind)) => {
                self.stats.receive_errors += 1;
                warn!(address = %self.config.address, error = %kind, "Receive failed");
            }
            None => {}
        }
        Ok(())
    }

    fn check_retry_timer(&mut self, now: Duration) {
        let Some(expiry) = self.delivery.poll_timer(now) else {
            return;
        };
        self.stats.retries += 1;
        for message in expiry.requeue {
            self.outbound.push_back(message);
        }
        if expiry.exhausted {
            if let Some(evicted) = self.route.evict_head() {
                self.stats.evictions += 1;
                warn!(
                    address = %self.config.address,
                    next_hop = %evicted,
                    "Retry budget exhausted, evicted next hop"
                );
            }
        }
    }

    fn check_isolation(&mut self) {
        if !self.route.refresh_isolation() || self.delivery.is_awaiting_ack() {
            return;
        }
        // Re-seat an existing request at the head so held traffic cannot block it
        self.outbound
            .remove_first_matching(|m| matches!(m, Message::DiscoveryRequest));
        self.outbound.push_front(Message::DiscoveryRequest);
    }

    fn transmit_next(&mut self, now: Duration) {
        let Some(head) = self.outbound.front() else {
            return;
        };

        // Gated items stay queued until the gate opens
        if self.route.is_isolated() && !matches!(head, Message::DiscoveryRequest) {
            return;
        }
        if matches!(head, Message::Data(_)) && self.delivery.is_awaiting_ack() {
            return;
        }

        let mut message = head.clone();
        if let Message::Data(data) = &mut message {
            data.dest = self.route.next_hop();
        }

        match self.radio.transmit(&message.to_bytes()) {
            TransmitStatus::Accepted => {
                self.outbound.pop_front();
                self.stats.frames_tx += 1;
                if matches!(message, Message::DiscoveryRequest) {
                    self.stats.discovery_sent += 1;
                }
                debug!(address = %self.config.address, record = %message, "Sent");
                self.delivery.record_sent(&message, now);
            }
            TransmitStatus::Busy => {}
            TransmitStatus::Error(_) => self.stats.transmit_failures += 1,
        }
    }

    fn dispatch_next(&mut self) {
        let Some(message) = self.inbound.pop_front() else {
            return;
        };

        match message {
            Message::DiscoveryRequest => {
                if let Some(reply) = self.route.reply_for_request(self.config.address) {
                    if self.outbound.push_front(reply) {
                        self.stats.replies_sent += 1;
                    }
                }
            }
            Message::DiscoveryReply { level, origin } => {
                let outcome = self.route.on_discovery_reply(level, origin);
                if outcome.is_accepted() {
                    // Replies are broadcast, so one may arrive before our own request left
                    self.outbound
                        .remove_first_matching(|m| matches!(m, Message::DiscoveryRequest));
                    self.delivery.on_discovery_satisfied();
                }
                if let ReplyOutcome::Improved { level } = outcome {
                    debug!(address = %self.config.address, level, "Level updated");
                }
            }
            Message::Data(data) => self.on_data(data),
            Message::DataAck { nonce } => {
                if self.delivery.on_ack(nonce) {
                    self.stats.acks_matched += 1;
                    debug!(address = %self.config.address, nonce, "Ack matched");
                } else {
                    self.stats.acks_unmatched += 1;
                }
            }
        }
    }

    fn on_data(&mut self, mut data: DataMessage) {
        if !data.is_for(self.config.address) {
            self.stats.overheard += 1;
            trace!(dest = ?data.dest, "Ignored data for another node");
            return;
        }

        let nonce = data.nonce;
        if self.route.is_sink() {
            let delivered = DeliveredReading {
                source: data.source,
                reading: data.reading,
                nonce,
                received_at: self.now,
            };
            info!(reading = %delivered, "Reading delivered");
            self.stats.readings_delivered += 1;
            self.deliveries.push(delivered);
        } else {
            data.dest = None;
            if self.outbound.push_back(Message::Data(data)) {
                self.stats.forwarded += 1;
            }
        }

        if self.outbound.push_front(Message::ack(nonce)) {
            self.stats.acks_sent += 1;
        }
    }

    pub fn address(&self) -> NodeAddress {
        self.config.address
    }

    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn level(&self) -> Option<u32> {
        self.route.level()
    }

    pub fn is_isolated(&self) -> bool {
        self.route.is_isolated()
    }

    pub fn next_hop(&self) -> Option<NodeAddress> {
        self.route.next_hop()
    }

    pub fn next_hops(&self) -> Vec<NodeAddress> {
        self.route.next_hops().copied().collect()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.delivery.is_awaiting_ack()
    }

    pub fn retry_count(&self) -> u8 {
        self.delivery.retry_count()
    }

    pub fn outbound(&self) -> impl Iterator<Item = &Message> {
        self.outbound.iter()
    }

    pub fn inbound(&self) -> impl Iterator<Item = &Message> {
        self.inbound.iter()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Message> {
        self.delivery.in_flight()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.delivery.in_flight_len()
    }

    /// Readings consumed at this node (sink only)
    pub fn deliveries(&self) -> &[DeliveredReading] {
        &self.deliveries
    }

    /// Take and clear the delivered readings
    pub fn take_deliveries(&mut self) -> Vec<DeliveredReading> {
        std::mem::take(&mut self.deliveries)
    }

    pub fn stats(&self) -> MeshStats {
        self.stats.clone()
    }

    pub fn radio(&self) -> &RadioAdapter<D> {
        &self.radio
    }
}

impl<D: RadioDriver, S: SensorSource> MeshNetwork for MeshNode<D, S> {
    fn address(&self) -> NodeAddress {
        self.config.address
    }

    fn level(&self) -> Option<u32> {
        self.route.level()
    }

    fn is_isolated(&self) -> bool {
        self.route.is_isolated()
    }

    fn step(&mut self, now: Duration) -> MeshResult<()> {
        MeshNode::step(self, now)
    }

    fn stats(&self) -> MeshStats {
        self.stats.clone()
    }
}

impl<D, S> fmt::Debug for MeshNode<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshNode")
            .field("address", &self.config.address)
            .field("role", &self.config.role)
            .field("level", &self.route.level())
            .field("next_hops", &self.route.next_hop_count())
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .field("awaiting_ack", &self.delivery.is_awaiting_ack())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::sim_radio::{SimRadio, SimRadioHandle};
    use crate::mesh::traits::MeshError;
    use crate::sensor::{ScriptedSensor, SensorPoll};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn sensor_node(index: u16) -> (MeshNode<SimRadio, ScriptedSensor>, SimRadioHandle) {
        let (radio, handle) = SimRadio::new();
        let config = MeshConfig::sensor(NodeAddress::from_index(index)).with_seed(7);
        let node = MeshNode::new(config, radio, ScriptedSensor::default()).unwrap();
        (node, handle)
    }

    fn finish_tx(node: &mut MeshNode<SimRadio, ScriptedSensor>, handle: &SimRadioHandle, now: u64) {
        handle.take_transmission();
        handle.complete_transmission();
        node.step(ms(now)).unwrap();
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let (radio, _handle) = SimRadio::new();
        let config = MeshConfig::default().with_max_retries(0);
        let err = MeshNode::new(config, radio, ScriptedSensor::default()).unwrap_err();
        assert!(matches!(err, MeshError::InvalidConfig(_)));
    }

    #[test]
    fn test_new_fails_when_radio_cannot_receive() {
        let (radio, handle) = SimRadio::new();
        handle.fail_next_receive(-2);
        let err = MeshNode::new(MeshConfig::default(), radio, ScriptedSensor::default()).unwrap_err();
        assert!(matches!(err, MeshError::RadioInit(_)));
    }

    #[test]
    fn test_isolated_node_broadcasts_discovery() {
        let (mut node, handle) = sensor_node(2);
        node.step(ms(0)).unwrap();
        assert_eq!(handle.take_transmission(), Some(b"0".to_vec()));
        assert!(node.is_awaiting_ack());
        assert_eq!(node.stats().discovery_sent, 1);
    }

    #[test]
    fn test_discovery_retried_after_timeout() {
        let (mut node, handle) = sensor_node(2);
        node.step(ms(0)).unwrap();
        finish_tx(&mut node, &handle, 10);

        // Nothing new until the timer runs out
        node.step(ms(500)).unwrap();
        assert_eq!(handle.take_transmission(), None);

        node.step(ms(1000)).unwrap();
        assert_eq!(handle.take_transmission(), Some(b"0".to_vec()));
        assert_eq!(node.stats().retries, 1);
    }

    #[test]
    fn test_isolated_node_holds_data() {
        let (radio, handle) = SimRadio::new();
        let sensor = ScriptedSensor::new([SensorPoll::Ready(SensorReading::new(500.0, 20.0, 50.0))]);
        let config = MeshConfig::sensor(NodeAddress::from_index(3)).with_seed(1);
        let mut node = MeshNode::new(config, radio, sensor).unwrap();

        node.step(ms(0)).unwrap();
        // Discovery goes out first, data waits behind it
        assert_eq!(handle.take_transmission(), Some(b"0".to_vec()));
        assert_eq!(node.outbound_len(), 1);
        assert!(matches!(node.outbound().next(), Some(Message::Data(_))));
    }

    #[test]
    fn test_sink_answers_discovery_with_level_zero() {
        let (radio, handle) = SimRadio::new();
        let sink_addr = NodeAddress::from_index(1);
        let mut sink = MeshNode::new(MeshConfig::sink(sink_addr), radio, ScriptedSensor::default()).unwrap();
        assert!(!sink.is_isolated());
        assert_eq!(sink.level(), Some(0));

        assert!(handle.deliver(b"0"));
        sink.step(ms(0)).unwrap();
        sink.step(ms(2)).unwrap();
        assert_eq!(
            handle.take_transmission(),
            Some(Message::discovery_reply(0, sink_addr).to_bytes())
        );
    }

    #[test]
    fn test_sink_records_delivery_and_acks() {
        let (radio, handle) = SimRadio::new();
        let sink_addr = NodeAddress::from_index(1);
        let mut sink = MeshNode::new(MeshConfig::sink(sink_addr), radio, ScriptedSensor::default()).unwrap();

        let mut data = DataMessage::new(
            NodeAddress::from_index(9),
            SensorReading::new(420.0, 19.5, 60.0),
            5555,
        );
        data.dest = Some(sink_addr);
        handle.deliver(&Message::Data(data).to_bytes());

        sink.step(ms(0)).unwrap();
        sink.step(ms(2)).unwrap();
        assert_eq!(handle.take_transmission(), Some(b"3,5555".to_vec()));

        let delivered = sink.take_deliveries();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].to_string(), "02:00:00:00:00:09,420.00,19.50,60.00");
        assert_eq!(sink.outbound_len(), 0);
        assert_eq!(sink.stats().readings_delivered, 1);
    }

    #[test]
    fn test_decode_failure_is_counted() {
        let (mut node, handle) = sensor_node(2);
        handle.deliver(b"garbage");
        node.step(ms(0)).unwrap();
        assert_eq!(node.stats().decode_failures, 1);
        assert_eq!(node.inbound_len(), 0);
    }

    #[test]
    fn test_rearm_failure_escapes_step() {
        let (mut node, handle) = sensor_node(2);
        handle.deliver(b"0");
        handle.fail_next_receive(-9);
        assert!(matches!(node.step(ms(0)), Err(MeshError::RadioFatal(_))));
    }
}
