//! Whole-node protocol flows driven through the simulated radio

use sensemesh_core::mesh::{
    DataMessage, MeshConfig, MeshNode, Message, NodeAddress, ReceiveErrorKind, SimRadio,
    SimRadioHandle,
};
use sensemesh_core::sensor::{
    ScriptedSensor, SensorPoll, SensorReading, SYNTHETIC_CO2, SYNTHETIC_HUMIDITY,
    SYNTHETIC_TEMPERATURE,
};
use std::time::Duration;

const SINK: &str = "AA:BB:CC:DD:EE:01";

type Node = MeshNode<SimRadio, ScriptedSensor>;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn sink_address() -> NodeAddress {
    NodeAddress::parse(SINK).unwrap()
}

fn self_address() -> NodeAddress {
    NodeAddress::parse("aa:bb:cc:dd:ee:02").unwrap()
}

fn new_node(script: Vec<SensorPoll>) -> (Node, SimRadioHandle) {
    let (radio, handle) = SimRadio::new();
    let config = MeshConfig::sensor(self_address()).with_seed(11);
    let node = MeshNode::new(config, radio, ScriptedSensor::new(script)).unwrap();
    (node, handle)
}

/// Complete whatever the node is sending, then run one iteration
fn tick(node: &mut Node, handle: &SimRadioHandle, now: u64) -> Option<Message> {
    let sent = handle.take_transmission();
    if sent.is_some() {
        handle.complete_transmission();
    }
    node.step(ms(now)).unwrap();
    sent.map(|bytes| Message::from_bytes(&bytes).unwrap())
}

/// Bring a fresh node to level 1 behind the sink; returns the next free timestamp
fn connect(node: &mut Node, handle: &SimRadioHandle) -> u64 {
    node.step(ms(0)).unwrap();
    assert_eq!(tick(node, handle, 5), Some(Message::DiscoveryRequest));
    assert!(handle.deliver(&Message::discovery_reply(0, sink_address()).to_bytes()));
    tick(node, handle, 10);
    assert!(!node.is_isolated());
    20
}

#[test]
fn test_discovery_reply_from_sink_connects_node() {
    let (mut node, handle) = new_node(vec![]);
    assert!(node.is_isolated());
    assert_eq!(node.level(), None);

    node.step(ms(0)).unwrap();
    assert_eq!(handle.sent_records(), vec!["0".to_string()]);
    assert!(node.is_awaiting_ack());

    tick(&mut node, &handle, 5);
    assert!(handle.deliver(b"1,0,AA:BB:CC:DD:EE:01"));
    tick(&mut node, &handle, 10);

    assert_eq!(node.level(), Some(1));
    assert_eq!(node.next_hops(), vec![sink_address()]);
    assert!(!node.is_isolated());
    assert!(!node.is_awaiting_ack());
    assert_eq!(node.in_flight_len(), 0);
}

#[test]
fn test_ack_correlation_by_nonce() {
    let reading = SensorReading::new(650.0, 23.0, 44.0);
    let (mut node, handle) = new_node(vec![SensorPoll::Ready(reading)]);
    let now = connect(&mut node, &handle);

    // Data held while isolated goes out now, addressed to the sink
    node.step(ms(now)).unwrap();
    let sent = tick(&mut node, &handle, now + 5).unwrap();
    let nonce = match &sent {
        Message::Data(data) => {
            assert_eq!(data.dest, Some(sink_address()));
            assert_eq!(data.source, self_address());
            data.nonce
        }
        other => panic!("expected data, got {:?}", other),
    };
    assert!(node.is_awaiting_ack());

    let unrelated = if nonce == 9999 { 1000 } else { 9999 };
    assert!(handle.deliver(&Message::ack(unrelated).to_bytes()));
    node.step(ms(now + 10)).unwrap();
    assert_eq!(node.in_flight_len(), 1);
    assert!(node.is_awaiting_ack());

    assert!(handle.deliver(&Message::ack(nonce).to_bytes()));
    node.step(ms(now + 15)).unwrap();
    assert_eq!(node.in_flight_len(), 0);
    assert!(!node.is_awaiting_ack());
    assert_eq!(node.stats().acks_matched, 1);
    assert_eq!(node.stats().acks_unmatched, 1);
}

#[test]
fn test_overheard_data_leaves_queues_unchanged() {
    let (mut node, handle) = new_node(vec![]);
    let now = connect(&mut node, &handle);

    let outbound: Vec<Message> = node.outbound().cloned().collect();
    let in_flight = node.in_flight_len();

    let mut data = DataMessage::new(
        NodeAddress::from_index(9),
        SensorReading::new(400.0, 20.0, 50.0),
        1234,
    );
    data.dest = Some(NodeAddress::from_index(8));
    assert!(handle.deliver(&Message::Data(data).to_bytes()));
    node.step(ms(now)).unwrap();

    assert_eq!(node.outbound().cloned().collect::<Vec<_>>(), outbound);
    assert_eq!(node.inbound_len(), 0);
    assert_eq!(node.in_flight_len(), in_flight);
    assert_eq!(node.stats().overheard, 1);
}

#[test]
fn test_relay_acks_then_forwards() {
    let (mut node, handle) = new_node(vec![]);
    let now = connect(&mut node, &handle);

    let source = NodeAddress::from_index(9);
    let mut data = DataMessage::new(source, SensorReading::new(400.0, 20.0, 50.0), 4321);
    data.dest = Some(self_address());
    assert!(handle.deliver(&Message::Data(data).to_bytes()));
    node.step(ms(now)).unwrap();

    // Ack jumps ahead of the relayed copy
    assert_eq!(node.outbound().next(), Some(&Message::ack(4321)));
    assert_eq!(node.outbound_len(), 2);

    node.step(ms(now + 5)).unwrap();
    assert_eq!(tick(&mut node, &handle, now + 10), Some(Message::ack(4321)));
    match tick(&mut node, &handle, now + 15) {
        Some(Message::Data(forwarded)) => {
            assert_eq!(forwarded.dest, Some(sink_address()));
            assert_eq!(forwarded.source, source);
            assert_eq!(forwarded.nonce, 4321);
        }
        other => panic!("expected forwarded data, got {:?}", other),
    }
    assert_eq!(node.stats().forwarded, 1);
}

#[test]
fn test_sensor_errors_yield_synthetic_readings() {
    let script = vec![
        SensorPoll::Error("no ack from sensor".to_string()),
        SensorPoll::Error("no ack from sensor".to_string()),
        SensorPoll::Error("no ack from sensor".to_string()),
    ];
    let (mut node, _handle) = new_node(script);

    for now in [0, 1000, 2000] {
        node.step(ms(now)).unwrap();
    }

    let readings: Vec<SensorReading> = node
        .outbound()
        .filter_map(|m| match m {
            Message::Data(data) => Some(data.reading),
            _ => None,
        })
        .collect();
    assert_eq!(readings.len(), 3);
    for reading in readings {
        assert!(SYNTHETIC_CO2.contains(&reading.co2));
        assert!(SYNTHETIC_TEMPERATURE.contains(&reading.temperature));
        assert!(SYNTHETIC_HUMIDITY.contains(&reading.humidity));
    }
    assert_eq!(node.stats().synthetic_readings, 3);
}

#[test]
fn test_three_expirations_evict_next_hop() {
    let reading = SensorReading::new(700.0, 25.0, 30.0);
    let (mut node, handle) = new_node(vec![SensorPoll::Ready(reading)]);
    let start = connect(&mut node, &handle);

    let mut now = start;
    while now < 3020 {
        tick(&mut node, &handle, now);
        now += 10;
        if node.stats().evictions > 0 {
            break;
        }
    }
    assert!(node.stats().evictions == 0, "evicted before the third expiry");

    tick(&mut node, &handle, now);
    let stats = node.stats();
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.evictions, 1);
    assert_eq!(node.retry_count(), 0);
    assert!(node.is_isolated());
    assert_eq!(node.level(), None);

    // Rediscovery starts immediately and the reading is still queued
    assert_eq!(tick(&mut node, &handle, now + 10), Some(Message::DiscoveryRequest));
    assert!(node.outbound().any(|m| matches!(m, Message::Data(_))));
}

#[test]
fn test_better_route_replaces_next_hops() {
    let (mut node, handle) = new_node(vec![]);
    node.step(ms(0)).unwrap();
    tick(&mut node, &handle, 5);

    let a = NodeAddress::from_index(0x10);
    let b = NodeAddress::from_index(0x11);
    handle.deliver(&Message::discovery_reply(2, a).to_bytes());
    node.step(ms(10)).unwrap();
    handle.deliver(&Message::discovery_reply(2, b).to_bytes());
    node.step(ms(15)).unwrap();
    assert_eq!(node.level(), Some(3));
    assert_eq!(node.next_hops(), vec![a, b]);

    // Worse level is ignored
    handle.deliver(&Message::discovery_reply(5, NodeAddress::from_index(0x12)).to_bytes());
    node.step(ms(20)).unwrap();
    assert_eq!(node.next_hops(), vec![a, b]);

    handle.deliver(&Message::discovery_reply(0, sink_address()).to_bytes());
    node.step(ms(25)).unwrap();
    assert_eq!(node.level(), Some(1));
    assert_eq!(node.next_hops(), vec![sink_address()]);
}

#[test]
fn test_connected_node_answers_discovery() {
    let (mut node, handle) = new_node(vec![]);
    let now = connect(&mut node, &handle);

    assert!(handle.deliver(b"0,"));
    node.step(ms(now)).unwrap();
    node.step(ms(now + 5)).unwrap();
    assert_eq!(
        tick(&mut node, &handle, now + 10),
        Some(Message::discovery_reply(1, self_address()))
    );
}

#[test]
fn test_isolated_node_stays_silent_on_discovery() {
    let (mut node, handle) = new_node(vec![]);
    node.step(ms(0)).unwrap();
    tick(&mut node, &handle, 5);

    handle.deliver(b"0");
    node.step(ms(10)).unwrap();
    assert!(!node.outbound().any(|m| matches!(m, Message::DiscoveryReply { .. })));
    assert_eq!(node.stats().replies_sent, 0);
}

#[test]
fn test_receive_errors_are_absorbed() {
    let (mut node, handle) = new_node(vec![]);
    handle.deliver_error(ReceiveErrorKind::CrcMismatch);
    node.step(ms(0)).unwrap();
    tick(&mut node, &handle, 5);
    assert!(handle.deliver(b"2,not,enough"));
    node.step(ms(10)).unwrap();

    let stats = node.stats();
    assert_eq!(stats.receive_errors, 1);
    assert_eq!(stats.decode_failures, 1);
}

#[test]
fn test_second_event_before_drain_is_lost() {
    let (mut node, handle) = new_node(vec![]);
    let now = connect(&mut node, &handle);

    handle.deliver(&Message::ack(1111).to_bytes());
    handle.deliver(&Message::ack(2222).to_bytes());
    node.step(ms(now)).unwrap();

    assert_eq!(node.stats().events_lost, 1);
    assert_eq!(node.stats().acks_unmatched, 1);
}
