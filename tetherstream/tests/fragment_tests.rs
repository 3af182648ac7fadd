//! Fragmentation tests over a connected pair.

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{messages, Pair};
use tetherstream::packet::NO_SEQUENCE;
use tetherstream::{ConnectionConfig, DeliveryGuarantee, Packet};

fn pattern(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>())
}

#[test]
fn large_ordered_message_split_and_reassembled() {
    let now = Instant::now();
    let config = ConnectionConfig {
        resend_limit: 5,
        keep_alive_interval: Duration::from_millis(100),
        missed_pings_threshold: 6,
        ..Default::default()
    };
    let pair = Pair::connect(config, now);
    let payload = pattern(4000);
    pair.client
        .send(payload.clone(), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();

    let sent = pair.client_sink.take();
    let fragments: Vec<Packet> = sent.iter().map(|d| Packet::decode(d).unwrap()).collect();
    let mut sizes = Vec::new();
    let mut message_ids = Vec::new();
    for packet in &fragments {
        let Packet::Fragment { fragment, chunk, .. } = packet else {
            panic!("expected fragment, got {packet:?}");
        };
        assert_eq!(fragment.total, 4);
        assert_eq!(fragment.sequence, Some(0));
        sizes.push(chunk.len());
        message_ids.push(fragment.message_id);
    }
    assert_eq!(sizes, vec![1024, 1024, 1024, 928]);
    assert!(message_ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(pair.client.in_flight(), 4);

    for index in [3, 1, 0] {
        pair.server.handle_datagram(&sent[index], now);
    }
    assert!(messages(&pair.server).is_empty());
    assert_eq!(pair.server.pending_fragments(), 1);

    pair.server.handle_datagram(&sent[2], now);
    assert_eq!(messages(&pair.server), vec![payload]);
    assert_eq!(pair.server.pending_fragments(), 0);

    pair.to_client(now);
    assert_eq!(pair.client.in_flight(), 0);
}

#[test]
fn fragmented_message_keeps_its_place_in_order() {
    let now = Instant::now();
    let pair = Pair::connect(ConnectionConfig::default(), now);
    let big = pattern(2500);
    pair.client
        .send(big.clone(), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();
    pair.client
        .send(Bytes::from_static(b"after"), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();
    let sent = pair.client_sink.take();
    assert_eq!(sent.len(), 4);

    // The small message overtakes every fragment.
    pair.server.handle_datagram(&sent[3], now);
    assert!(messages(&pair.server).is_empty());
    for datagram in &sent[..3] {
        pair.server.handle_datagram(datagram, now);
    }
    assert_eq!(
        messages(&pair.server),
        vec![big, Bytes::from_static(b"after")]
    );
}

#[test]
fn large_unordered_message_uses_sentinel_sequence() {
    let now = Instant::now();
    let pair = Pair::connect(ConnectionConfig::default(), now);
    let payload = pattern(2100);
    pair.client
        .send(payload.clone(), DeliveryGuarantee::ReliableUnordered, now)
        .unwrap();
    let sent = pair.client_sink.take();
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|d| d[9] == NO_SEQUENCE));
    assert_eq!(pair.client.send_sequence(), 0);

    for datagram in sent.iter().rev() {
        pair.server.handle_datagram(datagram, now);
    }
    assert_eq!(messages(&pair.server), vec![payload]);
}

#[test]
fn duplicate_fragments_do_not_duplicate_message() {
    let now = Instant::now();
    let pair = Pair::connect(ConnectionConfig::default(), now);
    let payload = pattern(1500);
    pair.client
        .send(payload.clone(), DeliveryGuarantee::ReliableUnordered, now)
        .unwrap();
    let sent = pair.client_sink.take();

    pair.server.handle_datagram(&sent[0], now);
    pair.server.handle_datagram(&sent[0], now);
    pair.server.handle_datagram(&sent[1], now);
    pair.server.handle_datagram(&sent[1], now);
    assert_eq!(messages(&pair.server), vec![payload]);
}

#[test]
fn payload_at_fragment_size_is_not_fragmented() {
    let now = Instant::now();
    let pair = Pair::connect(ConnectionConfig::default(), now);
    pair.client
        .send(pattern(1024), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();
    let packets = pair.client_sink.take_packets();
    assert_eq!(packets.len(), 1);
    assert!(matches!(packets[0], Packet::ReliableOrdered { sequence: 0, .. }));
}

#[test]
fn disconnect_discards_partial_messages() {
    let now = Instant::now();
    let pair = Pair::connect(ConnectionConfig::default(), now);
    pair.client
        .send(pattern(3000), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();
    let sent = pair.client_sink.take();
    pair.server.handle_datagram(&sent[0], now);
    assert_eq!(pair.server.pending_fragments(), 1);

    pair.server.close();
    assert_eq!(pair.server.pending_fragments(), 0);
}

#[test]
fn rejected_fragment_is_not_acknowledged() {
    let now = Instant::now();
    let client_config = ConnectionConfig::default();
    let server_config = ConnectionConfig {
        max_fragment_size: 512,
        ..Default::default()
    };
    let pair = Pair::connect_with(client_config, server_config, now);
    pair.client
        .send(pattern(1500), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();
    pair.client
        .send(Bytes::from_static(b"after"), DeliveryGuarantee::ReliableOrdered, now)
        .unwrap();

    assert_eq!(pair.to_server(now), 3);
    // The 1024-byte first chunk exceeds the server's fragment size and is
    // neither stored nor acknowledged; the 476-byte tail and "after" are.
    assert_eq!(pair.to_client(now), 2);
    assert_eq!(pair.client.in_flight(), 1);
    assert!(messages(&pair.server).is_empty());
    assert_eq!(pair.server.pending_fragments(), 1);
    assert!(pair.server.is_connected());
}
