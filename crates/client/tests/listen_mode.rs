//! Listen-mode scenarios: happy path delivery, reconnect with offset
//! continuity, unsubscribe round-trips, and client shutdown.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::{
    free_port, handshake, init_tracing, offsets_frame, plan, wait_until, MockCluster,
};
use parking_lot::Mutex;
use rill_client::{ClientError, PollingClient, Pop, SubscribeOptions, ThreadedClient};

const PUB: (&str, u16) = ("pub1", 9000);
const OLD_SERVER: &str = "1.30.21";

fn batch_options() -> SubscribeOptions {
    SubscribeOptions::new()
        .with_action("act1")
        .with_batch_size(10)
        .with_throttle(0.1)
        .with_resub_timeout(Duration::from_millis(250))
}

#[test]
fn happy_path_delivers_rows_in_offset_order() {
    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts", "px"]);
    let topic = node.topic_for("trades", "act1");
    {
        let topic = topic.clone();
        node.set_feeder(move |_req| {
            vec![
                plan(0, handshake(&topic, "trades", &["ts", "px"])),
                plan(0, offsets_frame(&topic, 42, &[40, 41, 42])),
            ]
        });
    }

    let client = ThreadedClient::new(i32::from(free_port()), cluster.connector()).unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = client
        .subscribe_batch(PUB.0, PUB.1, "trades", batch_options(), move |msgs| {
            for msg in msgs {
                tx.send(msg.offset).unwrap();
            }
        })
        .unwrap();

    let mut offsets = Vec::new();
    while offsets.len() < 3 {
        offsets.push(rx.recv_timeout(Duration::from_secs(5)).expect("row delivery"));
    }
    assert_eq!(offsets, vec![40, 41, 42]);
    assert_eq!(handle.id(), format!("{}:{}/trades/act1", PUB.0, PUB.1));
    assert_eq!(node.publish_requests()[0].offset, -1);

    client.exit();
}

#[test]
fn reconnect_resumes_at_next_expected_offset() {
    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts", "px"]);
    let topic = node.topic_for("trades", "act1");
    {
        let topic = topic.clone();
        let mut publish_seq = 0;
        node.set_feeder(move |_req| {
            publish_seq += 1;
            if publish_seq == 1 {
                vec![
                    plan(0, handshake(&topic, "trades", &["ts", "px"])),
                    plan(0, offsets_frame(&topic, 42, &[40, 41, 42])),
                ]
            } else {
                vec![
                    plan(0, handshake(&topic, "trades", &["ts", "px"])),
                    plan(0, offsets_frame(&topic, 45, &[43, 44, 45])),
                ]
            }
        });
    }

    let client = ThreadedClient::new(i32::from(free_port()), cluster.connector()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .subscribe_batch(PUB.0, PUB.1, "trades", batch_options(), move |msgs| {
            sink.lock().extend(msgs.iter().map(|m| m.offset));
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 3));

    // Publisher drops the stream; the controller re-subscribes at 43
    node.close_streams();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 6));

    assert_eq!(*seen.lock(), vec![40, 41, 42, 43, 44, 45]);
    let publishes = node.publish_requests();
    assert_eq!(publishes.len(), 2);
    assert_eq!(publishes[1].offset, 43, "resubscribe must resume at last offset + 1");

    client.exit();
}

#[test]
fn unsubscribe_round_trip_restores_initial_state() {
    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts"]);
    let listen_port = free_port();

    let client = PollingClient::new(i32::from(listen_port), cluster.connector()).unwrap();
    let handle = client
        .subscribe(PUB.0, PUB.1, "trades", SubscribeOptions::new().with_action("act1"))
        .unwrap();

    client.unsubscribe(PUB.0, PUB.1, "trades", "act1").unwrap();
    assert!(handle.is_stopped());
    assert!(matches!(
        handle.queue().pop(Duration::from_millis(10)),
        Pop::Closed
    ));
    let stops = node.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].1, listen_port);
    assert_eq!(stops[0].2, "trades");
    assert_eq!(stops[0].3, "act1");

    // Double unsubscribe is a warning-level no-op
    client.unsubscribe(PUB.0, PUB.1, "trades", "act1").unwrap();
    assert_eq!(node.stop_count(), 1);

    // The listener stayed bound: a fresh subscribe still works
    let handle = client
        .subscribe(PUB.0, PUB.1, "trades", SubscribeOptions::new().with_action("act1"))
        .unwrap();
    assert!(!handle.is_stopped());

    client.exit();
}

#[test]
fn subscribe_collision_requires_allow_exists() {
    init_tracing();
    let mut cluster = MockCluster::new();
    cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts"]);

    let client = PollingClient::new(i32::from(free_port()), cluster.connector()).unwrap();
    let options = SubscribeOptions::new().with_action("act1");
    client.subscribe(PUB.0, PUB.1, "trades", options.clone()).unwrap();

    let err = client
        .subscribe(PUB.0, PUB.1, "trades", options.clone())
        .unwrap_err();
    assert!(matches!(err, ClientError::AlreadySubscribed(_)));

    assert!(client
        .subscribe(PUB.0, PUB.1, "trades", options.with_allow_exists(true))
        .is_ok());

    client.exit();
}

#[test]
fn exit_is_idempotent_and_final() {
    init_tracing();
    let mut cluster = MockCluster::new();
    cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts"]);

    let client = PollingClient::new(i32::from(free_port()), cluster.connector()).unwrap();
    let handle = client
        .subscribe(PUB.0, PUB.1, "trades", SubscribeOptions::new())
        .unwrap();

    client.exit();
    client.exit();
    assert!(client.is_exit());
    assert!(handle.is_stopped());
    assert!(matches!(
        client.subscribe(PUB.0, PUB.1, "other", SubscribeOptions::new()),
        Err(ClientError::Exiting)
    ));
}

#[test]
fn listen_mode_against_new_server_is_forced_reverse() {
    init_tracing();
    let mut cluster = MockCluster::new();
    // 2.00.10 only publishes over reverse connections
    cluster.add_node(PUB.0, PUB.1, "2.00.10", &["ts"]);

    let client = PollingClient::new(i32::from(free_port()), cluster.connector()).unwrap();
    // The configured port is ignored with a warning and the subscription
    // still succeeds over a reverse connection.
    let handle = client
        .subscribe(PUB.0, PUB.1, "trades", SubscribeOptions::new())
        .unwrap();
    assert!(!handle.is_stopped());
    client.exit();
}

#[test]
fn reverse_mode_against_old_server_is_a_config_error() {
    init_tracing();
    let mut cluster = MockCluster::new();
    cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts"]);

    let client = PollingClient::new(0, cluster.connector()).unwrap();
    let err = client
        .subscribe(PUB.0, PUB.1, "trades", SubscribeOptions::new())
        .unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}

#[test]
fn negative_listening_port_is_rejected() {
    let cluster = MockCluster::new();
    assert!(matches!(
        PollingClient::new(-1, cluster.connector()),
        Err(ClientError::Config(_))
    ));
}

#[test]
fn msg_as_table_with_deserializer_is_rejected() {
    use rill_client::{DeserializeError, StreamDeserializer};
    use rill_protocol::Vector;

    struct Noop;
    impl StreamDeserializer for Noop {
        fn parse_blob(
            &self,
            _data: &Vector,
        ) -> Result<(Vec<Vector>, Vec<String>), DeserializeError> {
            Ok((Vec::new(), Vec::new()))
        }
    }

    init_tracing();
    let mut cluster = MockCluster::new();
    cluster.add_node(PUB.0, PUB.1, OLD_SERVER, &["ts"]);
    let client = PollingClient::new(i32::from(free_port()), cluster.connector()).unwrap();

    let options = SubscribeOptions::new()
        .with_msg_as_table(true)
        .with_deserializer(Arc::new(Noop));
    assert!(matches!(
        client.subscribe(PUB.0, PUB.1, "trades", options),
        Err(ClientError::Config(_))
    ));
}
