//! Delivery front-end scenarios: table-mode coalescing, thread-pool
//! fan-out, and event decoding.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    handshake, init_tracing, long_col, offsets_frame, plan, sym_col, wait_until, MockCluster,
};
use parking_lot::Mutex;
use rill_client::{
    EventClient, EventSchema, MessagePayload, SubscribeOptions, ThreadPooledClient, ThreadedClient,
};
use rill_protocol::encode::data_frame;
use rill_protocol::{Value, Vector};

const SERVER: &str = "2.00.10";

#[test]
fn table_mode_coalesces_up_to_batch_size_and_spills_the_rest() {
    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node("p", 9400, SERVER, &["ts", "px"]);
    let topic = node.topic_for("t", "act");
    {
        let topic = topic.clone();
        node.set_feeder(move |_req| {
            let first: Vec<i64> = (0..100).collect();
            let second: Vec<i64> = (100..200).collect();
            vec![
                plan(0, handshake(&topic, "t", &["ts", "px"])),
                plan(0, offsets_frame(&topic, 99, &first)),
                plan(20, offsets_frame(&topic, 199, &second)),
            ]
        });
    }

    let client = ThreadedClient::new(0, cluster.connector()).unwrap();
    let batches: Arc<Mutex<Vec<(i64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    client
        .subscribe_batch(
            "p",
            9400,
            "t",
            SubscribeOptions::new()
                .with_action("act")
                .with_msg_as_table(true)
                .with_batch_size(150)
                .with_throttle(0.1),
            move |msgs| {
                for msg in msgs {
                    let MessagePayload::Table(table) = &msg.payload else {
                        panic!("table mode must deliver tables");
                    };
                    assert_eq!(table.col_names, vec!["ts", "px"]);
                    sink.lock().push((msg.offset, table.rows()));
                }
            },
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || batches.lock().len() >= 2));
    let delivered = batches.lock().clone();
    // Coalescing stops at the 150-row target; the spill arrives next
    assert_eq!(delivered[0], (0, 150));
    assert_eq!(delivered[1], (150, 50));

    client.exit();
}

#[test]
fn thread_pool_delivers_every_row_exactly_once() {
    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node("p", 9500, SERVER, &["ts", "px"]);
    let topic = node.topic_for("t", "act");
    {
        let topic = topic.clone();
        node.set_feeder(move |_req| {
            let rows: Vec<i64> = (0..10).collect();
            vec![
                plan(0, handshake(&topic, "t", &["ts", "px"])),
                plan(0, offsets_frame(&topic, 9, &rows)),
            ]
        });
    }

    let client = ThreadPooledClient::new(0, 3, cluster.connector()).unwrap();
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .subscribe(
            "p",
            9500,
            "t",
            SubscribeOptions::new().with_action("act"),
            move |msg| {
                sink.lock().push(msg.offset);
            },
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() >= 10));
    let mut offsets = seen.lock().clone();
    offsets.sort_unstable();
    // No ordering guarantee across pool threads, but nothing lost or doubled
    assert_eq!(offsets, (0..10).collect::<Vec<_>>());

    client.exit();
}

#[test]
fn event_client_decodes_tuples_and_survives_bad_frames() {
    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node("p", 9600, SERVER, &["etype", "id", "qty"]);
    let topic = node.topic_for("events", "act");
    {
        let topic = topic.clone();
        node.set_feeder(move |_req| {
            let good = data_frame(
                &[topic.as_str()],
                1,
                vec![
                    sym_col(&["order", "cancel"]),
                    long_col(&[11, 12]),
                    long_col(&[5, 0]),
                ],
            );
            // Unknown event type: logged and skipped, the stream lives on
            let bad = data_frame(
                &[topic.as_str()],
                2,
                vec![sym_col(&["mystery"]), long_col(&[1]), long_col(&[2])],
            );
            let more = data_frame(
                &[topic.as_str()],
                3,
                vec![sym_col(&["order"]), long_col(&[13]), long_col(&[7])],
            );
            vec![
                plan(0, handshake(&topic, "events", &["etype", "id", "qty"])),
                plan(0, good),
                plan(0, bad),
                plan(0, more),
            ]
        });
    }

    let schemas = [
        EventSchema::new("order", ["id", "qty"]),
        EventSchema::new("cancel", ["id", "qty"]),
    ];
    let client = EventClient::new(schemas, cluster.connector()).unwrap();
    let events: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client
        .subscribe(
            "p",
            9600,
            "events",
            SubscribeOptions::new().with_action("act"),
            move |event_type, attributes| {
                let Value::Long(id) = attributes[0] else {
                    panic!("first attribute must be the id");
                };
                sink.lock().push((event_type.to_owned(), id));
            },
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || events.lock().len() >= 3));
    assert_eq!(
        events.lock().clone(),
        vec![
            ("order".to_owned(), 11),
            ("cancel".to_owned(), 12),
            ("order".to_owned(), 13),
        ]
    );

    client.exit();
}

#[test]
fn single_flat_row_is_promoted_to_one_message() {
    use rill_client::{PollingClient, Pop};
    use rill_protocol::Frame;

    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node("p", 9800, SERVER, &["id", "tag"]);
    let topic = node.topic_for("t", "act");
    {
        let topic = topic.clone();
        node.set_feeder(move |_req| {
            // Some publishers emit a lone row as bare 1-D columns
            let flat = Frame {
                sent_time: 0,
                offset: 5,
                topics: vec![topic.clone()],
                payload: Value::Vector(Vector::any(vec![
                    Value::Long(7),
                    Value::Symbol("x".into()),
                ])),
            };
            vec![plan(0, handshake(&topic, "t", &["id", "tag"])), plan(0, flat)]
        });
    }

    let client = PollingClient::new(0, cluster.connector()).unwrap();
    let handle = client
        .subscribe("p", 9800, "t", SubscribeOptions::new().with_action("act"))
        .unwrap();

    match handle.queue().pop(Duration::from_secs(5)) {
        Pop::Some(msg) => {
            assert_eq!(msg.offset, 5);
            let MessagePayload::Row(row) = &msg.payload else {
                panic!("expected a row message");
            };
            assert_eq!(
                row.values,
                vec![Value::Long(7), Value::Symbol("x".into())]
            );
        }
        other => panic!("expected a row, got {other:?}"),
    }
    // Exactly one message came out of the 1xC frame
    assert!(matches!(
        handle.queue().pop(Duration::from_millis(100)),
        Pop::Timeout
    ));

    client.exit();
}

#[test]
fn deserializer_splits_blob_rows_with_symbol_tags() {
    use rill_client::{DeserializeError, PollingClient, Pop, StreamDeserializer};

    /// Splits rows whose blob cell is `"<symbol>|<value>"`
    struct PipeSplit;
    impl StreamDeserializer for PipeSplit {
        fn parse_blob(
            &self,
            data: &Vector,
        ) -> Result<(Vec<Vector>, Vec<String>), DeserializeError> {
            let mut rows = Vec::new();
            let mut symbols = Vec::new();
            for row in data.split_rows() {
                let Some(Value::Blob(raw)) = row.values.last() else {
                    return Err(DeserializeError::MissingBlob);
                };
                let text = String::from_utf8(raw.clone())
                    .map_err(|_| DeserializeError::Other("blob is not UTF-8".into()))?;
                let (symbol, value) = text
                    .split_once('|')
                    .ok_or_else(|| DeserializeError::Other("missing separator".into()))?;
                symbols.push(symbol.to_owned());
                rows.push(Vector::any(vec![Value::String(value.to_owned())]));
            }
            Ok((rows, symbols))
        }
    }

    init_tracing();
    let mut cluster = MockCluster::new();
    let node = cluster.add_node("p", 9700, SERVER, &["blob"]);
    let topic = node.topic_for("t", "act");
    {
        let topic = topic.clone();
        node.set_feeder(move |_req| {
            let blobs = Vector {
                data_type: rill_protocol::DataType::Blob,
                values: vec![
                    Value::Blob(b"trades|first".to_vec()),
                    Value::Blob(b"quotes|second".to_vec()),
                ],
            };
            vec![
                plan(0, handshake(&topic, "t", &["blob"])),
                plan(0, data_frame(&[topic.as_str()], 1, vec![blobs])),
            ]
        });
    }

    let client = PollingClient::new(0, cluster.connector()).unwrap();
    let handle = client
        .subscribe(
            "p",
            9700,
            "t",
            SubscribeOptions::new()
                .with_action("act")
                .with_deserializer(Arc::new(PipeSplit)),
        )
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match handle.queue().pop(Duration::from_secs(5)) {
            Pop::Some(msg) => {
                let MessagePayload::Deserialized { symbol, row } = &msg.payload else {
                    panic!("expected a deserialized row");
                };
                seen.push((msg.offset, symbol.clone(), row.values[0].clone()));
            }
            other => panic!("expected a row, got {other:?}"),
        }
    }
    assert_eq!(seen[0], (0, "trades".to_owned(), Value::String("first".into())));
    assert_eq!(seen[1], (1, "quotes".to_owned(), Value::String("second".into())));

    client.exit();
}
