//! Parser worker
//!
//! One thread per publisher stream. Decodes frames until EOF or error,
//! fans rows out to the topic queues, and keeps per-topic offsets current.
//! A failed stream hands every topic bound to its site over to the
//! reconnect controller, unless no subscription remains for the stream's
//! table.

use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use rill_protocol::{Frame, FrameDecoder, ProtocolError, Table, Value, Vector};
use tracing::{debug, error, warn};

use crate::core::StreamingCore;
use crate::message::{Message, MessagePayload};
use crate::registry::{site_of, strip_action};

/// Why the frame loop ended
enum StreamEnd {
    /// Transport or protocol failure: close the socket and schedule
    /// reconnection for the stream's topics
    Recover,
    /// Deliberate quiet exit (shutdown, dead subscription, or a
    /// deserializer that cannot make progress)
    Quiet,
}

pub(crate) fn parse_stream(core: Arc<StreamingCore>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let closer = stream.try_clone().ok();
    let mut decoder = FrameDecoder::new(BufReader::new(stream));

    // Which topics this stream feeds; learned from the first frame
    let mut topics: Vec<String> = Vec::new();

    let end = loop {
        if core.is_exit() {
            break StreamEnd::Quiet;
        }
        let frame = match decoder.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                if core.is_exit() {
                    break StreamEnd::Quiet;
                }
                if topics.is_empty() {
                    warn!(peer = %peer, err = %err, "stream failed before its first frame, cannot recover");
                    break StreamEnd::Quiet;
                }
                let alias = strip_action(&topics[0]);
                if core.registry.table_refs(alias) <= 0 {
                    debug!(peer = %peer, alias, "stream ended with no live subscriptions");
                    break StreamEnd::Quiet;
                }
                warn!(peer = %peer, err = %err, "stream failed, scheduling reconnection");
                break StreamEnd::Recover;
            }
        };

        topics.clone_from(&frame.topics);
        match handle_frame(&core, frame) {
            FrameOutcome::Continue => {}
            FrameOutcome::Fatal => break StreamEnd::Quiet,
            FrameOutcome::Broken => {
                if core.registry.table_refs(strip_action(&topics[0])) <= 0 {
                    break StreamEnd::Quiet;
                }
                break StreamEnd::Recover;
            }
        }
    };

    if let StreamEnd::Recover = end {
        if let Some(socket) = &closer {
            let _ = socket.shutdown(Shutdown::Both);
        }
        core.metrics.stream_failed();
        let site = site_of(&topics[0]).to_owned();
        for topic in core.registry.topics_on_site(&site) {
            core.reconnect.schedule(&topic);
        }
    }
    debug!(peer = %peer, "parser exiting");
}

enum FrameOutcome {
    Continue,
    /// Kill this worker without engaging reconnection
    Fatal,
    /// Protocol violation: treat the stream as lost
    Broken,
}

fn handle_frame(core: &Arc<StreamingCore>, frame: Frame) -> FrameOutcome {
    match frame.payload {
        Value::Table(table) => {
            if table.rows() != 0 {
                let err = ProtocolError::NonEmptySchemaTable(table.rows());
                error!(err = %err, "schema frame rejected");
                return FrameOutcome::Broken;
            }
            // Handshake complete for these topics
            core.metrics.schema_frame();
            for topic in &frame.topics {
                core.reconnect.clear(topic);
            }
            FrameOutcome::Continue
        }
        Value::Vector(data) => {
            core.metrics.frame();
            handle_data(core, &frame.topics, frame.offset, data)
        }
        other => {
            error!(form = %other.form(), "frame body has an invalid form, vector expected");
            FrameOutcome::Broken
        }
    }
}

fn handle_data(
    core: &Arc<StreamingCore>,
    topics: &[String],
    offset: i64,
    data: Vector,
) -> FrameOutcome {
    // Reverse-mode framing can deliver a single row as bare 1-D columns
    let data = if !core.is_listen_mode() && data.is_flat_row() {
        data.promote_flat_row()
    } else {
        data
    };
    if let Err(err) = data.check_columns() {
        error!(err = %err, "data frame columns disagree on row count");
        return FrameOutcome::Broken;
    }

    let rows = data.row_count() as i64;
    let start_offset = offset - rows + 1;
    let shared = Arc::new(data);

    // Row split is computed once and shared across the frame's topics
    let mut row_cache: Vec<Arc<Vector>> = Vec::new();

    // Hold the ready lock so registration of a topic this frame names
    // cannot race with its first rows.
    let _ready = core.ready.lock();

    for topic in topics {
        let Some(info) = core.registry.find(topic) else {
            continue;
        };

        if info.is_event {
            info.queue
                .push(Message {
                    offset,
                    payload: MessagePayload::Event(Arc::clone(&shared)),
                });
        } else if let Some(deserializer) = &info.deserializer {
            let (split, symbols) = match deserializer.parse_blob(&shared) {
                Ok(parsed) => parsed,
                Err(err) => {
                    error!(topic = %topic, err = %err, "blob deserialization failed, stopping this parser");
                    return FrameOutcome::Fatal;
                }
            };
            for (i, (row, symbol)) in split.into_iter().zip(symbols).enumerate() {
                info.queue.push(Message {
                    offset: start_offset + i as i64,
                    payload: MessagePayload::Deserialized { symbol, row },
                });
            }
        } else if info.msg_as_table {
            if info.attributes.is_empty() {
                warn!(topic = %topic, "no column names recorded, delivering raw columns");
                info.queue.push(Message::row(start_offset, Arc::clone(&shared)));
            } else {
                let table = Table::from_any_columns(&info.table, &info.attributes, &shared);
                info.queue.push(Message::table(start_offset, table));
            }
        } else {
            if row_cache.is_empty() {
                row_cache = shared.split_rows().into_iter().map(Arc::new).collect();
            }
            for (i, row) in row_cache.iter().enumerate() {
                info.queue
                    .push(Message::row(start_offset + i as i64, Arc::clone(row)));
            }
        }

        core.metrics.rows(rows.max(0) as u64);
        // Next expected row for this topic
        core.registry.update_offset(topic, offset + 1);
    }
    FrameOutcome::Continue
}
