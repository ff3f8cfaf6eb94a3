//! Frame encoding
//!
//! Writes the same wire format [`FrameDecoder`](crate::FrameDecoder) reads.
//! The subscriber itself never sends frames; this module exists for tests,
//! local tooling, and in-process publishers that exercise the client
//! end-to-end.

use bytes::{BufMut, Bytes, BytesMut};

use crate::value::{pack_form_type, DataForm, DataType, Table, Value, Vector};
use crate::{Frame, ENDIAN_BIG, ENDIAN_LITTLE};

/// Encode a complete frame into a buffer
pub fn encode_frame(frame: &Frame, little_endian: bool) -> Bytes {
    let mut w = Writer::new(little_endian);
    w.buf.put_u8(if little_endian { ENDIAN_LITTLE } else { ENDIAN_BIG });
    w.put_i64(frame.sent_time);
    w.put_i64(frame.offset);
    w.put_bytes_prefixed(frame.topics.join(",").as_bytes());
    w.put_value(&frame.payload);
    w.buf.freeze()
}

/// Build a data frame: an any-vector of column vectors on the given topics
pub fn data_frame(topics: &[&str], offset: i64, columns: Vec<Vector>) -> Frame {
    let payload = Vector::any(columns.into_iter().map(Value::Vector).collect());
    Frame {
        sent_time: 0,
        offset,
        topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        payload: Value::Vector(payload),
    }
}

/// Build a zero-row schema frame for the given topics
pub fn schema_frame(topics: &[&str], table_name: &str, col_names: &[&str]) -> Frame {
    let columns = col_names
        .iter()
        .map(|_| Vector::new(DataType::Any))
        .collect();
    Frame {
        sent_time: 0,
        offset: crate::NO_OFFSET,
        topics: topics.iter().map(|t| (*t).to_owned()).collect(),
        payload: Value::Table(Table {
            name: table_name.to_owned(),
            col_names: col_names.iter().map(|c| (*c).to_owned()).collect(),
            columns,
        }),
    }
}

struct Writer {
    buf: BytesMut,
    little_endian: bool,
}

impl Writer {
    fn new(little_endian: bool) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            little_endian,
        }
    }

    fn put_u16(&mut self, v: u16) {
        if self.little_endian {
            self.buf.put_u16_le(v);
        } else {
            self.buf.put_u16(v);
        }
    }

    fn put_u32(&mut self, v: u32) {
        if self.little_endian {
            self.buf.put_u32_le(v);
        } else {
            self.buf.put_u32(v);
        }
    }

    fn put_i64(&mut self, v: i64) {
        if self.little_endian {
            self.buf.put_i64_le(v);
        } else {
            self.buf.put_i64(v);
        }
    }

    fn put_bytes_prefixed(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    fn put_value(&mut self, value: &Value) {
        self.put_u16(pack_form_type(value.form(), value.data_type()));
        self.put_body(value);
    }

    fn put_body(&mut self, value: &Value) {
        match value {
            Value::Void => {}
            Value::Bool(v) => self.buf.put_u8(u8::from(*v)),
            Value::Char(v) => self.buf.put_u8(*v as u8),
            Value::Short(v) => self.put_u16(*v as u16),
            Value::Int(v) => self.put_u32(*v as u32),
            Value::Long(v) => self.put_i64(*v),
            Value::Float(v) => self.put_u32(v.to_bits()),
            Value::Double(v) => {
                let bits = v.to_bits();
                if self.little_endian {
                    self.buf.put_u64_le(bits);
                } else {
                    self.buf.put_u64(bits);
                }
            }
            Value::String(s) | Value::Symbol(s) => self.put_bytes_prefixed(s.as_bytes()),
            Value::Blob(b) => self.put_bytes_prefixed(b),
            Value::Timestamp(v) => self.put_i64(*v),
            Value::Vector(v) => self.put_vector(v),
            Value::Table(t) => self.put_table(t),
        }
    }

    fn put_vector(&mut self, vector: &Vector) {
        self.put_u32(vector.len() as u32);
        for value in &vector.values {
            if vector.data_type == DataType::Any {
                self.put_value(value);
            } else {
                self.put_body(value);
            }
        }
    }

    fn put_table(&mut self, table: &Table) {
        self.put_u32(table.rows() as u32);
        self.put_u32(table.cols() as u32);
        self.put_bytes_prefixed(table.name.as_bytes());
        for name in &table.col_names {
            self.put_bytes_prefixed(name.as_bytes());
        }
        for column in &table.columns {
            self.put_u16(pack_form_type(DataForm::Vector, column.data_type));
            self.put_vector(column);
        }
    }
}
