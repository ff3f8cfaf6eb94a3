//! Frame decoding
//!
//! Reads subscription-direction frames off a byte stream. The decoder is
//! single-threaded per stream and blocking: it issues `read_exact` calls
//! against the underlying reader and converts every I/O failure into the
//! recoverable [`ProtocolError::ShortRead`] kind, because a truncated frame
//! and a dropped socket are the same event to the subscriber.
//!
//! # Validation
//!
//! 1. Endian flag must be one of the two defined values
//! 2. Topic list must be non-empty UTF-8 within `MAX_TOPIC_LEN`
//! 3. Form/type discriminator must name a known form and type
//! 4. Vector and table lengths are capped at `MAX_VECTOR_LEN`

use std::io::Read;

use crate::value::{unpack_form_type, DataForm, DataType, Table, Value, Vector};
use crate::{ProtocolError, Result, ENDIAN_BIG, ENDIAN_LITTLE, MAX_TOPIC_LEN, MAX_VECTOR_LEN};

/// One decoded subscription frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Publisher wall clock at send time; opaque to the subscriber
    pub sent_time: i64,
    /// Offset of the last row in this frame; `NO_OFFSET` on schema frames
    pub offset: i64,
    /// Topics this frame fans out to
    pub topics: Vec<String>,
    /// Decoded payload tree
    pub payload: Value,
}

/// Streaming frame decoder
///
/// Wraps a blocking reader and yields one [`Frame`] per call. Endianness is
/// re-read from the flag byte on every frame, so a stream may switch.
pub struct FrameDecoder<R> {
    reader: R,
    little_endian: bool,
}

impl<R: Read> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            little_endian: true,
        }
    }

    /// Consume the decoder and return the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next frame off the stream.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ShortRead`] when the stream ends or errors mid-frame
    /// (recoverable); any other variant is a protocol violation.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let flag = self.read_u8()?;
        self.little_endian = match flag {
            ENDIAN_LITTLE => true,
            ENDIAN_BIG => false,
            other => return Err(ProtocolError::InvalidForm(other)),
        };

        let sent_time = self.read_i64()?;
        let offset = self.read_i64()?;

        let topic_raw = self.read_prefixed_bytes(MAX_TOPIC_LEN, "topic list")?;
        let topic_str =
            String::from_utf8(topic_raw).map_err(|_| ProtocolError::InvalidUtf8("topic list"))?;
        let topics: Vec<String> = topic_str
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        if topics.is_empty() {
            return Err(ProtocolError::EmptyTopicList);
        }

        let payload = self.read_value()?;

        Ok(Frame {
            sent_time,
            offset,
            topics,
            payload,
        })
    }

    // =========================================================================
    // Value tree
    // =========================================================================

    fn read_value(&mut self) -> Result<Value> {
        let raw = self.read_u16()?;
        let (form, data_type) = unpack_form_type(raw)?;
        self.read_body(form, data_type)
    }

    fn read_body(&mut self, form: DataForm, data_type: DataType) -> Result<Value> {
        match form {
            DataForm::Scalar => self.read_scalar(data_type),
            DataForm::Vector => Ok(Value::Vector(self.read_vector(data_type)?)),
            DataForm::Table => Ok(Value::Table(self.read_table()?)),
        }
    }

    fn read_scalar(&mut self, data_type: DataType) -> Result<Value> {
        Ok(match data_type {
            DataType::Void => Value::Void,
            DataType::Bool => Value::Bool(self.read_u8()? != 0),
            DataType::Char => Value::Char(self.read_u8()? as i8),
            DataType::Short => Value::Short(self.read_i16()?),
            DataType::Int => Value::Int(self.read_i32()?),
            DataType::Long => Value::Long(self.read_i64()?),
            DataType::Float => Value::Float(f32::from_bits(self.read_u32()?)),
            DataType::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            DataType::String => Value::String(self.read_string("string scalar")?),
            DataType::Symbol => Value::Symbol(self.read_string("symbol scalar")?),
            DataType::Blob => {
                Value::Blob(self.read_prefixed_bytes(MAX_VECTOR_LEN, "blob scalar")?)
            }
            DataType::Timestamp => Value::Timestamp(self.read_i64()?),
            DataType::Any => return Err(ProtocolError::InvalidType(DataType::Any as u8)),
        })
    }

    fn read_vector(&mut self, data_type: DataType) -> Result<Vector> {
        let len = self.read_len(MAX_VECTOR_LEN, "vector")?;
        let mut values = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            let value = if data_type == DataType::Any {
                self.read_value()?
            } else {
                self.read_scalar(data_type)?
            };
            values.push(value);
        }
        Ok(Vector { data_type, values })
    }

    fn read_table(&mut self) -> Result<Table> {
        let rows = self.read_len(MAX_VECTOR_LEN, "table rows")?;
        let cols = self.read_len(MAX_VECTOR_LEN, "table cols")?;
        let name = self.read_string("table name")?;

        let mut col_names = Vec::with_capacity(cols.min(4096));
        for _ in 0..cols {
            col_names.push(self.read_string("column name")?);
        }

        let mut columns = Vec::with_capacity(cols.min(4096));
        for i in 0..cols {
            let raw = self.read_u16()?;
            let (form, data_type) = unpack_form_type(raw)?;
            if form != DataForm::Vector {
                return Err(ProtocolError::UnexpectedForm {
                    form,
                    context: "table column",
                });
            }
            let column = self.read_vector(data_type)?;
            if column.len() != rows {
                return Err(ProtocolError::ColumnLengthMismatch {
                    column: i,
                    expected: rows,
                    actual: column.len(),
                });
            }
            columns.push(column);
        }

        Ok(Table {
            name,
            col_names,
            columns,
        })
    }

    // =========================================================================
    // Primitive readers
    // =========================================================================

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader
            .read_exact(buf)
            .map_err(|_| ProtocolError::short_read(buf.len()))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(if self.little_endian {
            u16::from_le_bytes(buf)
        } else {
            u16::from_be_bytes(buf)
        })
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(if self.little_endian {
            u32::from_le_bytes(buf)
        } else {
            u32::from_be_bytes(buf)
        })
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(if self.little_endian {
            u64::from_le_bytes(buf)
        } else {
            u64::from_be_bytes(buf)
        })
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    fn read_len(&mut self, max: usize, _context: &'static str) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > max {
            return Err(ProtocolError::length_overflow(len, max));
        }
        Ok(len)
    }

    fn read_prefixed_bytes(&mut self, max: usize, context: &'static str) -> Result<Vec<u8>> {
        let len = self.read_len(max, context)?;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_string(&mut self, context: &'static str) -> Result<String> {
        let raw = self.read_prefixed_bytes(MAX_VECTOR_LEN, context)?;
        String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8(context))
    }
}
