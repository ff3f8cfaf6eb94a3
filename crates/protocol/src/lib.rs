//! Rill Protocol - Wire format and typed value model
//!
//! This crate provides the foundational types that flow through the
//! subscription pipeline:
//! - `Value` - Tagged value tree (scalars, vectors, tables)
//! - `DataType` / `DataForm` - Wire discriminators
//! - `Frame` / `FrameDecoder` - Subscription-direction frame parser
//! - `encode` - Frame writer (tests, tooling, in-process publishers)
//!
//! # Wire Format
//!
//! Each subscription frame on the wire:
//! ```text
//! [1 byte: endian flag][8 bytes: sent_time][8 bytes: offset]
//! [4 bytes: topic length][N bytes: comma-separated topic list]
//! [2 bytes: form|type][payload]
//! ```
//!
//! All integers after the flag byte are decoded in the endianness the flag
//! selects. Payload shape is dictated by the form/type discriminator; the
//! two shapes a subscriber must handle are a zero-row table (subscription
//! handshake) and an any-vector of same-length column vectors (row data).
//!
//! # Design Principles
//!
//! - **Bounds-checked**: malformed frames return errors, never panic
//! - **Recoverable short reads**: a truncated frame surfaces as a single
//!   error kind so stream readers can treat it as "connection lost"
//! - **Owned values**: frames decode into an owned value tree that can be
//!   fanned out across topic queues behind `Arc`

mod error;
mod frame;
mod value;

pub mod encode;

pub use error::ProtocolError;
pub use frame::{Frame, FrameDecoder};
pub use value::{DataForm, DataType, Table, Value, Vector};

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Endian flag byte for little-endian payloads
pub const ENDIAN_LITTLE: u8 = 0x01;

/// Endian flag byte for big-endian payloads
pub const ENDIAN_BIG: u8 = 0x00;

/// Offset carried by frames that hold no rows (schema frames)
pub const NO_OFFSET: i64 = -1;

/// Maximum accepted topic-list length in bytes
pub const MAX_TOPIC_LEN: usize = 64 * 1024;

/// Maximum accepted element count for a single vector or table column
pub const MAX_VECTOR_LEN: usize = 16 * 1024 * 1024;
