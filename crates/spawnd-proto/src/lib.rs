//! spawnd-proto: wire protocol for the spawn server control socket
//!
//! One datagram carries one command: a leading tag byte followed by a
//! command-specific concatenation of typed fields. Integers are
//! little-endian, strings are NUL-terminated UTF-8, and file descriptors
//! travel out-of-band as SCM_RIGHTS ancillary data.

pub mod command;
pub mod fdlist;
pub mod payload;
pub mod serializer;
pub mod socket;

pub use command::{ExecCommand, RequestCommand, ResponseCommand};
pub use fdlist::ReceivedFdList;
pub use payload::Payload;
pub use serializer::Serializer;
pub use socket::{recv_with_fds, send_with_fds};

use thiserror::Error;

/// Maximum payload bytes in a single datagram.
pub const MAX_PAYLOAD: usize = 65536;

/// Maximum file descriptors attached to a request datagram.
pub const MAX_REQUEST_FDS: usize = 32;

/// Maximum file descriptors attached to a response datagram.
pub const MAX_RESPONSE_FDS: usize = 8;

/// A datagram that cannot be decoded.
///
/// The datagram is dropped and the connection stays open; the peer is
/// assumed buggy, not hostile.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed spawn payload")]
pub struct MalformedPayload;

/// A frame that would exceed the datagram payload or fd limits.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("spawn payload too large")]
pub struct PayloadTooLarge;
