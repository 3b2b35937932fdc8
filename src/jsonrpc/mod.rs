//! MakerBot's non-standard JSON-RPC 2.0 dialect over a raw TCP stream.
//!
//! The dialect frames bare JSON values on the socket with no length prefix
//! and interleaves length-declared binary blocks (camera frames, file
//! uploads) on the same stream. This module provides the two transport
//! pieces:
//!
//! - [`JsonFramer`] — incremental bracket/string scanner that slices whole
//!   JSON values out of the byte stream and can divert a declared-length
//!   raw byte run to a waiting consumer.
//! - [`Client`] — request/response multiplexer plus notification
//!   publish/subscribe over one connection.

mod client;
mod framer;
mod protocol;

pub use client::{BoxFuture, Client, RawReader};
pub use framer::JsonFramer;
pub use protocol::{EmptyParams, RemoteError, PROTOCOL_VERSION};
