//! # makerbot-rpc
//!
//! Client library for the non-standard JSON-RPC 2.0 dialect that networked
//! MakerBot 3D printers speak over a single long-lived TCP connection.
//!
//! ## Architecture
//!
//! - **Transport** ([`jsonrpc`]): an incremental JSON framer that slices
//!   whole JSON values out of the byte stream (and can divert
//!   length-declared binary runs, used for camera frames), plus a
//!   request/response multiplexer with notification publish/subscribe.
//! - **Session** ([`Client`]): handshake, keepalive supervision,
//!   state-change and camera-frame fan-out, and the printer command
//!   wrappers (filament, cancel/suspend/resume, printing).
//! - **Collaborators**: the [`reflector`] HTTPS client for remote relay
//!   introductions and the printer's HTTP token flow (used by the
//!   `authenticate_*` methods).
//!
//! ## Example
//!
//! ```ignore
//! use makerbot_rpc::Client;
//!
//! #[tokio::main]
//! async fn main() -> makerbot_rpc::Result<()> {
//!     let client = Client::with_ip("192.168.1.100");
//!     client.on_disconnect(|| eprintln!("printer went away"));
//!     client.connect().await?;
//!     client.authenticate_locally().await?; // press the knob
//!
//!     client.handle_state_change(|_old, new| {
//!         if let Some(new) = new {
//!             println!("printer state: {:?}", new.current_process);
//!         }
//!     });
//!
//!     client.print_file("benchy.makerbot").await
//! }
//! ```
//!
//! A disconnected client is terminal: there is no automatic reconnection
//! or re-subscription. The `on_disconnect` handler is the signal to build
//! a new session.

pub mod jsonrpc;
pub mod reflector;

mod auth;
mod camera;
mod client;
mod error;
mod transfer;
mod types;

pub use camera::{CameraFrame, CameraFrameFormat, CameraFrameMetadata, CAMERA_HEADER_SIZE};
pub use client::{Client, Config, DEFAULT_PING_TIMEOUT, DEFAULT_PORT};
pub use error::{Error, Result};
pub use transfer::BLOCK_SIZE;
pub use types::{
    EpochTime, FirmwareVersion, PrintProcessStep, Printer, PrinterMetadata, PrinterProcess,
    Toolhead,
};
