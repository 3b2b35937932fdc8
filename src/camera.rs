//! Camera frame types and header decoding.
//!
//! A `camera_frame` notification is followed on the wire by a 16-byte
//! big-endian header and then the frame payload. The header's `file_size`
//! field counts the header itself, so the payload is 16 bytes shorter than
//! the wire value.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Size of the on-wire camera frame header.
pub const CAMERA_HEADER_SIZE: usize = 16;

/// Pixel format of a camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFrameFormat {
    /// The printer marked the frame invalid.
    Invalid,
    /// Raw YUYV pixels.
    Yuyv,
    /// JPEG-compressed image.
    Jpeg,
    /// A format code this crate does not know about.
    Unknown(u32),
}

impl From<u32> for CameraFrameFormat {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Yuyv,
            2 => Self::Jpeg,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded camera frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraFrameMetadata {
    /// Payload size in bytes (wire `file_size` minus the 16-byte header).
    pub file_size: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: CameraFrameFormat,
}

impl CameraFrameMetadata {
    /// Decode the 16-byte big-endian header
    /// `file_size:u32 | width:u32 | height:u32 | format:u32`.
    pub fn unpack(packed: &[u8]) -> Result<Self> {
        if packed.len() < CAMERA_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "camera frame header too short: {} bytes",
                packed.len()
            )));
        }

        let word = |i: usize| u32::from_be_bytes([packed[i], packed[i + 1], packed[i + 2], packed[i + 3]]);

        Ok(Self {
            // The wire value includes the header.
            file_size: word(0).saturating_sub(CAMERA_HEADER_SIZE as u32),
            width: word(4),
            height: word(8),
            format: CameraFrameFormat::from(word(12)),
        })
    }
}

/// A single camera snapshot delivered by the printer.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame payload in the format named by the metadata.
    pub data: Bytes,
    /// Decoded header.
    pub metadata: CameraFrameMetadata,
}
