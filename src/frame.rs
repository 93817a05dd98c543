//! Decoded frames and payload reshaping.
//!
//! The assembler's contract is only the reshape: payload bytes become a
//! width x height buffer of fixed-width samples, and anything that does not
//! fill the buffer exactly is rejected. If the wire payload is compressed,
//! expanding it is the job of an injected [`FrameDecoder`]; this module has
//! no compression semantics.

use anyhow::{anyhow, Result};

use crate::{ChannelKind, ChannelProperties};

/// A decoded pixel buffer. Produced fresh per packet; ownership moves to
/// whichever sink consumes it and the buffer is never reused across
/// iterations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub kind: ChannelKind,
}

impl Frame {
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Reshapes a full-size payload into a frame. Fails unless the payload length
/// is exactly width x height x bytes_per_pixel.
pub fn assemble(payload: Vec<u8>, properties: &ChannelProperties) -> Result<Frame> {
    let expected = properties.max_payload_size();
    if payload.len() != expected {
        return Err(anyhow!(
            "payload of {} bytes does not fill a {}x{}x{} frame ({} bytes)",
            payload.len(),
            properties.width,
            properties.height,
            properties.bytes_per_pixel,
            expected
        ));
    }
    Ok(Frame {
        data: payload,
        width: properties.width,
        height: properties.height,
        bytes_per_pixel: properties.bytes_per_pixel,
        kind: properties.kind,
    })
}

/// Expands a wire payload into a full-size pixel buffer. Injected into the
/// worker so compressed transports can plug in their codec without the
/// capture loop knowing about it.
pub trait FrameDecoder: Send {
    fn decode(&mut self, payload: Vec<u8>, properties: &ChannelProperties) -> Result<Vec<u8>>;
}

/// Decoder for uncompressed streams: hands the payload through untouched.
pub struct PassthroughDecoder;

impl FrameDecoder for PassthroughDecoder {
    fn decode(&mut self, payload: Vec<u8>, _properties: &ChannelProperties) -> Result<Vec<u8>> {
        Ok(payload)
    }
}
