//! Binary wire protocol codec.
//!
//! A camera connection carries a single metadata byte followed by a stream of
//! packets:
//!
//! ```text
//! seconds(4B) | milliseconds(4B) | length(3B, b0 | b1<<8 | b2<<16) | payload
//! ```
//!
//! Portability caveat: the timestamp fields are fixed-width unsigned integers
//! transmitted in the sender's native byte order. The deployed servers are
//! little-endian, and the decoder reads the fields as such; the server does
//! not announce its integer width or byte order when the connection is
//! established, so a big-endian sender would be misread. Preserved as-is for
//! wire compatibility.
//!
//! A short read on either timestamp field is how the remote signals a clean
//! shutdown (it closes the socket between packets) and yields the
//! end-of-stream sentinel `Ok(None)`. A short read anywhere after a complete
//! timestamp means the stream is desynchronized or the peer died mid-frame,
//! which is a protocol error.

use std::io::Read;
use std::io::Write;

use anyhow::{anyhow, Context, Result};

use crate::{ChannelKind, NetworkPacket, Timestamp};

pub const TIMESTAMP_FIELD_BYTES: usize = 4;
pub const LENGTH_HEADER_BYTES: usize = 3;
pub const METADATA_BYTES: usize = 1;

/// Reads until `buf` is full or the peer closes the stream. Returns the
/// number of bytes actually read; anything short of `buf.len()` means the
/// stream ended.
fn read_until_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader
            .read(&mut buf[total..])
            .context("read from camera stream")?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Reads the 1-byte metadata handshake. A short read here is fatal: metadata
/// is mandatory for the session.
pub fn read_metadata(reader: &mut impl Read) -> Result<ChannelKind> {
    let mut byte = [0u8; METADATA_BYTES];
    let n = read_until_full(reader, &mut byte)?;
    if n < METADATA_BYTES {
        return Err(anyhow!("stream ended before the metadata handshake"));
    }
    ChannelKind::from_wire(byte[0])
}

/// Reads exactly one packet into `buffer`, which must be sized to the maximum
/// legal payload for the channel.
///
/// Returns `Ok(None)` when the remote closed the stream between packets, an
/// error when the stream breaks mid-packet or the declared payload size
/// exceeds `buffer`.
pub fn read_packet(reader: &mut impl Read, buffer: &mut [u8]) -> Result<Option<NetworkPacket>> {
    let mut field = [0u8; TIMESTAMP_FIELD_BYTES];

    // A short read on either timestamp field is the clean end-of-stream
    // signal, not an error.
    let n = read_until_full(reader, &mut field)?;
    if n < TIMESTAMP_FIELD_BYTES {
        return Ok(None);
    }
    let seconds = u32::from_le_bytes(field);

    let n = read_until_full(reader, &mut field)?;
    if n < TIMESTAMP_FIELD_BYTES {
        return Ok(None);
    }
    let milliseconds = u32::from_le_bytes(field);

    // From here on the timestamp is committed; a short read means the peer
    // crashed mid-frame.
    let mut header = [0u8; LENGTH_HEADER_BYTES];
    let n = read_until_full(reader, &mut header)?;
    if n < LENGTH_HEADER_BYTES {
        return Err(anyhow!(
            "stream ended inside a packet header ({} of {} bytes)",
            n,
            LENGTH_HEADER_BYTES
        ));
    }

    let size =
        header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    if size > buffer.len() {
        return Err(anyhow!(
            "declared payload size {} exceeds the {}-byte receive buffer",
            size,
            buffer.len()
        ));
    }

    let n = read_until_full(reader, &mut buffer[..size])?;
    if n < size {
        return Err(anyhow!(
            "stream ended inside a packet payload ({} of {} bytes)",
            n,
            size
        ));
    }

    Ok(Some(NetworkPacket {
        timestamp: Timestamp {
            seconds,
            milliseconds,
        },
        payload: buffer[..size].to_vec(),
    }))
}

/// Writes the 1-byte metadata handshake.
pub fn write_metadata(writer: &mut impl Write, kind: ChannelKind) -> Result<()> {
    writer
        .write_all(&[kind.to_wire()])
        .context("write metadata handshake")
}

/// Writes one packet in wire format. The payload may be any length that fits
/// the 3-byte header.
pub fn write_packet(
    writer: &mut impl Write,
    timestamp: Timestamp,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > 0xFF_FF_FF {
        return Err(anyhow!(
            "payload of {} bytes does not fit a 3-byte length header",
            payload.len()
        ));
    }
    writer.write_all(&timestamp.seconds.to_le_bytes())?;
    writer.write_all(&timestamp.milliseconds.to_le_bytes())?;
    let size = payload.len();
    let header = [size as u8, (size >> 8) as u8, (size >> 16) as u8];
    writer.write_all(&header)?;
    writer.write_all(payload).context("write packet payload")
}
