//! Packet transport for one camera connection.
//!
//! A `PacketTransport` owns the TCP connection to a single camera server and
//! the receive buffer sized to the channel's maximum legal payload. The call
//! order is connect, then `receive_metadata` exactly once, then
//! `allocate_buffers`, then any number of `receive_packet` calls; the first
//! `receive_packet` performs the handshake implicitly if the caller skipped
//! it.
//!
//! Connect failures are the expected startup condition (the server may not be
//! up yet) and are the caller's job to retry. A failed metadata handshake or
//! a mid-packet stream break is fatal for the session; there is no automatic
//! reconnect.

use std::net::TcpStream;

use anyhow::{anyhow, Context, Result};

use crate::{wire, ChannelProperties, NetworkPacket};

pub struct PacketTransport {
    name: String,
    stream: Option<TcpStream>,
    properties: Option<ChannelProperties>,
    buffer: Vec<u8>,
}

impl PacketTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream: None,
            properties: None,
            buffer: Vec::new(),
        }
    }

    /// Blocking connect. On failure the caller retries; a server that is not
    /// up yet is normal during rig startup.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let stream =
            TcpStream::connect(&addr).with_context(|| format!("connect to {}", addr))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Receives the 1-byte metadata handshake. Must run before any packet is
    /// read; a short read here is fatal because metadata is mandatory for the
    /// session.
    pub fn receive_metadata(&mut self) -> Result<ChannelProperties> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("{}: not connected", self.name))?;
        let kind = wire::read_metadata(stream)
            .with_context(|| format!("{}: metadata handshake", self.name))?;
        let properties = ChannelProperties::for_kind(kind);
        self.properties = Some(properties);
        Ok(properties)
    }

    /// Sizes the receive buffer to the channel's maximum legal payload.
    /// Idempotent; safe to call again should the properties ever change.
    pub fn allocate_buffers(&mut self) -> Result<()> {
        let properties = self
            .properties
            .ok_or_else(|| anyhow!("{}: metadata not received yet", self.name))?;
        self.buffer.resize(properties.max_payload_size(), 0);
        Ok(())
    }

    /// Channel properties from the handshake, if it has happened.
    pub fn properties(&self) -> Option<ChannelProperties> {
        self.properties
    }

    /// Receives one packet. Returns `Ok(None)` when the remote closed the
    /// stream (graceful end of stream); a packet with an empty payload is the
    /// same signal on the wire and maps to the sentinel as well. Errors are
    /// protocol violations and end the session.
    pub fn receive_packet(&mut self) -> Result<Option<NetworkPacket>> {
        if self.properties.is_none() {
            self.receive_metadata()?;
            self.allocate_buffers()?;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("{}: not connected", self.name))?;
        let packet = wire::read_packet(stream, &mut self.buffer)
            .with_context(|| format!("{}: receive packet", self.name))?;
        match packet {
            Some(packet) if packet.payload.is_empty() => Ok(None),
            other => Ok(other),
        }
    }

    /// Drops the connection. Safe to call multiple times.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("{}: connection closed", self.name);
        }
    }
}
