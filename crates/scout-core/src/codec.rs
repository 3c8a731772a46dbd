//! Discovery packet codec.
//!
//! Broadcast discovery speaks a tiny handshake over UDP:
//! - **HELLO** (`0x01`): "is there a cluster out there?" Sent to the subnet
//!   broadcast address with an empty payload.
//! - **HELLO_REPLY** (`0x02`): sent back by the current leader, unicast. The
//!   payload is the leader's IP address as text.
//!
//! On the wire a packet is the bincode (fixed-int, little-endian) encoding of
//! `{header: u8, payload: Vec<u8>}`: one header byte, an 8-byte payload length,
//! then the payload bytes.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Upper bound for an encoded packet. Anything larger is not a discovery packet.
pub const MAX_PACKET_SIZE: u64 = 2000;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown packet header: {0:#04x}")]
    UnknownHeader(u8),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Invalid reply payload: {0}")]
    InvalidPayload(String),
}

/// Packet kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketHeader {
    Hello = 0x01,
    HelloReply = 0x02,
}

impl PacketHeader {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketHeader {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloReply),
            other => Err(CodecError::UnknownHeader(other)),
        }
    }
}

/// Wire shape. Kept separate so the public type can hold a checked header.
#[derive(Serialize, Deserialize)]
struct WirePacket {
    header: u8,
    payload: Vec<u8>,
}

/// A decoded discovery packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// A HELLO probe (empty payload).
    pub fn hello() -> Self {
        Self::new(PacketHeader::Hello, Vec::new())
    }

    /// A HELLO_REPLY announcing the leader at `leader`.
    pub fn hello_reply(leader: IpAddr) -> Self {
        Self::new(PacketHeader::HelloReply, leader.to_string().into_bytes())
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WirePacket {
            header: self.header.as_byte(),
            payload: self.payload.clone(),
        };
        options()
            .serialize(&wire)
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Parse wire bytes.
    ///
    /// Rejects unknown headers, oversized packets, truncated input and
    /// trailing garbage.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() as u64 > MAX_PACKET_SIZE {
            return Err(CodecError::Malformed(format!(
                "{} bytes exceeds limit of {}",
                bytes.len(),
                MAX_PACKET_SIZE
            )));
        }
        let wire: WirePacket = options()
            .deserialize(bytes)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let header = PacketHeader::try_from(wire.header)?;
        Ok(Self {
            header,
            payload: wire.payload,
        })
    }

    /// Interpret a HELLO_REPLY payload as the leader's address.
    pub fn reply_address(&self) -> Result<IpAddr, CodecError> {
        if self.header != PacketHeader::HelloReply {
            return Err(CodecError::InvalidPayload(format!(
                "expected HELLO_REPLY, got {:?}",
                self.header
            )));
        }
        let text = std::str::from_utf8(&self.payload)
            .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| CodecError::InvalidPayload(format!("not an IP address: {:?}", text)))
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_PACKET_SIZE)
        .reject_trailing_bytes()
}
