//! Packets carried between nodes.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::flow_stats::FiveTuple;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;
pub const TCP_HEADER_SIZE: usize = 20;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Reliable, ordered byte stream (TCP-like).
    Stream,
    /// Unreliable datagrams (UDP-like).
    Datagram,
}

impl Protocol {
    /// IANA protocol number, as reported in flow statistics.
    pub fn ip_number(&self) -> u8 {
        match self {
            Protocol::Stream => 6,
            Protocol::Datagram => 17,
        }
    }

    pub fn header_size(&self) -> usize {
        match self {
            Protocol::Stream => TCP_HEADER_SIZE,
            Protocol::Datagram => UDP_HEADER_SIZE,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Stream => write!(f, "TCP"),
            Protocol::Datagram => write!(f, "UDP"),
        }
    }
}

/// Whether a datagram expects an echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    None,
    Request,
    Reply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Datagram { sequence: u64, echo: EchoKind },
    /// Stream data covering bytes `[offset, offset + length)`.
    Segment { offset: u64, length: u32 },
    /// Cumulative acknowledgment: every byte before `next_expected` arrived.
    Ack { next_expected: u64 },
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub uid: u64,
    pub flow: FiveTuple,
    /// Application bytes carried (zero for pure acks).
    pub payload_size: usize,
    /// Time the packet left the originating IP layer.
    pub sent_at: Duration,
    pub body: PacketBody,
}

impl Packet {
    /// Size at the IP layer: payload plus IPv4 and transport headers.
    pub fn wire_size(&self) -> usize {
        self.payload_size + IPV4_HEADER_SIZE + self.flow.protocol.header_size()
    }
}
