//! Unreliable datagram endpoints with an optional echo exchange.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::network::{EchoKind, Packet, PacketBody};

/// Numbers outgoing datagrams and matches echo replies to their requests.
#[derive(Debug, Clone, Default)]
pub struct DatagramSender {
    echo: bool,
    next_sequence: u64,
    awaiting_reply: BTreeMap<u64, Duration>,
    replies: u64,
    rtt_sum: Duration,
}

impl DatagramSender {
    pub fn new(echo: bool) -> Self {
        Self { echo, ..Self::default() }
    }

    /// Body of the next datagram sent at `now`.
    pub fn next_body(&mut self, now: Duration) -> PacketBody {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let echo = if self.echo {
            self.awaiting_reply.insert(sequence, now);
            EchoKind::Request
        } else {
            EchoKind::None
        };
        PacketBody::Datagram { sequence, echo }
    }

    /// Match a reply; returns the round trip time of the first reply for a sequence.
    pub fn on_reply(&mut self, sequence: u64, now: Duration) -> Option<Duration> {
        let sent_at = self.awaiting_reply.remove(&sequence)?;
        let rtt = now.saturating_sub(sent_at);
        self.replies += 1;
        self.rtt_sum += rtt;
        Some(rtt)
    }

    pub fn sent(&self) -> u64 {
        self.next_sequence
    }

    pub fn replies(&self) -> u64 {
        self.replies
    }

    pub fn mean_rtt(&self) -> Option<Duration> {
        (self.replies > 0).then(|| self.rtt_sum / self.replies as u32)
    }
}

/// Reply to an echo request: same size and sequence, flow reversed.
pub fn echo_reply(request: &Packet, uid: u64, now: Duration) -> Option<Packet> {
    match request.body {
        PacketBody::Datagram {
            sequence,
            echo: EchoKind::Request,
        } => Some(Packet {
            uid,
            flow: request.flow.reversed(),
            payload_size: request.payload_size,
            sent_at: now,
            body: PacketBody::Datagram {
                sequence,
                echo: EchoKind::Reply,
            },
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_stats::FiveTuple;
    use crate::network::Protocol;
    use std::net::Ipv4Addr;

    fn flow() -> FiveTuple {
        FiveTuple {
            source: Ipv4Addr::new(192, 168, 0, 2),
            destination: Ipv4Addr::new(10, 1, 1, 2),
            protocol: Protocol::Datagram,
            source_port: 49153,
            destination_port: 9,
        }
    }

    #[test]
    fn plain_datagrams_expect_no_reply() {
        let mut sender = DatagramSender::new(false);
        assert_eq!(sender.next_body(Duration::ZERO), PacketBody::Datagram { sequence: 0, echo: EchoKind::None });
        assert_eq!(sender.next_body(Duration::ZERO), PacketBody::Datagram { sequence: 1, echo: EchoKind::None });
        assert_eq!(sender.on_reply(0, Duration::from_secs(1)), None);
        assert_eq!(sender.sent(), 2);
    }

    #[test]
    fn echo_round_trip() {
        let mut sender = DatagramSender::new(true);
        let request = Packet {
            uid: 1,
            flow: flow(),
            payload_size: 512,
            sent_at: Duration::from_millis(10),
            body: sender.next_body(Duration::from_millis(10)),
        };
        let reply = echo_reply(&request, 2, Duration::from_millis(14)).unwrap();
        assert_eq!(reply.flow, flow().reversed());
        assert_eq!(reply.payload_size, 512);
        assert_eq!(reply.body, PacketBody::Datagram { sequence: 0, echo: EchoKind::Reply });
        assert!(echo_reply(&reply, 3, Duration::from_millis(14)).is_none());

        assert_eq!(sender.on_reply(0, Duration::from_millis(18)), Some(Duration::from_millis(8)));
        // A duplicated reply is not counted twice.
        assert_eq!(sender.on_reply(0, Duration::from_millis(19)), None);
        assert_eq!(sender.replies(), 1);
        assert_eq!(sender.mean_rtt(), Some(Duration::from_millis(8)));
    }
}
