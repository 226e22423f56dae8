//! Reliable, ordered byte stream.
//!
//! The sender is window based: slow start then additive increase, fast
//! retransmit after three duplicate acks and go-back-N after a retransmission
//! timeout. Byte offsets are absolute and start at zero; the receiver acks
//! the next byte it expects.

use std::collections::BTreeMap;
use std::time::Duration;

/// Advertised receive window of every stream receiver.
pub const RECEIVE_WINDOW: u64 = 128 * 1024;
/// Initial congestion window, in segments.
pub const INITIAL_WINDOW_SEGMENTS: u64 = 10;
pub const DUPLICATE_ACK_THRESHOLD: u32 = 3;
/// The stream gives up after this many retransmission timeouts in a row.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 6;

pub const INITIAL_RTO: Duration = Duration::from_secs(1);
pub const MIN_RTO: Duration = Duration::from_millis(200);
pub const MAX_RTO: Duration = Duration::from_secs(60);
const CLOCK_GRANULARITY: Duration = Duration::from_millis(1);

/// Retransmission timeout estimator (RFC 6298).
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: Duration,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: 0.0,
            rto: INITIAL_RTO,
        }
    }
}

impl RtoEstimator {
    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt.map(Duration::from_secs_f64)
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        let r = rtt.as_secs_f64();
        let srtt = match self.srtt {
            None => {
                self.rttvar = r / 2.0;
                r
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - r).abs();
                0.875 * srtt + 0.125 * r
            }
        };
        self.srtt = Some(srtt);
        let variance = (4.0 * self.rttvar).max(CLOCK_GRANULARITY.as_secs_f64());
        self.rto = Duration::from_secs_f64(srtt + variance).clamp(MIN_RTO, MAX_RTO);
    }

    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}

/// Result of a retransmission timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Nothing was outstanding.
    Idle,
    /// The window collapsed; resend from the oldest unacked byte.
    Retransmit,
    /// Too many timeouts in a row; the stream stops sending for good.
    Stalled,
}

/// What an incoming ack did to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    pub newly_acked: u64,
    /// Segment to resend right away (fast retransmit).
    pub retransmit: Option<(u64, u32)>,
}

#[derive(Debug, Clone)]
pub struct StreamSender {
    mss: u64,
    write_end: u64,
    unlimited: bool,
    closed: bool,
    snd_una: u64,
    snd_nxt: u64,
    high_tx: u64,
    cwnd: u64,
    ssthresh: u64,
    dup_acks: u32,
    recover: Option<u64>,
    rto: RtoEstimator,
    timed: Option<(u64, Duration)>,
    consecutive_timeouts: u32,
    stalled: bool,
    retransmissions: u64,
    timeouts: u64,
}

impl StreamSender {
    pub fn new(mss: usize) -> Self {
        let mss = mss.max(1) as u64;
        Self {
            mss,
            write_end: 0,
            unlimited: false,
            closed: false,
            snd_una: 0,
            snd_nxt: 0,
            high_tx: 0,
            cwnd: INITIAL_WINDOW_SEGMENTS * mss,
            ssthresh: u64::MAX,
            dup_acks: 0,
            recover: None,
            rto: RtoEstimator::default(),
            timed: None,
            consecutive_timeouts: 0,
            stalled: false,
            retransmissions: 0,
            timeouts: 0,
        }
    }

    /// Queue `bytes` more application bytes. Ignored once closed.
    pub fn write(&mut self, bytes: usize) {
        if !self.closed {
            self.write_end += bytes as u64;
        }
    }

    /// Treat the send buffer as always full.
    pub fn set_unlimited(&mut self, unlimited: bool) {
        if !self.closed {
            self.unlimited = unlimited;
        }
    }

    /// Stop accepting data and drop the backlog that was never sent. Bytes
    /// already sent stay outstanding until acked.
    pub fn close(&mut self) {
        self.closed = true;
        self.unlimited = false;
        self.write_end = self.high_tx;
    }

    fn window(&self) -> u64 {
        self.cwnd.min(RECEIVE_WINDOW).max(self.mss)
    }

    fn available_end(&self) -> u64 {
        if self.unlimited { u64::MAX } else { self.write_end }
    }

    fn segment_at(&self, offset: u64) -> u32 {
        let end = self.available_end().max(self.high_tx);
        (end.saturating_sub(offset)).min(self.mss) as u32
    }

    /// Segments the window allows right now, as `(offset, length)`.
    pub fn next_segments(&mut self, now: Duration) -> Vec<(u64, u32)> {
        let mut segments = Vec::new();
        if self.stalled {
            return segments;
        }
        loop {
            let length = self.segment_at(self.snd_nxt);
            if length == 0 {
                break;
            }
            let in_flight = self.snd_nxt - self.snd_una;
            if in_flight + u64::from(length) > self.window() {
                break;
            }
            let offset = self.snd_nxt;
            let end = offset + u64::from(length);
            if offset >= self.high_tx {
                if self.timed.is_none() {
                    self.timed = Some((end, now));
                }
            } else {
                self.retransmissions += 1;
            }
            self.snd_nxt = end;
            self.high_tx = self.high_tx.max(end);
            segments.push((offset, length));
        }
        segments
    }

    pub fn on_ack(&mut self, next_expected: u64, now: Duration) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        if self.stalled || next_expected > self.high_tx {
            return outcome;
        }
        if next_expected > self.snd_una {
            let acked = next_expected - self.snd_una;
            outcome.newly_acked = acked;
            self.snd_una = next_expected;
            self.snd_nxt = self.snd_nxt.max(self.snd_una);
            self.dup_acks = 0;
            self.consecutive_timeouts = 0;
            if let Some((end, sent_at)) = self.timed {
                if next_expected >= end {
                    self.rto.on_sample(now.saturating_sub(sent_at));
                    self.timed = None;
                }
            }
            match self.recover {
                Some(recover) if next_expected < recover => {
                    // Partial ack: the next hole is lost too.
                    self.cwnd = self.cwnd.saturating_sub(acked).max(self.mss);
                    outcome.retransmit = self.retransmit_head();
                }
                Some(_) => {
                    self.recover = None;
                    self.cwnd = self.ssthresh;
                }
                None if self.cwnd < self.ssthresh => self.cwnd += acked.min(self.mss),
                None => self.cwnd += (self.mss * self.mss / self.cwnd).max(1),
            }
            self.cwnd = self.cwnd.min(RECEIVE_WINDOW);
        } else if next_expected == self.snd_una && self.has_outstanding() {
            self.dup_acks += 1;
            if self.dup_acks == DUPLICATE_ACK_THRESHOLD && self.recover.is_none() {
                self.ssthresh = self.half_flight();
                self.cwnd = self.ssthresh + u64::from(DUPLICATE_ACK_THRESHOLD) * self.mss;
                self.recover = Some(self.high_tx);
                outcome.retransmit = self.retransmit_head();
            } else if self.dup_acks > DUPLICATE_ACK_THRESHOLD {
                self.cwnd = (self.cwnd + self.mss).min(RECEIVE_WINDOW);
            }
        }
        outcome
    }

    fn half_flight(&self) -> u64 {
        ((self.snd_nxt - self.snd_una) / 2).max(2 * self.mss)
    }

    fn retransmit_head(&mut self) -> Option<(u64, u32)> {
        let length = self.segment_at(self.snd_una);
        if length == 0 {
            return None;
        }
        self.retransmissions += 1;
        self.timed = None;
        Some((self.snd_una, length))
    }

    pub fn on_timeout(&mut self) -> TimeoutOutcome {
        if self.stalled {
            return TimeoutOutcome::Stalled;
        }
        if !self.has_outstanding() {
            return TimeoutOutcome::Idle;
        }
        self.timeouts += 1;
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
            self.stalled = true;
            return TimeoutOutcome::Stalled;
        }
        self.ssthresh = self.half_flight();
        self.cwnd = self.mss;
        self.snd_nxt = self.snd_una;
        self.dup_acks = 0;
        self.recover = None;
        self.timed = None;
        self.rto.back_off();
        TimeoutOutcome::Retransmit
    }

    pub fn has_outstanding(&self) -> bool {
        self.high_tx > self.snd_una
    }

    /// Closed and every byte acked.
    pub fn is_finished(&self) -> bool {
        self.closed && self.snd_una >= self.write_end && !self.has_outstanding()
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.rto.smoothed_rtt()
    }

    pub fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    pub fn bytes_acked(&self) -> u64 {
        self.snd_una
    }

    pub fn bytes_sent(&self) -> u64 {
        self.high_tx
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }
}

/// Reassembles segments and produces cumulative acks.
#[derive(Debug, Clone, Default)]
pub struct StreamReceiver {
    next_expected: u64,
    out_of_order: BTreeMap<u64, u64>,
}

/// Ack to send back plus the byte ranges now deliverable in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub ack: u64,
    pub delivered: Vec<(u64, u64)>,
}

impl StreamReceiver {
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn on_segment(&mut self, offset: u64, length: u32) -> SegmentOutcome {
        let end = offset + u64::from(length);
        let mut delivered = Vec::new();
        if offset > self.next_expected {
            let slot = self.out_of_order.entry(offset).or_insert(end);
            *slot = (*slot).max(end);
        } else if end > self.next_expected {
            delivered.push((self.next_expected, end - self.next_expected));
            self.next_expected = end;
            while let Some((&start, &stop)) = self.out_of_order.first_key_value() {
                if start > self.next_expected {
                    break;
                }
                self.out_of_order.pop_first();
                if stop > self.next_expected {
                    delivered.push((self.next_expected, stop - self.next_expected));
                    self.next_expected = stop;
                }
            }
        }
        SegmentOutcome {
            ack: self.next_expected,
            delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn receiver_reorders_segments() {
        let mut receiver = StreamReceiver::default();
        let late = receiver.on_segment(1000, 1000);
        assert_eq!(late.ack, 0);
        assert!(late.delivered.is_empty());
        assert_eq!(receiver.buffered(), 1);

        let head = receiver.on_segment(0, 1000);
        assert_eq!(head.ack, 2000);
        assert_eq!(head.delivered, vec![(0, 1000), (1000, 1000)]);

        // Duplicate of delivered data: ack only.
        let dup = receiver.on_segment(0, 1000);
        assert_eq!(dup.ack, 2000);
        assert!(dup.delivered.is_empty());
    }

    #[test]
    fn initial_window_is_ten_segments() {
        let mut sender = StreamSender::new(1000);
        sender.set_unlimited(true);
        let segments = sender.next_segments(Duration::ZERO);
        assert_eq!(segments.len(), 10);
        assert_eq!(segments[3], (3000, 1000));
        assert!(sender.next_segments(Duration::ZERO).is_empty());
    }

    #[test]
    fn slow_start_grows_one_segment_per_ack() {
        let mut sender = StreamSender::new(1000);
        sender.set_unlimited(true);
        sender.next_segments(Duration::ZERO);
        let outcome = sender.on_ack(1000, 10 * MS);
        assert_eq!(outcome.newly_acked, 1000);
        assert_eq!(sender.congestion_window(), 11_000);
        // One acked, window one larger: two more segments.
        assert_eq!(sender.next_segments(10 * MS).len(), 2);
    }

    #[test]
    fn written_bytes_limit_the_stream() {
        let mut sender = StreamSender::new(1000);
        sender.write(2500);
        assert_eq!(sender.next_segments(Duration::ZERO), vec![(0, 1000), (1000, 1000), (2000, 500)]);
        sender.on_ack(2500, MS);
        sender.close();
        assert!(sender.is_finished());
    }

    #[test]
    fn close_drops_unsent_backlog() {
        let mut sender = StreamSender::new(1000);
        sender.write(50_000);
        sender.next_segments(Duration::ZERO);
        sender.close();
        sender.write(1000);
        assert_eq!(sender.bytes_sent(), 10_000);
        assert!(sender.next_segments(Duration::ZERO).is_empty());
        sender.on_ack(10_000, MS);
        assert!(sender.is_finished());
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let mut sender = StreamSender::new(1000);
        sender.set_unlimited(true);
        sender.next_segments(Duration::ZERO);
        sender.on_ack(1000, MS);
        assert_eq!(sender.on_ack(1000, MS).retransmit, None);
        assert_eq!(sender.on_ack(1000, MS).retransmit, None);
        assert_eq!(sender.on_ack(1000, MS).retransmit, Some((1000, 1000)));
        assert_eq!(sender.retransmissions(), 1);
    }

    #[test]
    fn timeout_goes_back_to_the_oldest_unacked_byte() {
        let mut sender = StreamSender::new(1000);
        sender.set_unlimited(true);
        sender.next_segments(Duration::ZERO);
        sender.on_ack(3000, MS);
        assert_eq!(sender.on_timeout(), TimeoutOutcome::Retransmit);
        assert_eq!(sender.congestion_window(), 1000);
        assert_eq!(sender.rto(), MIN_RTO * 2);
        assert_eq!(sender.next_segments(2 * MS), vec![(3000, 1000)]);
    }

    #[test]
    fn repeated_timeouts_stall_the_stream() {
        let mut sender = StreamSender::new(1000);
        sender.write(1000);
        sender.next_segments(Duration::ZERO);
        for _ in 1..MAX_CONSECUTIVE_TIMEOUTS {
            assert_eq!(sender.on_timeout(), TimeoutOutcome::Retransmit);
            sender.next_segments(Duration::ZERO);
        }
        assert_eq!(sender.on_timeout(), TimeoutOutcome::Stalled);
        assert!(sender.is_stalled());
        assert!(sender.next_segments(Duration::ZERO).is_empty());
        assert_eq!(sender.rto(), INITIAL_RTO * 32);
    }

    #[test]
    fn rto_follows_rfc6298() {
        let mut rto = RtoEstimator::default();
        assert_eq!(rto.rto(), INITIAL_RTO);
        rto.on_sample(Duration::from_millis(100));
        // srtt 100ms, rttvar 50ms: 100 + 200 = 300ms.
        assert_eq!(rto.rto(), Duration::from_millis(300));
        rto.on_sample(Duration::from_millis(1));
        assert!(rto.rto() >= MIN_RTO);
        for _ in 0..10 {
            rto.back_off();
        }
        assert_eq!(rto.rto(), MAX_RTO);
    }
}
