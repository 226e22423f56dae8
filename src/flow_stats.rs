//! Per-flow statistics.
//!
//! Packets are classified by their 5-tuple. A flow is created the first time
//! any event mentions it and is never removed. Counters mirror what a flow
//! monitor sitting at the IP layer sees:
//! - `on_send` when a packet leaves its originating node
//! - `on_receive` when it reaches the IP layer of its destination
//! - `on_loss` whenever it is dropped on the way
//!
//! Derived metrics (throughput, mean delay, loss ratio) are computed when a
//! snapshot is taken.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{SimError, SimResult};
use crate::network::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FiveTuple {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: Protocol,
    pub source_port: u16,
    pub destination_port: u16,
}

impl FiveTuple {
    /// The tuple of traffic flowing the other way (acks, echo replies).
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            protocol: self.protocol,
            source_port: self.destination_port,
            destination_port: self.source_port,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.source, self.source_port, self.destination, self.destination_port
        )
    }
}

/// Counters and derived metrics of one flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    /// 1-based, in first-seen order. Zero for a flow that was never observed.
    pub flow_id: u32,
    pub flow: FiveTuple,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub lost_packets: u64,
    pub first_tx: Option<Duration>,
    pub last_tx: Option<Duration>,
    pub first_rx: Option<Duration>,
    pub last_rx: Option<Duration>,
    pub delay_sum: Duration,
    pub jitter_sum: Duration,
    /// A stream on this flow gave up after repeated retransmission timeouts.
    pub stalled: bool,
    /// Received bits per second over `[first_tx, last_rx]`.
    pub throughput_bps: f64,
    pub mean_delay: Duration,
    pub mean_jitter: Duration,
    pub loss_percent: f64,
    #[serde(skip)]
    last_delay: Option<Duration>,
}

impl FlowRecord {
    fn new(flow_id: u32, flow: FiveTuple) -> Self {
        Self {
            flow_id,
            flow,
            tx_bytes: 0,
            tx_packets: 0,
            rx_bytes: 0,
            rx_packets: 0,
            lost_packets: 0,
            first_tx: None,
            last_tx: None,
            first_rx: None,
            last_rx: None,
            delay_sum: Duration::ZERO,
            jitter_sum: Duration::ZERO,
            stalled: false,
            throughput_bps: 0.0,
            mean_delay: Duration::ZERO,
            mean_jitter: Duration::ZERO,
            loss_percent: 0.0,
            last_delay: None,
        }
    }

    fn update_derived(&mut self) {
        self.throughput_bps = match (self.first_tx, self.last_rx) {
            (Some(first), Some(last)) if self.rx_packets > 0 && last > first => self.rx_bytes as f64 * 8.0 / (last - first).as_secs_f64(),
            _ => 0.0,
        };
        self.mean_delay = if self.rx_packets > 0 {
            self.delay_sum / self.rx_packets as u32
        } else {
            Duration::ZERO
        };
        self.mean_jitter = if self.rx_packets > 1 {
            self.jitter_sum / (self.rx_packets - 1) as u32
        } else {
            Duration::ZERO
        };
        self.loss_percent = if self.tx_packets > 0 {
            self.tx_packets.saturating_sub(self.rx_packets) as f64 / self.tx_packets as f64 * 100.0
        } else {
            0.0
        };
    }

    pub fn throughput_mbps(&self) -> f64 {
        self.throughput_bps / 1_000_000.0
    }

    pub fn mean_delay_ms(&self) -> f64 {
        self.mean_delay.as_secs_f64() * 1000.0
    }
}

/// Classifies packets into flows and accumulates their counters.
#[derive(Debug, Default)]
pub struct FlowStatsCollector {
    records: Vec<FlowRecord>,
    index: HashMap<FiveTuple, usize>,
}

impl FlowStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, flow: FiveTuple) -> &mut FlowRecord {
        let position = match self.index.get(&flow) {
            Some(&position) => position,
            None => {
                let position = self.records.len();
                self.records.push(FlowRecord::new(position as u32 + 1, flow));
                self.index.insert(flow, position);
                log::debug!("New flow {} ({})", position + 1, flow);
                position
            }
        };
        &mut self.records[position]
    }

    /// A packet of `bytes` left its originating node at `time`.
    pub fn on_send(&mut self, flow: FiveTuple, bytes: usize, time: Duration) {
        let record = self.entry(flow);
        record.tx_packets += 1;
        record.tx_bytes += bytes as u64;
        record.first_tx.get_or_insert(time);
        record.last_tx = Some(time);
    }

    /// A packet sent at `send_time` reached its destination at `receive_time`.
    pub fn on_receive(&mut self, flow: FiveTuple, bytes: usize, send_time: Duration, receive_time: Duration) {
        let record = self.entry(flow);
        let delay = receive_time.saturating_sub(send_time);
        record.rx_packets += 1;
        record.rx_bytes += bytes as u64;
        record.first_rx.get_or_insert(receive_time);
        record.last_rx = Some(receive_time);
        record.delay_sum += delay;
        if let Some(previous) = record.last_delay {
            record.jitter_sum += delay.abs_diff(previous);
        }
        record.last_delay = Some(delay);
    }

    /// A packet of `bytes` was dropped (collision, range, queue overflow, no route).
    pub fn on_loss(&mut self, flow: FiveTuple, _bytes: usize) {
        self.entry(flow).lost_packets += 1;
    }

    /// A stream on `flow` gave up retransmitting.
    pub fn on_stall(&mut self, flow: FiveTuple) {
        self.entry(flow).stalled = true;
    }

    /// Owned copies of every flow in first-seen order, with derived metrics.
    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.records
            .iter()
            .map(|record| {
                let mut record = record.clone();
                record.update_derived();
                record
            })
            .collect()
    }

    /// Record of `flow`, or a zeroed record when it was never observed.
    pub fn record(&self, flow: &FiveTuple) -> FlowRecord {
        self.lookup(flow).unwrap_or_else(|_| FlowRecord::new(0, *flow))
    }

    /// Record of `flow`, failing with [`SimError::UnknownFlow`] when it was never observed.
    pub fn lookup(&self, flow: &FiveTuple) -> SimResult<FlowRecord> {
        let position = self.index.get(flow).ok_or(SimError::UnknownFlow(*flow))?;
        let mut record = self.records[*position].clone();
        record.update_derived();
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
