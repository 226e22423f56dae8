//! Send schedule of one application.
//!
//! The generator only decides *when* and *how much*; the owning application
//! turns each `Send` into a datagram or a stream write.

use std::time::Duration;

use crate::config::{TrafficConfig, TrafficMode};
use crate::simulation::SimRng;

/// What the application should do when its send timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStep {
    /// Send `bytes` now and wake up again at `next`, if any.
    Send { bytes: usize, next: Option<Duration> },
    /// Nothing to send now (off period); wake up at `next`.
    Idle { next: Duration },
    /// Keep the stream buffer full; no timer needed.
    Unlimited,
    Done,
}

#[derive(Debug, Clone)]
pub struct TrafficGenerator {
    mode: TrafficMode,
    packet_size: usize,
    interval: Duration,
    sent: u32,
    on_until: Option<Duration>,
}

impl TrafficGenerator {
    pub fn new(config: &TrafficConfig) -> Self {
        Self {
            mode: config.mode.clone(),
            packet_size: config.packet_size,
            interval: config.send_interval(),
            sent: 0,
            on_until: None,
        }
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Next step at time `now`. Called once when the application starts and
    /// again every time the wake-up it asked for fires.
    pub fn step(&mut self, now: Duration, rng: &mut SimRng) -> GeneratorStep {
        let step = match &self.mode {
            TrafficMode::Continuous => GeneratorStep::Send {
                bytes: self.packet_size,
                next: Some(now.saturating_add(self.interval)),
            },
            TrafficMode::OnOff { on_time, off_time } => {
                let on_until = match self.on_until {
                    Some(on_until) if now < on_until => on_until,
                    _ => {
                        let on = on_time.sample_duration(rng);
                        if on.is_zero() {
                            // Empty on period: skip straight to the next one, but always move forward.
                            let off = off_time.sample_duration(rng).max(self.interval);
                            return GeneratorStep::Idle { next: now.saturating_add(off) };
                        }
                        now.saturating_add(on)
                    }
                };
                self.on_until = Some(on_until);
                let next_send = now.saturating_add(self.interval);
                let next = if next_send < on_until {
                    next_send
                } else {
                    on_until.saturating_add(off_time.sample_duration(rng))
                };
                GeneratorStep::Send {
                    bytes: self.packet_size,
                    next: Some(next),
                }
            }
            TrafficMode::FixedCount { count, interval, .. } => {
                if self.sent >= *count {
                    GeneratorStep::Done
                } else {
                    let next = (self.sent + 1 < *count).then(|| now.saturating_add(*interval));
                    GeneratorStep::Send { bytes: self.packet_size, next }
                }
            }
            TrafficMode::Bulk => GeneratorStep::Unlimited,
        };
        if let GeneratorStep::Send { .. } = step {
            self.sent += 1;
        }
        step
    }
}
