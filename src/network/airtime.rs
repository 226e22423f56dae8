//! Wi-Fi rate table and frame airtime.
//!
//! Contains helpers for:
//! - The HT MCS 0-7 rate table (20 MHz channel, 800 ns guard interval)
//! - Airtime of one data frame at a fixed rate
//! - MAC timing constants used by the contention model
//!
//! Units: payload sizes in bytes, time as `Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HT-mixed preamble and PHY headers (L-STF, L-LTF, L-SIG, HT-SIG, HT-STF, HT-LTF).
pub const PREAMBLE_DURATION: Duration = Duration::from_micros(36);
/// OFDM symbol duration with the long guard interval.
pub const SYMBOL_DURATION: Duration = Duration::from_micros(4);
/// Slot time of the 5 GHz / HT OFDM PHY.
pub const SLOT_TIME: Duration = Duration::from_micros(9);
pub const SIFS: Duration = Duration::from_micros(16);
/// DIFS = SIFS + 2 slots.
pub const DIFS: Duration = Duration::from_micros(34);
/// MAC header, FCS and LLC/SNAP bytes added to every IP packet.
pub const MAC_OVERHEAD_BYTES: usize = 38;

const SERVICE_BITS: u64 = 16;
const TAIL_BITS: u64 = 6;

/// Fixed modulation and coding scheme of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WifiMode {
    HtMcs0,
    HtMcs1,
    HtMcs2,
    HtMcs3,
    HtMcs4,
    HtMcs5,
    HtMcs6,
    #[default]
    HtMcs7,
}

impl WifiMode {
    /// Data bits carried by one OFDM symbol.
    pub fn bits_per_symbol(&self) -> u64 {
        match self {
            WifiMode::HtMcs0 => 26,
            WifiMode::HtMcs1 => 52,
            WifiMode::HtMcs2 => 78,
            WifiMode::HtMcs3 => 104,
            WifiMode::HtMcs4 => 156,
            WifiMode::HtMcs5 => 208,
            WifiMode::HtMcs6 => 234,
            WifiMode::HtMcs7 => 260,
        }
    }

    /// Nominal PHY data rate in bits per second (6.5 to 65 Mb/s).
    pub fn data_rate(&self) -> u64 {
        self.bits_per_symbol() * 250_000
    }
}

/// Time a frame carrying `ip_bytes` occupies the medium.
///
/// # Formula
///
/// ```text
/// airtime = preamble + ceil((16 + 8 × (ip_bytes + 38) + 6) / N_dbps) × 4 µs
/// ```
///
/// # Parameters
///
/// * `mode` - Modulation and coding scheme of the cell
/// * `ip_bytes` - IP packet size (headers included)
pub fn calculate_air_time(mode: WifiMode, ip_bytes: usize) -> Duration {
    let bits = SERVICE_BITS + 8 * (ip_bytes + MAC_OVERHEAD_BYTES) as u64 + TAIL_BITS;
    let symbols = bits.div_ceil(mode.bits_per_symbol());
    PREAMBLE_DURATION + SYMBOL_DURATION * symbols as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_table_spans_ht_mcs0_to_mcs7() {
        assert_eq!(WifiMode::HtMcs0.data_rate(), 6_500_000);
        assert_eq!(WifiMode::HtMcs4.data_rate(), 39_000_000);
        assert_eq!(WifiMode::HtMcs7.data_rate(), 65_000_000);
        assert_eq!(WifiMode::default(), WifiMode::HtMcs7);
    }

    #[test]
    fn airtime_of_a_full_datagram() {
        // 1052 IP bytes + 38 = 1090 bytes -> 8742 bits.
        // MCS7: ceil(8742 / 260) = 34 symbols -> 36 + 136 us.
        assert_eq!(calculate_air_time(WifiMode::HtMcs7, 1052), Duration::from_micros(172));
        // MCS0: ceil(8742 / 26) = 337 symbols -> 36 + 1348 us.
        assert_eq!(calculate_air_time(WifiMode::HtMcs0, 1052), Duration::from_micros(1384));
    }

    #[test]
    fn airtime_grows_with_size_and_shrinks_with_rate() {
        let small = calculate_air_time(WifiMode::HtMcs3, 40);
        let large = calculate_air_time(WifiMode::HtMcs3, 1500);
        assert!(small < large);
        assert!(calculate_air_time(WifiMode::HtMcs7, 1500) < large);
        assert!(small > PREAMBLE_DURATION);
    }
}
