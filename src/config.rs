//! Typed configuration for topologies, mobility, traffic and whole scenarios.
//!
//! Every struct deserializes from TOML with `deny_unknown_fields`, so a typo in
//! a scenario file is an error instead of a silently ignored attribute.
//! Durations are given as seconds (`start = 2.0`), data rates as strings
//! (`data_rate = "50Mbps"`) and prefixes as `"192.168.0.0/24"`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{SimError, SimResult};
use crate::mobility::geometry::{Point, Rect, Vector};
use crate::network::{Ipv4Prefix, NodeId, Protocol, WifiMode};
use crate::simulation::RandomVariable;

/// Bit rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps * 1_000)
    }

    pub const fn from_mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    pub const fn from_gbps(gbps: u64) -> Self {
        Self(gbps * 1_000_000_000)
    }

    pub fn bps(&self) -> u64 {
        self.0
    }

    pub fn mbps(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Time to serialize `bytes` at this rate, rounded up to the nanosecond.
    pub fn transmission_time(&self, bytes: usize) -> Duration {
        if self.0 == 0 {
            return Duration::MAX;
        }
        let nanos = (bytes as u128 * 8 * 1_000_000_000).div_ceil(self.0 as u128);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl FromStr for DataRate {
    type Err = SimError;

    /// Parses `"100Mbps"`, `"54 Mb/s"`, `"500kbps"` or a bare number of bits per second.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SimError::InvalidConfig(format!("invalid data rate '{s}'"));
        let s = s.trim();
        let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number.parse().map_err(|_| invalid())?;
        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "bps" | "b/s" => 1.0,
            "kbps" | "kb/s" => 1e3,
            "mbps" | "mb/s" => 1e6,
            "gbps" | "gb/s" => 1e9,
            _ => return Err(invalid()),
        };
        let bps = value * multiplier;
        if !bps.is_finite() || bps < 0.0 {
            return Err(invalid());
        }
        Ok(DataRate(bps.round() as u64))
    }
}

impl TryFrom<String> for DataRate {
    type Error = SimError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataRate> for String {
    fn from(rate: DataRate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "0bps"),
            bps if bps % 1_000_000_000 == 0 => write!(f, "{}Gbps", bps / 1_000_000_000),
            bps if bps % 1_000_000 == 0 => write!(f, "{}Mbps", bps / 1_000_000),
            bps if bps % 1_000 == 0 => write!(f, "{}kbps", bps / 1_000),
            bps => write!(f, "{bps}bps"),
        }
    }
}

/// Serde helpers for durations written as floating point seconds.
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| D::Error::custom(format!("invalid duration {secs} s: must be finite and non-negative")))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer, de::Error};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            match Option::<f64>::deserialize(deserializer)? {
                Some(secs) => Duration::try_from_secs_f64(secs)
                    .map(Some)
                    .map_err(|_| D::Error::custom(format!("invalid duration {secs} s: must be finite and non-negative"))),
                None => Ok(None),
            }
        }
    }
}

/// Radio parameters shared by every interface of a wireless cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiConfig {
    /// Fixed data rate of the cell.
    pub mode: WifiMode,
    /// Frames to receivers farther away than this (metres) are lost.
    pub range: f64,
    /// MAC queue length per interface, in frames.
    pub queue_limit: usize,
    /// Backoff is drawn uniformly from `[0, contention_window)` slots.
    pub contention_window: u32,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            mode: WifiMode::HtMcs7,
            range: 100.0,
            queue_limit: 500,
            contention_window: 16,
        }
    }
}

impl WifiConfig {
    pub fn validate(&self) -> SimResult<()> {
        if !(self.range.is_finite() && self.range > 0.0) {
            return Err(SimError::InvalidConfig(format!("wifi range {} must be positive", self.range)));
        }
        if self.queue_limit == 0 {
            return Err(SimError::InvalidConfig("wifi queue_limit must be at least 1".to_string()));
        }
        if self.contention_window == 0 {
            return Err(SimError::InvalidConfig("wifi contention_window must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Station placement order on a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridLayout {
    #[default]
    RowFirst,
    ColumnFirst,
}

/// One constant-velocity track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Track {
    pub position: Point,
    #[serde(default)]
    pub velocity: Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingHeading {
    /// Away from the ring center.
    #[default]
    Radial,
    /// Counter-clockwise along the ring.
    Tangential,
}

/// When a random walker picks a new direction and speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum WalkChange {
    /// After walking for `interval` seconds.
    Time {
        #[serde(with = "serde_secs")]
        interval: Duration,
    },
    /// After covering `distance` metres.
    Distance { distance: f64 },
}

impl Default for WalkChange {
    fn default() -> Self {
        WalkChange::Time { interval: Duration::from_secs(1) }
    }
}

/// Motion model of the stations, one variant per model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case", deny_unknown_fields)]
pub enum MobilityConfig {
    /// Positions used cyclically by station index.
    Fixed { positions: Vec<Point> },
    /// Regular lattice filled row by row (or column by column).
    Grid {
        min_x: f64,
        min_y: f64,
        delta_x: f64,
        delta_y: f64,
        grid_width: u32,
        #[serde(default)]
        layout: GridLayout,
    },
    /// Independent uniform x and y within `bounds`.
    UniformRandomPlacement { bounds: Rect },
    /// Tracks used cyclically by station index.
    ConstantVelocity { tracks: Vec<Track> },
    /// Stations evenly spaced on a circle, all moving at `speed`.
    Ring {
        center: Point,
        radius: f64,
        #[serde(default)]
        speed: f64,
        #[serde(default)]
        heading: RingHeading,
    },
    BoundedRandomWalk {
        bounds: Rect,
        speed: RandomVariable,
        #[serde(default)]
        change: WalkChange,
    },
}

impl Default for MobilityConfig {
    fn default() -> Self {
        MobilityConfig::Grid {
            min_x: 0.0,
            min_y: 0.0,
            delta_x: 5.0,
            delta_y: 10.0,
            grid_width: 3,
            layout: GridLayout::RowFirst,
        }
    }
}

impl MobilityConfig {
    pub fn model_name(&self) -> &'static str {
        match self {
            MobilityConfig::Fixed { .. } => "fixed",
            MobilityConfig::Grid { .. } => "grid",
            MobilityConfig::UniformRandomPlacement { .. } => "uniform_random_placement",
            MobilityConfig::ConstantVelocity { .. } => "constant_velocity",
            MobilityConfig::Ring { .. } => "ring",
            MobilityConfig::BoundedRandomWalk { .. } => "bounded_random_walk",
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        let invalid = |msg: String| Err(SimError::InvalidConfig(msg));
        match self {
            MobilityConfig::Fixed { positions } if positions.is_empty() => invalid("fixed mobility needs at least one position".to_string()),
            MobilityConfig::Grid { grid_width: 0, .. } => invalid("grid_width must be at least 1".to_string()),
            MobilityConfig::UniformRandomPlacement { bounds } | MobilityConfig::BoundedRandomWalk { bounds, .. } if !bounds.is_valid() => {
                invalid(format!("invalid bounds {bounds:?}"))
            }
            MobilityConfig::ConstantVelocity { tracks } if tracks.is_empty() => invalid("constant_velocity mobility needs at least one track".to_string()),
            MobilityConfig::Ring { radius, speed, .. } if !(radius.is_finite() && *radius >= 0.0 && speed.is_finite()) => {
                invalid(format!("invalid ring radius {radius} or speed {speed}"))
            }
            MobilityConfig::BoundedRandomWalk { speed, change, .. } => {
                speed.validate("walk speed")?;
                match change {
                    WalkChange::Time { interval } if interval.is_zero() => invalid("walk interval must be positive".to_string()),
                    WalkChange::Distance { distance } if !(distance.is_finite() && *distance > 0.0) => invalid(format!("walk distance {distance} must be positive")),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Everything `Simulation::build_topology` needs for one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyConfig {
    pub station_count: usize,
    pub server_count: usize,
    pub wireless_prefix: Ipv4Prefix,
    pub wired_prefix: Ipv4Prefix,
    /// Capacity of every access point to server link.
    pub link_capacity: DataRate,
    #[serde(with = "serde_secs")]
    pub link_delay: Duration,
    /// Drop-tail queue length of each wired device, in packets.
    pub wired_queue_limit: usize,
    pub wifi: WifiConfig,
    pub access_point_position: Point,
    /// Motion model of the stations. The access point and servers never move.
    pub mobility: MobilityConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            station_count: 4,
            server_count: 1,
            wireless_prefix: Ipv4Prefix::truncated(Ipv4Addr::new(192, 168, 0, 0), 24),
            wired_prefix: Ipv4Prefix::truncated(Ipv4Addr::new(10, 1, 1, 0), 24),
            link_capacity: DataRate::from_mbps(100),
            link_delay: Duration::from_millis(2),
            wired_queue_limit: crate::network::DEFAULT_WIRED_QUEUE_LIMIT,
            wifi: WifiConfig::default(),
            access_point_position: Point::new(25.0, 25.0),
            mobility: MobilityConfig::default(),
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> SimResult<()> {
        if self.server_count == 0 {
            return Err(SimError::InvalidConfig("server_count must be at least 1".to_string()));
        }
        if self.link_capacity.bps() == 0 {
            return Err(SimError::InvalidConfig("link_capacity must be positive".to_string()));
        }
        if self.wired_queue_limit == 0 {
            return Err(SimError::InvalidConfig("wired_queue_limit must be at least 1".to_string()));
        }
        self.wifi.validate()?;
        self.mobility.validate()
    }
}

/// How a traffic generator spaces its sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum TrafficMode {
    /// One packet every `packet_size * 8 / data_rate`.
    Continuous,
    /// Continuous while on, silent while off. Period lengths are drawn in seconds.
    OnOff {
        #[serde(default = "always_on")]
        on_time: RandomVariable,
        #[serde(default = "never_off")]
        off_time: RandomVariable,
    },
    /// `count` packets, one every `interval`.
    FixedCount {
        count: u32,
        #[serde(with = "serde_secs")]
        interval: Duration,
        /// Ask the sink to echo each datagram back.
        #[serde(default)]
        echo: bool,
    },
    /// Keep the stream send buffer full until stop.
    Bulk,
}

fn always_on() -> RandomVariable {
    RandomVariable::constant(1.0)
}

fn never_off() -> RandomVariable {
    RandomVariable::constant(0.0)
}

/// One traffic generator attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficConfig {
    pub protocol: Protocol,
    pub mode: TrafficMode,
    /// Application bytes per packet (maximum segment size for streams).
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_data_rate")]
    pub data_rate: DataRate,
    #[serde(default, with = "serde_secs")]
    pub start: Duration,
    /// Stop sending at this time; `None` runs until the simulation ends.
    #[serde(default, with = "serde_secs::option", skip_serializing_if = "Option::is_none")]
    pub stop: Option<Duration>,
    /// Receiving node; defaults to the first server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<NodeId>,
    /// Destination port; defaults to 5000 for streams and 9 for datagrams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_packet_size() -> usize {
    1024
}

fn default_data_rate() -> DataRate {
    DataRate::from_mbps(50)
}

pub const DEFAULT_STREAM_PORT: u16 = 5000;
pub const DEFAULT_DATAGRAM_PORT: u16 = 9;

impl TrafficConfig {
    pub fn new(protocol: Protocol, mode: TrafficMode) -> Self {
        Self {
            protocol,
            mode,
            packet_size: default_packet_size(),
            data_rate: default_data_rate(),
            start: Duration::ZERO,
            stop: None,
            destination: None,
            port: None,
        }
    }

    /// Datagrams sent every `interval` starting at `start`, `count` times.
    pub fn fixed_count(count: u32, interval: Duration, start: Duration) -> Self {
        Self {
            start,
            ..Self::new(Protocol::Datagram, TrafficMode::FixedCount { count, interval, echo: false })
        }
    }

    pub fn destination_port(&self) -> u16 {
        self.port.unwrap_or(match self.protocol {
            Protocol::Stream => DEFAULT_STREAM_PORT,
            Protocol::Datagram => DEFAULT_DATAGRAM_PORT,
        })
    }

    /// Spacing of continuous sends.
    pub fn send_interval(&self) -> Duration {
        self.data_rate.transmission_time(self.packet_size)
    }

    pub fn validate(&self) -> SimResult<()> {
        let invalid = |msg: String| Err(SimError::InvalidConfig(msg));
        if self.packet_size == 0 {
            return invalid("packet_size must be positive".to_string());
        }
        if self.packet_size > 65_000 {
            return invalid(format!("packet_size {} does not fit in one IP packet", self.packet_size));
        }
        if let Some(stop) = self.stop {
            if stop < self.start {
                return invalid(format!("stop {stop:?} is before start {:?}", self.start));
            }
        }
        match &self.mode {
            TrafficMode::Continuous | TrafficMode::OnOff { .. } if self.data_rate.bps() == 0 => invalid("data_rate must be positive".to_string()),
            TrafficMode::OnOff { on_time, off_time } => {
                on_time.validate("on_time")?;
                off_time.validate("off_time")?;
                if on_time.is_always_zero() {
                    return invalid("on_time is always zero: the generator would never send".to_string());
                }
                Ok(())
            }
            TrafficMode::FixedCount { echo: true, .. } if self.protocol == Protocol::Stream => invalid("echo is only available for datagrams".to_string()),
            TrafficMode::Bulk if self.protocol == Protocol::Datagram => invalid("bulk mode needs the stream protocol".to_string()),
            _ => Ok(()),
        }
    }
}

/// Which stations a traffic group applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationSelection {
    All,
    /// Stations `0..n/2`.
    FirstHalf,
    /// Stations `n/2..n`.
    SecondHalf,
    /// Stations `start..end` by index, clamped to the station count.
    Range { start: usize, end: usize },
}

impl StationSelection {
    /// Station indices selected out of `count`.
    pub fn indices(&self, count: usize) -> std::ops::Range<usize> {
        match *self {
            StationSelection::All => 0..count,
            StationSelection::FirstHalf => 0..count / 2,
            StationSelection::SecondHalf => count / 2..count,
            StationSelection::Range { start, end } => start.min(count)..end.min(count).max(start.min(count)),
        }
    }
}

/// Traffic applied to a selection of stations. The traffic keys sit next to
/// `stations` in the same table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficGroup {
    pub stations: StationSelection,
    #[serde(flatten)]
    pub traffic: TrafficConfig,
}

/// A complete experiment: topology, traffic and run length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(with = "serde_secs")]
    pub stop_time: Duration,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub traffic: Vec<TrafficGroup>,
}

impl ScenarioConfig {
    /// Load a scenario from a TOML file.
    ///
    /// # Parameters
    ///
    /// * `path` - Path to the scenario file
    ///
    /// # Returns
    ///
    /// The parsed and validated scenario, or an error naming the file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid scenario file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scenario: ScenarioConfig = toml::from_str(content).context("Invalid TOML format")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> SimResult<()> {
        self.topology.validate()?;
        for group in &self.traffic {
            group.traffic.validate()?;
        }
        Ok(())
    }
}
