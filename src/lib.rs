//! Deterministic discrete-event simulator of a Wi-Fi cell bridged to wired
//! servers.
//!
//! Stations share one contention-based wireless medium with an access point,
//! which forwards their traffic over point-to-point links to one or more
//! servers. Traffic generators drive datagram and stream flows; every packet is
//! classified by its 5-tuple and the run ends with per-flow throughput, delay,
//! jitter and loss.
//!
//! ```no_run
//! use std::time::Duration;
//! use wlan_flowsim::{Simulation, TopologyConfig, TrafficConfig};
//!
//! let mut simulation = Simulation::build_topology(&TopologyConfig::default(), 1)?;
//! for station in simulation.stations() {
//!     let traffic = TrafficConfig::fixed_count(10, Duration::from_secs(1), Duration::from_secs(2));
//!     simulation.attach_traffic(station, traffic)?;
//! }
//! simulation.run(Duration::from_secs(20))?;
//! for record in simulation.finish() {
//!     println!("{}: {:.3} Mb/s, {:.2} ms", record.flow, record.throughput_mbps(), record.mean_delay_ms());
//! }
//! # Ok::<(), wlan_flowsim::SimError>(())
//! ```
//!
//! The crate logs through the `log` facade and never installs a logger.

pub mod config;
pub mod error;
pub mod flow_stats;
pub mod mobility;
pub mod network;
pub mod simulation;
pub mod transport;

pub use config::{DataRate, MobilityConfig, ScenarioConfig, StationSelection, TopologyConfig, TrafficConfig, TrafficGroup, TrafficMode, WifiConfig};
pub use error::{SimError, SimResult};
pub use flow_stats::{FiveTuple, FlowRecord, FlowStatsCollector};
pub use mobility::MobilityEngine;
pub use mobility::geometry::{Point, Rect, Vector};
pub use network::{Ipv4Prefix, NodeId, NodeRole, Protocol, Topology, WifiMode};
pub use simulation::{RandomVariable, SimEvent, SimRng, Simulation};
pub use transport::{AppId, AppReport, Delivery, SinkReport};
