//! Error type shared by every simulation component.

use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

use crate::flow_stats::FiveTuple;
use crate::network::{Ipv4Prefix, NodeId};

/// Errors reported by the simulation engine.
///
/// Transient conditions that happen while the clock runs (collisions, queue
/// overflow, retransmission timeouts, unroutable packets) are never returned
/// from `run`; they are recorded as flow statistics instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// An event was scheduled before the current simulation time.
    #[error("cannot schedule an event at {requested:?}: clock is already at {now:?}")]
    InvalidSchedule { requested: Duration, now: Duration },
    /// `assign_addresses` was called twice, or links were added afterwards.
    #[error("addresses have already been assigned")]
    AlreadyAssigned,
    /// An operation needs addresses but `assign_addresses` has not run yet.
    #[error("addresses have not been assigned yet")]
    AddressesNotAssigned,
    /// No forwarding path from a node to a destination address.
    #[error("no route from node {from} to {destination}")]
    NoRoute { from: NodeId, destination: Ipv4Addr },
    /// A prefix has no host identifier left for another interface.
    #[error("address space of {prefix} exhausted ({capacity} hosts)")]
    ExhaustedAddressSpace { prefix: Ipv4Prefix, capacity: u32 },
    /// Statistics were requested for a flow that was never observed.
    #[error("flow {0} was never observed")]
    UnknownFlow(FiveTuple),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown application {0}")]
    UnknownApp(usize),
    /// Build-time configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A type alias for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;
