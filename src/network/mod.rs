//! Network model: topology and addressing, packets, airtime and medium access.

pub mod address;
pub mod airtime;
pub mod medium;
pub mod packet;
pub mod topology;

pub use address::{AddressAllocator, Ipv4Prefix};
pub use airtime::{WifiMode, calculate_air_time};
pub use medium::{FrameId, MacContext, MediumAccess, MediumCounters};
pub use packet::{EchoKind, Packet, PacketBody, Protocol};
pub use topology::{DEFAULT_WIRED_QUEUE_LIMIT, Interface, InterfaceId, Link, LinkId, LinkKind, LinkLayerKind, Node, NodeId, NodeRole, Route, Topology};
