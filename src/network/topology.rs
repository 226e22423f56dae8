//! Nodes, interfaces, links, address assignment and static routing.
//!
//! The topology is built once before the run:
//! - `add_node` creates servers, access points and stations
//! - `add_wireless_link` / `add_wired_link` attach interfaces to links
//! - `assign_addresses` hands out addresses in link declaration order and
//!   computes host routes for every node
//!
//! After assignment the topology is read-only.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::address::{AddressAllocator, Ipv4Prefix};
use crate::config::DataRate;
use crate::error::{SimError, SimResult};

/// Default drop-tail queue length of a wired device, in packets.
pub const DEFAULT_WIRED_QUEUE_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeRole {
    Server,
    AccessPoint,
    Station,
}

impl NodeRole {
    /// Only access points forward traffic that is not addressed to them.
    pub fn forwards(&self) -> bool {
        matches!(self, NodeRole::AccessPoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayerKind {
    WifiStation,
    WifiAccessPoint,
    PointToPoint,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub id: InterfaceId,
    pub node: NodeId,
    pub link: LinkId,
    pub kind: LinkLayerKind,
    pub prefix: Ipv4Prefix,
    /// `None` until `assign_addresses` has run.
    pub address: Option<Ipv4Addr>,
}

/// Next step towards a destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Outgoing interface on the routing node.
    pub interface: InterfaceId,
    /// Neighbor that receives the frame on that interface's link.
    pub next_hop: NodeId,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    pub interfaces: Vec<InterfaceId>,
    routes: BTreeMap<Ipv4Addr, Route>,
}

impl Node {
    pub fn routes(&self) -> impl Iterator<Item = (&Ipv4Addr, &Route)> {
        self.routes.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkKind {
    /// Shared contention-based medium.
    Wireless,
    /// Point-to-point link with a drop-tail queue at each end.
    Wired { capacity: DataRate, delay: Duration, queue_limit: usize },
}

#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub prefix: Ipv4Prefix,
    pub kind: LinkKind,
    /// Attached interfaces in participant order.
    pub interfaces: Vec<InterfaceId>,
}

#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<Node>,
    interfaces: Vec<Interface>,
    links: Vec<Link>,
    by_address: HashMap<Ipv4Addr, InterfaceId>,
    assigned: bool,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, role: NodeRole) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            role,
            interfaces: Vec::new(),
            routes: BTreeMap::new(),
        });
        id
    }

    /// Bind access points and stations to one shared wireless medium.
    pub fn add_wireless_link(&mut self, prefix: Ipv4Prefix, participants: &[NodeId]) -> SimResult<LinkId> {
        self.ensure_open()?;
        if participants.is_empty() {
            return Err(SimError::InvalidConfig(format!("wireless link {prefix} has no participants")));
        }
        let mut kinds = Vec::with_capacity(participants.len());
        for (index, &node) in participants.iter().enumerate() {
            if participants[..index].contains(&node) {
                return Err(SimError::InvalidConfig(format!("node {node} joins wireless link {prefix} twice")));
            }
            kinds.push(match self.node(node)?.role {
                NodeRole::AccessPoint => LinkLayerKind::WifiAccessPoint,
                NodeRole::Station => LinkLayerKind::WifiStation,
                NodeRole::Server => return Err(SimError::InvalidConfig(format!("server {node} cannot join a wireless link"))),
            });
        }
        let attachments: Vec<(NodeId, LinkLayerKind)> = participants.iter().copied().zip(kinds).collect();
        Ok(self.push_link(prefix, LinkKind::Wireless, &attachments))
    }

    /// Connect `a` and `b` with a point-to-point link using the default queue length.
    pub fn add_wired_link(&mut self, prefix: Ipv4Prefix, a: NodeId, b: NodeId, capacity: DataRate, delay: Duration) -> SimResult<LinkId> {
        self.add_wired_link_with_queue(prefix, a, b, capacity, delay, DEFAULT_WIRED_QUEUE_LIMIT)
    }

    pub fn add_wired_link_with_queue(&mut self, prefix: Ipv4Prefix, a: NodeId, b: NodeId, capacity: DataRate, delay: Duration, queue_limit: usize) -> SimResult<LinkId> {
        self.ensure_open()?;
        self.node(a)?;
        self.node(b)?;
        if a == b {
            return Err(SimError::InvalidConfig(format!("wired link {prefix} connects node {a} to itself")));
        }
        if capacity.bps() == 0 {
            return Err(SimError::InvalidConfig(format!("wired link {prefix} has zero capacity")));
        }
        if queue_limit == 0 {
            return Err(SimError::InvalidConfig(format!("wired link {prefix} has a zero queue limit")));
        }
        let kind = LinkKind::Wired { capacity, delay, queue_limit };
        Ok(self.push_link(prefix, kind, &[(a, LinkLayerKind::PointToPoint), (b, LinkLayerKind::PointToPoint)]))
    }

    fn ensure_open(&self) -> SimResult<()> {
        if self.assigned { Err(SimError::AlreadyAssigned) } else { Ok(()) }
    }

    fn push_link(&mut self, prefix: Ipv4Prefix, kind: LinkKind, attachments: &[(NodeId, LinkLayerKind)]) -> LinkId {
        let link_id = LinkId(self.links.len());
        let mut attached = Vec::with_capacity(attachments.len());
        for &(node, layer) in attachments {
            let id = InterfaceId(self.interfaces.len());
            self.interfaces.push(Interface {
                id,
                node,
                link: link_id,
                kind: layer,
                prefix,
                address: None,
            });
            self.nodes[node.0 as usize].interfaces.push(id);
            attached.push(id);
        }
        self.links.push(Link {
            id: link_id,
            prefix,
            kind,
            interfaces: attached,
        });
        link_id
    }

    /// Assign one address to every interface and compute static routes.
    ///
    /// Links are visited in declaration order. On each link the infrastructure
    /// side is numbered first: access points on a wireless link, endpoint `a`
    /// on a wired link. Nothing is written when any prefix runs out of hosts.
    pub fn assign_addresses(&mut self) -> SimResult<()> {
        self.ensure_open()?;
        let mut allocator = AddressAllocator::new();
        let mut staged = Vec::with_capacity(self.interfaces.len());
        for link in &self.links {
            let (infrastructure, others): (Vec<InterfaceId>, Vec<InterfaceId>) = match link.kind {
                LinkKind::Wireless => link.interfaces.iter().partition(|id| self.interfaces[id.0].kind == LinkLayerKind::WifiAccessPoint),
                LinkKind::Wired { .. } => (link.interfaces[..1].to_vec(), link.interfaces[1..].to_vec()),
            };
            for id in infrastructure.into_iter().chain(others) {
                staged.push((id, allocator.allocate(link.prefix)?));
            }
        }

        // Links sharing a prefix share one host counter, so addresses never repeat.
        for (id, address) in staged {
            self.by_address.insert(address, id);
            self.interfaces[id.0].address = Some(address);
        }
        self.assigned = true;
        self.compute_routes();
        log::info!("Assigned {} addresses on {} links for {} nodes", self.interfaces.len(), self.links.len(), self.nodes.len());
        Ok(())
    }

    /// Breadth-first search from every node. Only forwarding nodes are expanded
    /// beyond the first hop, so stations and servers never carry transit traffic.
    fn compute_routes(&mut self) {
        let mut all_routes = Vec::with_capacity(self.nodes.len());
        for source in &self.nodes {
            let mut first_hop: BTreeMap<NodeId, Route> = BTreeMap::new();
            let mut queue = VecDeque::new();
            for (interface, neighbor) in self.neighbors(source.id) {
                if neighbor != source.id && !first_hop.contains_key(&neighbor) {
                    first_hop.insert(neighbor, Route { interface, next_hop: neighbor });
                    queue.push_back(neighbor);
                }
            }
            while let Some(current) = queue.pop_front() {
                if !self.nodes[current.0 as usize].role.forwards() {
                    continue;
                }
                let via = first_hop[&current];
                for (_, neighbor) in self.neighbors(current) {
                    if neighbor != source.id && !first_hop.contains_key(&neighbor) {
                        first_hop.insert(neighbor, via);
                        queue.push_back(neighbor);
                    }
                }
            }

            let mut routes = BTreeMap::new();
            for (destination, route) in first_hop {
                for id in &self.nodes[destination.0 as usize].interfaces {
                    if let Some(address) = self.interfaces[id.0].address {
                        routes.insert(address, route);
                    }
                }
            }
            all_routes.push(routes);
        }
        for (node, routes) in self.nodes.iter_mut().zip(all_routes) {
            node.routes = routes;
        }
    }

    /// (local interface, neighbor node) pairs in interface declaration order.
    fn neighbors(&self, node: NodeId) -> Vec<(InterfaceId, NodeId)> {
        let mut result = Vec::new();
        for id in &self.nodes[node.0 as usize].interfaces {
            let link = &self.links[self.interfaces[id.0].link.0];
            for peer in &link.interfaces {
                let peer_node = self.interfaces[peer.0].node;
                if peer_node != node {
                    result.push((*id, peer_node));
                }
            }
        }
        result
    }

    /// Next hop from `from` towards `destination`.
    pub fn route(&self, from: NodeId, destination: Ipv4Addr) -> SimResult<Route> {
        if !self.assigned {
            return Err(SimError::AddressesNotAssigned);
        }
        self.node(from)?
            .routes
            .get(&destination)
            .copied()
            .ok_or(SimError::NoRoute { from, destination })
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned
    }

    pub fn node(&self, id: NodeId) -> SimResult<&Node> {
        self.nodes.get(id.0 as usize).ok_or(SimError::UnknownNode(id))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(id.0)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn interfaces_of(&self, node: NodeId) -> impl Iterator<Item = &Interface> {
        self.nodes
            .get(node.0 as usize)
            .into_iter()
            .flat_map(|n| n.interfaces.iter().map(|id| &self.interfaces[id.0]))
    }

    /// Address of the node's first interface.
    pub fn address_of(&self, node: NodeId) -> Option<Ipv4Addr> {
        self.interfaces_of(node).find_map(|interface| interface.address)
    }

    pub fn node_of_address(&self, address: Ipv4Addr) -> Option<NodeId> {
        self.by_address.get(&address).map(|id| self.interfaces[id.0].node)
    }

    pub fn owns_address(&self, node: NodeId, address: Ipv4Addr) -> bool {
        self.node_of_address(address) == Some(node)
    }

    /// Interface of `node` attached to `link`.
    pub fn interface_on_link(&self, node: NodeId, link: LinkId) -> Option<InterfaceId> {
        self.links.get(link.0)?.interfaces.iter().copied().find(|id| self.interfaces[id.0].node == node)
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.role == role).map(|n| n.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn prefix(s: &str) -> Ipv4Prefix {
        s.parse().unwrap()
    }

    fn cell(stations: usize) -> (Topology, NodeId, NodeId, Vec<NodeId>) {
        let mut topology = Topology::new();
        let server = topology.add_node(NodeRole::Server);
        let ap = topology.add_node(NodeRole::AccessPoint);
        let stas: Vec<NodeId> = (0..stations).map(|_| topology.add_node(NodeRole::Station)).collect();
        let mut members = stas.clone();
        members.push(ap);
        topology.add_wireless_link(prefix("192.168.0.0/24"), &members).unwrap();
        topology
            .add_wired_link(prefix("10.1.1.0/24"), ap, server, DataRate::from_mbps(100), Duration::from_millis(2))
            .unwrap();
        (topology, server, ap, stas)
    }

    #[test]
    fn wireless_cell_gets_distinct_addresses_in_prefix() {
        let (mut topology, server, ap, stas) = cell(10);
        topology.assign_addresses().unwrap();

        let wlan = prefix("192.168.0.0/24");
        let wireless: Vec<Ipv4Addr> = topology
            .interfaces()
            .iter()
            .filter(|i| i.prefix == wlan)
            .map(|i| i.address.unwrap())
            .collect();
        assert_eq!(wireless.len(), 11);
        assert!(wireless.iter().all(|a| wlan.contains(*a)));
        assert_eq!(wireless.iter().collect::<HashSet<_>>().len(), 11);

        // Infrastructure endpoints are numbered first even though the AP was listed last.
        assert_eq!(topology.address_of(ap), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(topology.address_of(stas[0]), Some(Ipv4Addr::new(192, 168, 0, 2)));
        assert_eq!(topology.address_of(server), Some(Ipv4Addr::new(10, 1, 1, 2)));
    }

    #[test]
    fn assigning_twice_or_growing_afterwards_fails() {
        let (mut topology, server, ap, _) = cell(2);
        topology.assign_addresses().unwrap();
        assert_eq!(topology.assign_addresses(), Err(SimError::AlreadyAssigned));
        assert_eq!(
            topology.add_wired_link(prefix("10.2.0.0/24"), ap, server, DataRate::from_mbps(1), Duration::ZERO),
            Err(SimError::AlreadyAssigned)
        );
    }

    #[test]
    fn exhausted_prefix_leaves_no_partial_assignment() {
        let mut topology = Topology::new();
        let ap = topology.add_node(NodeRole::AccessPoint);
        let stas: Vec<NodeId> = (0..3).map(|_| topology.add_node(NodeRole::Station)).collect();
        let mut members = vec![ap];
        members.extend(&stas);
        topology.add_wireless_link(prefix("192.168.0.0/30"), &members).unwrap();

        let err = topology.assign_addresses().unwrap_err();
        assert!(matches!(err, SimError::ExhaustedAddressSpace { capacity: 2, .. }));
        assert!(topology.interfaces().iter().all(|i| i.address.is_none()));
        assert!(!topology.is_assigned());
    }

    #[test]
    fn invalid_links_are_rejected() {
        let mut topology = Topology::new();
        let server = topology.add_node(NodeRole::Server);
        let ap = topology.add_node(NodeRole::AccessPoint);
        let wlan = prefix("192.168.0.0/24");
        let wired = prefix("10.1.1.0/24");

        assert!(matches!(topology.add_wireless_link(wlan, &[ap, server]), Err(SimError::InvalidConfig(_))));
        assert!(matches!(topology.add_wireless_link(wlan, &[ap, NodeId(9)]), Err(SimError::UnknownNode(NodeId(9)))));
        assert!(matches!(
            topology.add_wired_link(wired, ap, server, DataRate::from_bps(0), Duration::ZERO),
            Err(SimError::InvalidConfig(_))
        ));
        assert!(matches!(
            topology.add_wired_link(wired, ap, ap, DataRate::from_mbps(1), Duration::ZERO),
            Err(SimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn routes_go_through_access_point_only() {
        let (mut topology, server, ap, stas) = cell(2);
        assert_eq!(topology.route(stas[0], Ipv4Addr::new(10, 1, 1, 2)), Err(SimError::AddressesNotAssigned));
        topology.assign_addresses().unwrap();

        let server_addr = topology.address_of(server).unwrap();
        let route = topology.route(stas[0], server_addr).unwrap();
        assert_eq!(route.next_hop, ap);
        assert_eq!(topology.interface(route.interface).unwrap().kind, LinkLayerKind::WifiStation);

        let back = topology.route(server, topology.address_of(stas[1]).unwrap()).unwrap();
        assert_eq!(back.next_hop, ap);

        let hop = topology.route(ap, server_addr).unwrap();
        assert_eq!(hop.next_hop, server);
        assert_eq!(topology.interface(hop.interface).unwrap().kind, LinkLayerKind::PointToPoint);

        let unknown = Ipv4Addr::new(172, 16, 0, 1);
        assert_eq!(topology.route(stas[0], unknown), Err(SimError::NoRoute { from: stas[0], destination: unknown }));
    }

    #[test]
    fn stations_do_not_forward() {
        // Server hangs off a station instead of the AP: the other station cannot reach it.
        let mut topology = Topology::new();
        let ap = topology.add_node(NodeRole::AccessPoint);
        let a = topology.add_node(NodeRole::Station);
        let b = topology.add_node(NodeRole::Station);
        let server = topology.add_node(NodeRole::Server);
        topology.add_wireless_link(prefix("192.168.0.0/24"), &[ap, a, b]).unwrap();
        topology
            .add_wired_link(prefix("10.1.1.0/24"), a, server, DataRate::from_mbps(10), Duration::from_millis(1))
            .unwrap();
        topology.assign_addresses().unwrap();

        let server_addr = topology.address_of(server).unwrap();
        assert!(topology.route(a, server_addr).is_ok());
        assert!(matches!(topology.route(b, server_addr), Err(SimError::NoRoute { .. })));
        assert!(topology.owns_address(server, server_addr));
        assert_eq!(topology.nodes_with_role(NodeRole::Station), vec![a, b]);
    }
}
