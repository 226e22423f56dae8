//! Simulation core.
//!
//! [`Simulation`] owns every component of one run: the clock, the single
//! seeded random source, the topology, node motion, the shared medium, the
//! transport endpoints and the flow statistics. Components never call each
//! other directly; they schedule [`SimEvent`]s and the dispatch loop routes
//! each event to its owner.
//!
//! ## Module Organization
//!
//! - `event_queue`: time-ordered event queue with cancellation
//! - `rng`: seeded random source and configurable random variables

pub mod event_queue;
pub mod rng;


use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{MobilityConfig, ScenarioConfig, TopologyConfig, TrafficConfig, WifiConfig};
use crate::error::{SimError, SimResult};
use crate::flow_stats::{FlowRecord, FlowStatsCollector};
use crate::mobility::MobilityEngine;
use crate::mobility::geometry::Point;
use crate::network::{FrameId, InterfaceId, MacContext, MediumAccess, MediumCounters, NodeId, NodeRole, Packet, Topology};
use crate::transport::{AppId, AppReport, Delivery, Outgoing, SinkReport, TransportContext, TransportLayer};

pub use event_queue::{EventHandle, EventQueue};
pub use rng::{RandomVariable, SimRng};

/// Every kind of event the simulation schedules.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// A random walker reached a wall or the end of its leg.
    MobilityRefresh { node: NodeId },
    /// Backoff of the head-of-line frame on a wireless interface expired.
    ChannelAccess { interface: InterfaceId },
    TransmissionEnd { frame: FrameId },
    /// A packet reached the IP layer of `node`.
    PacketArrival { node: NodeId, packet: Packet },
    AppStart { app: AppId },
    AppSend { app: AppId },
    AppStop { app: AppId },
    RetransmitTimeout { app: AppId },
}

type DeliveryObserver = Box<dyn FnMut(&Delivery)>;

pub struct Simulation {
    clock: EventQueue<SimEvent>,
    rng: SimRng,
    topology: Topology,
    mobility: MobilityEngine,
    medium: MediumAccess,
    transport: TransportLayer,
    flows: FlowStatsCollector,
    refresh_events: BTreeMap<NodeId, EventHandle>,
    delivery_observer: Option<DeliveryObserver>,
}

impl Simulation {
    /// Build the standard cell: servers, one access point and the stations.
    ///
    /// Servers get the lowest node ids, then the access point, then the
    /// stations. All stations and the access point share one wireless link;
    /// every server hangs off the access point on its own wired link.
    /// Addresses are assigned and station mobility installed before
    /// returning.
    ///
    /// # Parameters
    ///
    /// * `config` - Topology description
    /// * `seed` - Seed of the run's random source
    ///
    /// # Returns
    ///
    /// A simulation at time zero, ready for `attach_traffic`.
    pub fn build_topology(config: &TopologyConfig, seed: u64) -> SimResult<Self> {
        config.validate()?;
        let mut topology = Topology::new();
        let servers: Vec<NodeId> = (0..config.server_count).map(|_| topology.add_node(NodeRole::Server)).collect();
        let access_point = topology.add_node(NodeRole::AccessPoint);
        let stations: Vec<NodeId> = (0..config.station_count).map(|_| topology.add_node(NodeRole::Station)).collect();

        let mut cell = Vec::with_capacity(stations.len() + 1);
        cell.push(access_point);
        cell.extend_from_slice(&stations);
        topology.add_wireless_link(config.wireless_prefix, &cell)?;
        for &server in &servers {
            topology.add_wired_link_with_queue(config.wired_prefix, access_point, server, config.link_capacity, config.link_delay, config.wired_queue_limit)?;
        }
        topology.assign_addresses()?;

        let mut simulation = Self::new(topology, config.wifi.clone(), seed)?;
        simulation.set_position(access_point, config.access_point_position)?;
        simulation.install_mobility(&stations, &config.mobility)?;
        log::info!(
            "Built cell with {} stations and {} servers ({} mobility, seed {})",
            stations.len(),
            servers.len(),
            config.mobility.model_name(),
            seed
        );
        Ok(simulation)
    }

    /// Wrap a hand-built topology. Every node starts fixed at the origin.
    pub fn new(topology: Topology, wifi: WifiConfig, seed: u64) -> SimResult<Self> {
        wifi.validate()?;
        let medium = MediumAccess::new(&topology, wifi);
        let mut mobility = MobilityEngine::new();
        for node in topology.nodes() {
            mobility.set_fixed(node.id, Point::ORIGIN);
        }
        Ok(Self {
            clock: EventQueue::new(),
            rng: SimRng::new(seed),
            topology,
            mobility,
            medium,
            transport: TransportLayer::new(),
            flows: FlowStatsCollector::new(),
            refresh_events: BTreeMap::new(),
            delivery_observer: None,
        })
    }

    /// Build a scenario and attach its traffic groups.
    pub fn from_scenario(scenario: &ScenarioConfig) -> SimResult<Self> {
        scenario.validate()?;
        let mut simulation = Self::build_topology(&scenario.topology, scenario.seed)?;
        let stations = simulation.stations();
        for group in &scenario.traffic {
            for index in group.stations.indices(stations.len()) {
                simulation.attach_traffic(stations[index], group.traffic.clone())?;
            }
        }
        Ok(simulation)
    }

    /// Pin `node` at `position`, replacing any motion model.
    pub fn set_position(&mut self, node: NodeId, position: Point) -> SimResult<()> {
        self.topology.node(node)?;
        self.cancel_refresh(node);
        self.mobility.set_fixed(node, position);
        Ok(())
    }

    pub fn install_mobility(&mut self, nodes: &[NodeId], config: &MobilityConfig) -> SimResult<()> {
        for &node in nodes {
            self.topology.node(node)?;
        }
        let refreshes = self.mobility.install(nodes, config, &mut self.rng, self.clock.now())?;
        for &node in nodes {
            self.cancel_refresh(node);
        }
        for (node, at) in refreshes {
            let handle = self.clock.schedule(at, SimEvent::MobilityRefresh { node })?;
            self.refresh_events.insert(node, handle);
        }
        Ok(())
    }

    fn cancel_refresh(&mut self, node: NodeId) {
        if let Some(handle) = self.refresh_events.remove(&node) {
            self.clock.cancel(handle);
        }
    }

    pub fn attach_traffic(&mut self, node: NodeId, config: TrafficConfig) -> SimResult<AppId> {
        self.transport.attach(&mut self.clock, &self.topology, node, config)
    }

    /// Observe every in-order application delivery.
    pub fn on_delivery(&mut self, observer: impl FnMut(&Delivery) + 'static) {
        self.delivery_observer = Some(Box::new(observer));
    }

    /// Dispatch every event scheduled before `stop`.
    ///
    /// Returns the number of events dispatched. The clock stays at the last
    /// dispatched event; it is not advanced to `stop` when the queue drains.
    pub fn run(&mut self, stop: Duration) -> SimResult<usize> {
        log::info!("Running from {:?} until {:?} ({} events queued)", self.clock.now(), stop, self.clock.len());
        let mut dispatched = 0;
        while let Some((_, event)) = self.clock.pop_before(stop) {
            self.dispatch(event)?;
            dispatched += 1;
        }
        log::info!("Stopped at {:?} after {} events, {} flows observed", self.clock.now(), dispatched, self.flows.len());
        Ok(dispatched)
    }

    fn dispatch(&mut self, event: SimEvent) -> SimResult<()> {
        match event {
            SimEvent::MobilityRefresh { node } => {
                self.refresh_events.remove(&node);
                if let Some(next) = self.mobility.refresh(node, self.clock.now(), &mut self.rng) {
                    let handle = self.clock.schedule(next, SimEvent::MobilityRefresh { node })?;
                    self.refresh_events.insert(node, handle);
                }
            }
            SimEvent::ChannelAccess { interface } => {
                let (medium, mut ctx) = self.mac();
                medium.on_channel_access(&mut ctx, interface);
            }
            SimEvent::TransmissionEnd { frame } => {
                let (medium, mut ctx) = self.mac();
                medium.on_transmission_end(&mut ctx, frame);
            }
            SimEvent::PacketArrival { node, packet } => self.on_arrival(node, packet)?,
            SimEvent::AppStart { app } => {
                let (transport, mut ctx) = self.transport();
                transport.on_app_start(&mut ctx, app)?;
            }
            SimEvent::AppSend { app } => {
                let (transport, mut ctx) = self.transport();
                transport.on_app_send(&mut ctx, app)?;
            }
            SimEvent::AppStop { app } => {
                let (transport, mut ctx) = self.transport();
                transport.on_app_stop(&mut ctx, app)?;
            }
            SimEvent::RetransmitTimeout { app } => {
                let (transport, mut ctx) = self.transport();
                transport.on_retransmit_timeout(&mut ctx, app)?;
            }
        }
        self.flush();
        Ok(())
    }

    fn mac(&mut self) -> (&mut MediumAccess, MacContext<'_>) {
        (
            &mut self.medium,
            MacContext {
                clock: &mut self.clock,
                rng: &mut self.rng,
                flows: &mut self.flows,
                topology: &self.topology,
                mobility: &self.mobility,
            },
        )
    }

    fn transport(&mut self) -> (&mut TransportLayer, TransportContext<'_>) {
        (
            &mut self.transport,
            TransportContext {
                clock: &mut self.clock,
                rng: &mut self.rng,
                flows: &mut self.flows,
            },
        )
    }

    /// IP input: local delivery, forwarding, or drop.
    fn on_arrival(&mut self, node: NodeId, packet: Packet) -> SimResult<()> {
        if self.topology.owns_address(node, packet.flow.destination) {
            self.flows.on_receive(packet.flow, packet.wire_size(), packet.sent_at, self.clock.now());
            let (transport, mut ctx) = self.transport();
            transport.on_packet(&mut ctx, node, packet)?;
        } else if self.topology.node(node)?.role.forwards() {
            self.forward(node, packet);
        } else {
            log::trace!("Node {} is not a router: dropping packet {} for {}", node, packet.uid, packet.flow.destination);
            self.flows.on_loss(packet.flow, packet.wire_size());
        }
        Ok(())
    }

    fn forward(&mut self, node: NodeId, packet: Packet) {
        match self.topology.route(node, packet.flow.destination) {
            Ok(route) => {
                let (medium, mut ctx) = self.mac();
                medium.transmit(&mut ctx, route.interface, route.next_hop, packet);
            }
            Err(err) => {
                log::warn!("Dropping packet {} of flow {}: {}", packet.uid, packet.flow, err);
                self.flows.on_loss(packet.flow, packet.wire_size());
            }
        }
    }

    /// Originate everything the transport queued and report deliveries.
    fn flush(&mut self) {
        for Outgoing { node, packet } in self.transport.take_outbox() {
            self.flows.on_send(packet.flow, packet.wire_size(), self.clock.now());
            self.forward(node, packet);
        }
        let deliveries = self.transport.take_deliveries();
        if let Some(observer) = self.delivery_observer.as_mut() {
            for delivery in &deliveries {
                observer(delivery);
            }
        }
    }

    /// Owned copy of every flow record with derived metrics.
    pub fn export_stats(&self) -> Vec<FlowRecord> {
        self.flows.snapshot()
    }

    /// Tear the run down and return the final flow records.
    pub fn finish(self) -> Vec<FlowRecord> {
        let records = self.flows.snapshot();
        log::info!(
            "Simulation finished at {:?}: {} flows, {} events dispatched, {} still queued",
            self.clock.now(),
            records.len(),
            self.clock.dispatched(),
            self.clock.len()
        );
        records
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn flow_stats(&self) -> &FlowStatsCollector {
        &self.flows
    }

    pub fn pending_events(&self) -> usize {
        self.clock.len()
    }

    /// Position of `node` at the current time.
    pub fn position_of(&self, node: NodeId) -> SimResult<Point> {
        self.mobility.position_at(node, self.clock.now())
    }

    pub fn medium_counters(&self) -> MediumCounters {
        self.medium.counters()
    }

    pub fn app_report(&self, app: AppId) -> SimResult<AppReport> {
        self.transport.report(app)
    }

    pub fn app_reports(&self) -> Vec<AppReport> {
        self.transport.reports()
    }

    pub fn sink_reports(&self) -> Vec<SinkReport> {
        self.transport.sink_reports()
    }

    /// The first access point of the topology.
    pub fn access_point(&self) -> SimResult<NodeId> {
        self.topology
            .nodes_with_role(NodeRole::AccessPoint)
            .first()
            .copied()
            .ok_or_else(|| SimError::InvalidConfig("topology has no access point".to_string()))
    }

    pub fn servers(&self) -> Vec<NodeId> {
        self.topology.nodes_with_role(NodeRole::Server)
    }

    pub fn stations(&self) -> Vec<NodeId> {
        self.topology.nodes_with_role(NodeRole::Station)
    }
}
