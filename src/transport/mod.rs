//! Transport endpoints: traffic applications on the sending side and sinks on
//! the receiving side.
//!
//! The transport layer never touches the network directly. Packets it wants
//! to originate go to an outbox that the simulation drains after every event,
//! and data delivered in order is queued as [`Delivery`] records.

pub mod datagram;
pub mod generator;
pub mod stream;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::{TrafficConfig, TrafficMode};
use crate::error::{SimError, SimResult};
use crate::flow_stats::{FiveTuple, FlowStatsCollector};
use crate::network::{EchoKind, NodeId, NodeRole, Packet, PacketBody, Protocol, Topology};
use crate::simulation::event_queue::{EventHandle, EventQueue};
use crate::simulation::{SimEvent, SimRng};

pub use datagram::DatagramSender;
pub use generator::{GeneratorStep, TrafficGenerator};
pub use stream::{StreamReceiver, StreamSender, TimeoutOutcome};

/// First ephemeral source port handed out on every node.
pub const FIRST_EPHEMERAL_PORT: u16 = 49153;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AppId(pub usize);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app{}", self.0)
    }
}

/// Simulation state the transport layer needs for one call.
pub struct TransportContext<'a> {
    pub clock: &'a mut EventQueue<SimEvent>,
    pub rng: &'a mut SimRng,
    pub flows: &'a mut FlowStatsCollector,
}

/// A packet waiting to be handed to the IP layer of `node`.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub node: NodeId,
    pub packet: Packet,
}

/// Application data handed up in order at the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub node: NodeId,
    pub flow: FiveTuple,
    /// Datagram sequence number, or byte offset within a stream.
    pub position: u64,
    pub bytes: u64,
    pub time: Duration,
}

/// Sender-side totals of one application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppReport {
    pub app: AppId,
    pub node: NodeId,
    pub flow: FiveTuple,
    /// Data packets originated, retransmissions included.
    pub packets_sent: u64,
    /// Application bytes handed to the transport.
    pub bytes_written: u64,
    pub bytes_acked: u64,
    pub retransmissions: u64,
    pub timeouts: u64,
    pub echo_replies: u64,
    #[serde(serialize_with = "crate::config::serde_secs::option::serialize")]
    pub mean_echo_rtt: Option<Duration>,
    #[serde(serialize_with = "crate::config::serde_secs::option::serialize")]
    pub smoothed_rtt: Option<Duration>,
    pub stalled: bool,
    pub finished: bool,
}

/// Receiver-side totals of one listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    pub node: NodeId,
    pub address: Ipv4Addr,
    pub protocol: Protocol,
    pub port: u16,
    pub packets_received: u64,
    /// Bytes delivered to the application, in order for streams.
    pub bytes_received: u64,
    pub echo_replies_sent: u64,
}

enum Endpoint {
    Datagram(DatagramSender),
    Stream(StreamSender),
}

struct App {
    node: NodeId,
    flow: FiveTuple,
    config: TrafficConfig,
    generator: TrafficGenerator,
    endpoint: Endpoint,
    send_event: Option<EventHandle>,
    rto_event: Option<EventHandle>,
    stopped: bool,
    packets_sent: u64,
    bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SinkKey {
    address: Ipv4Addr,
    protocol: Protocol,
    port: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct SinkCounters {
    packets: u64,
    bytes: u64,
    echo_replies: u64,
}

/// Every application and sink of the simulation.
#[derive(Default)]
pub struct TransportLayer {
    apps: Vec<App>,
    by_flow: HashMap<FiveTuple, AppId>,
    sinks: BTreeMap<SinkKey, (NodeId, SinkCounters)>,
    receivers: HashMap<FiveTuple, StreamReceiver>,
    next_port: BTreeMap<NodeId, u16>,
    next_uid: u64,
    outbox: Vec<Outgoing>,
    deliveries: Vec<Delivery>,
}

impl TransportLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// Install a traffic application on `node`.
    ///
    /// The destination defaults to the first server. Start and stop events
    /// are scheduled right away, so addresses must already be assigned.
    pub fn attach(&mut self, clock: &mut EventQueue<SimEvent>, topology: &Topology, node: NodeId, config: TrafficConfig) -> SimResult<AppId> {
        config.validate()?;
        topology.node(node)?;
        let destination = match config.destination {
            Some(destination) => destination,
            None => topology
                .nodes_with_role(NodeRole::Server)
                .first()
                .copied()
                .ok_or_else(|| SimError::InvalidConfig("no server to send to".to_string()))?,
        };
        topology.node(destination)?;
        let source_address = topology.address_of(node).ok_or(SimError::AddressesNotAssigned)?;
        let destination_address = topology.address_of(destination).ok_or(SimError::AddressesNotAssigned)?;

        let id = AppId(self.apps.len());
        clock.schedule(config.start, SimEvent::AppStart { app: id })?;
        if let Some(stop) = config.stop {
            clock.schedule(stop, SimEvent::AppStop { app: id })?;
        }

        let flow = FiveTuple {
            source: source_address,
            destination: destination_address,
            protocol: config.protocol,
            source_port: self.allocate_port(node),
            destination_port: config.destination_port(),
        };
        let endpoint = match (&config.protocol, &config.mode) {
            (Protocol::Datagram, TrafficMode::FixedCount { echo, .. }) => Endpoint::Datagram(DatagramSender::new(*echo)),
            (Protocol::Datagram, _) => Endpoint::Datagram(DatagramSender::new(false)),
            (Protocol::Stream, _) => Endpoint::Stream(StreamSender::new(config.packet_size)),
        };
        log::debug!("Attached {} on node {}: {} to node {} ({:?})", id, node, flow, destination, config.mode);
        self.by_flow.insert(flow, id);
        self.apps.push(App {
            node,
            flow,
            generator: TrafficGenerator::new(&config),
            config,
            endpoint,
            send_event: None,
            rto_event: None,
            stopped: false,
            packets_sent: 0,
            bytes_written: 0,
        });
        Ok(id)
    }

    fn allocate_port(&mut self, node: NodeId) -> u16 {
        let next = self.next_port.entry(node).or_insert(FIRST_EPHEMERAL_PORT);
        let port = *next;
        *next = next.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        port
    }

    fn app_mut(&mut self, app: AppId) -> SimResult<&mut App> {
        self.apps.get_mut(app.0).ok_or(SimError::UnknownApp(app.0))
    }

    fn packet(&mut self, flow: FiveTuple, payload_size: usize, sent_at: Duration, body: PacketBody) -> Packet {
        let uid = self.next_uid;
        self.next_uid += 1;
        Packet {
            uid,
            flow,
            payload_size,
            sent_at,
            body,
        }
    }

    pub fn on_app_start(&mut self, ctx: &mut TransportContext, app: AppId) -> SimResult<()> {
        let now = ctx.clock.now();
        let state = self.app_mut(app)?;
        // An empty [start, stop) window never sends.
        if state.config.stop.is_some_and(|stop| now >= stop) {
            state.stopped = true;
            log::debug!("{} on node {} has an empty active window at {:?}", app, state.node, now);
            return Ok(());
        }
        log::debug!("{} on node {} starts at {:?}", app, state.node, now);
        self.on_app_send(ctx, app)
    }

    pub fn on_app_send(&mut self, ctx: &mut TransportContext, app: AppId) -> SimResult<()> {
        let now = ctx.clock.now();
        let state = self.app_mut(app)?;
        state.send_event = None;
        if state.stopped {
            return Ok(());
        }
        let mut datagram = None;
        let next = match state.generator.step(now, ctx.rng) {
            GeneratorStep::Send { bytes, next } => {
                state.bytes_written += bytes as u64;
                match &mut state.endpoint {
                    Endpoint::Datagram(sender) => {
                        state.packets_sent += 1;
                        datagram = Some((state.node, state.flow, bytes, sender.next_body(now)));
                    }
                    Endpoint::Stream(sender) => sender.write(bytes),
                }
                next
            }
            GeneratorStep::Idle { next } => Some(next),
            GeneratorStep::Unlimited => {
                if let Endpoint::Stream(sender) = &mut state.endpoint {
                    sender.set_unlimited(true);
                }
                None
            }
            GeneratorStep::Done => None,
        };
        let stop = state.config.stop;
        if let Some((node, flow, bytes, body)) = datagram {
            let packet = self.packet(flow, bytes, now, body);
            self.outbox.push(Outgoing { node, packet });
        }
        self.pump(ctx, app)?;
        if let Some(next) = next.filter(|next| stop.is_none_or(|stop| *next < stop)) {
            let handle = ctx.clock.schedule(next, SimEvent::AppSend { app })?;
            self.app_mut(app)?.send_event = Some(handle);
        }
        Ok(())
    }

    /// Stop generating. A stream keeps retransmitting what it already sent.
    pub fn on_app_stop(&mut self, ctx: &mut TransportContext, app: AppId) -> SimResult<()> {
        let state = self.app_mut(app)?;
        state.stopped = true;
        if let Some(handle) = state.send_event.take() {
            ctx.clock.cancel(handle);
        }
        if let Endpoint::Stream(sender) = &mut state.endpoint {
            sender.close();
        }
        log::debug!("{} on node {} stops at {:?}", app, state.node, ctx.clock.now());
        Ok(())
    }

    pub fn on_retransmit_timeout(&mut self, ctx: &mut TransportContext, app: AppId) -> SimResult<()> {
        let state = self.app_mut(app)?;
        state.rto_event = None;
        let Endpoint::Stream(sender) = &mut state.endpoint else {
            return Ok(());
        };
        match sender.on_timeout() {
            TimeoutOutcome::Idle => Ok(()),
            TimeoutOutcome::Retransmit => {
                log::trace!("{} retransmission timeout, rto now {:?}", app, sender.rto());
                self.pump(ctx, app)
            }
            TimeoutOutcome::Stalled => {
                log::warn!("{} stalled after repeated retransmission timeouts: {}", app, state.flow);
                ctx.flows.on_stall(state.flow);
                Ok(())
            }
        }
    }

    /// Send what the stream window allows and keep the retransmission timer armed.
    fn pump(&mut self, ctx: &mut TransportContext, app: AppId) -> SimResult<()> {
        let now = ctx.clock.now();
        let state = self.app_mut(app)?;
        let Endpoint::Stream(sender) = &mut state.endpoint else {
            return Ok(());
        };
        let segments = sender.next_segments(now);
        let outstanding = sender.has_outstanding();
        let rto = sender.rto();
        let (node, flow) = (state.node, state.flow);
        state.packets_sent += segments.len() as u64;
        if outstanding && state.rto_event.is_none() {
            state.rto_event = Some(ctx.clock.schedule_in(rto, SimEvent::RetransmitTimeout { app }));
        }
        for (offset, length) in segments {
            self.send_segment(node, flow, offset, length, now);
        }
        Ok(())
    }

    fn send_segment(&mut self, node: NodeId, flow: FiveTuple, offset: u64, length: u32, now: Duration) {
        let packet = self.packet(flow, length as usize, now, PacketBody::Segment { offset, length });
        self.outbox.push(Outgoing { node, packet });
    }

    fn restart_timer(&mut self, ctx: &mut TransportContext, app: AppId) -> SimResult<()> {
        let state = self.app_mut(app)?;
        if let Some(handle) = state.rto_event.take() {
            ctx.clock.cancel(handle);
        }
        if let Endpoint::Stream(sender) = &state.endpoint {
            if sender.has_outstanding() && !sender.is_stalled() {
                state.rto_event = Some(ctx.clock.schedule_in(sender.rto(), SimEvent::RetransmitTimeout { app }));
            }
        }
        Ok(())
    }

    /// Hand a packet that reached its destination node to the transport layer.
    pub fn on_packet(&mut self, ctx: &mut TransportContext, node: NodeId, packet: Packet) -> SimResult<()> {
        let now = ctx.clock.now();
        match packet.body {
            PacketBody::Datagram { sequence, echo: EchoKind::Reply } => {
                let Some(&app) = self.by_flow.get(&packet.flow.reversed()) else {
                    log::trace!("Echo reply for unknown flow {} dropped", packet.flow);
                    return Ok(());
                };
                if let Endpoint::Datagram(sender) = &mut self.app_mut(app)?.endpoint {
                    sender.on_reply(sequence, now);
                }
                self.deliver(node, packet.flow, sequence, packet.payload_size as u64, now);
            }
            PacketBody::Datagram { sequence, echo } => {
                let counters = self.sink(node, &packet.flow);
                counters.packets += 1;
                counters.bytes += packet.payload_size as u64;
                if echo == EchoKind::Request {
                    counters.echo_replies += 1;
                    let uid = self.next_uid;
                    self.next_uid += 1;
                    if let Some(reply) = datagram::echo_reply(&packet, uid, now) {
                        self.outbox.push(Outgoing { node, packet: reply });
                    }
                }
                self.deliver(node, packet.flow, sequence, packet.payload_size as u64, now);
            }
            PacketBody::Segment { offset, length } => {
                self.sink(node, &packet.flow).packets += 1;
                let outcome = self.receivers.entry(packet.flow).or_default().on_segment(offset, length);
                let ack = self.packet(packet.flow.reversed(), 0, now, PacketBody::Ack { next_expected: outcome.ack });
                self.outbox.push(Outgoing { node, packet: ack });
                for (position, bytes) in outcome.delivered {
                    self.sink(node, &packet.flow).bytes += bytes;
                    self.deliver(node, packet.flow, position, bytes, now);
                }
            }
            PacketBody::Ack { next_expected } => {
                let Some(&app) = self.by_flow.get(&packet.flow.reversed()) else {
                    log::trace!("Ack for unknown flow {} dropped", packet.flow);
                    return Ok(());
                };
                let state = self.app_mut(app)?;
                let Endpoint::Stream(sender) = &mut state.endpoint else {
                    return Ok(());
                };
                let outcome = sender.on_ack(next_expected, now);
                let (node, flow) = (state.node, state.flow);
                if let Some((offset, length)) = outcome.retransmit {
                    state.packets_sent += 1;
                    self.send_segment(node, flow, offset, length, now);
                }
                if outcome.newly_acked > 0 || outcome.retransmit.is_some() {
                    self.restart_timer(ctx, app)?;
                }
                self.pump(ctx, app)?;
            }
        }
        Ok(())
    }

    fn sink(&mut self, node: NodeId, flow: &FiveTuple) -> &mut SinkCounters {
        let key = SinkKey {
            address: flow.destination,
            protocol: flow.protocol,
            port: flow.destination_port,
        };
        &mut self.sinks.entry(key).or_insert_with(|| (node, SinkCounters::default())).1
    }

    fn deliver(&mut self, node: NodeId, flow: FiveTuple, position: u64, bytes: u64, time: Duration) {
        self.deliveries.push(Delivery {
            node,
            flow,
            position,
            bytes,
            time,
        });
    }

    /// Packets queued for the IP layer since the last call.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    pub fn report(&self, app: AppId) -> SimResult<AppReport> {
        let state = self.apps.get(app.0).ok_or(SimError::UnknownApp(app.0))?;
        let mut report = AppReport {
            app,
            node: state.node,
            flow: state.flow,
            packets_sent: state.packets_sent,
            bytes_written: state.bytes_written,
            bytes_acked: 0,
            retransmissions: 0,
            timeouts: 0,
            echo_replies: 0,
            mean_echo_rtt: None,
            smoothed_rtt: None,
            stalled: false,
            finished: false,
        };
        match &state.endpoint {
            Endpoint::Datagram(sender) => {
                report.echo_replies = sender.replies();
                report.mean_echo_rtt = sender.mean_rtt();
                report.finished = state.stopped || matches!(state.config.mode, TrafficMode::FixedCount { count, .. } if state.generator.sent() >= count);
            }
            Endpoint::Stream(sender) => {
                report.bytes_acked = sender.bytes_acked();
                report.retransmissions = sender.retransmissions();
                report.timeouts = sender.timeouts();
                report.smoothed_rtt = sender.smoothed_rtt();
                report.stalled = sender.is_stalled();
                report.finished = sender.is_finished();
            }
        }
        Ok(report)
    }

    pub fn reports(&self) -> Vec<AppReport> {
        (0..self.apps.len()).filter_map(|i| self.report(AppId(i)).ok()).collect()
    }

    /// Every port that received traffic, ordered by address, protocol and port.
    pub fn sink_reports(&self) -> Vec<SinkReport> {
        self.sinks
            .iter()
            .map(|(key, (node, counters))| SinkReport {
                node: *node,
                address: key.address,
                protocol: key.protocol,
                port: key.port,
                packets_received: counters.packets,
                bytes_received: counters.bytes,
                echo_replies_sent: counters.echo_replies,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataRate;
    use crate::network::Ipv4Prefix;

    struct Bench {
        clock: EventQueue<SimEvent>,
        rng: SimRng,
        flows: FlowStatsCollector,
        topology: Topology,
        transport: TransportLayer,
        station: NodeId,
        server: NodeId,
    }

    impl Bench {
        fn new() -> Self {
            let mut topology = Topology::new();
            let ap = topology.add_node(NodeRole::AccessPoint);
            let station = topology.add_node(NodeRole::Station);
            let server = topology.add_node(NodeRole::Server);
            topology.add_wireless_link("192.168.0.0/24".parse::<Ipv4Prefix>().unwrap(), &[ap, station]).unwrap();
            topology.add_wired_link("10.1.1.0/24".parse::<Ipv4Prefix>().unwrap(), ap, server, DataRate::from_mbps(100), Duration::from_millis(2)).unwrap();
            topology.assign_addresses().unwrap();
            Self {
                clock: EventQueue::new(),
                rng: SimRng::new(1),
                flows: FlowStatsCollector::new(),
                topology,
                transport: TransportLayer::new(),
                station,
                server,
            }
        }

        fn ctx(&mut self) -> (TransportContext<'_>, &mut TransportLayer) {
            (
                TransportContext {
                    clock: &mut self.clock,
                    rng: &mut self.rng,
                    flows: &mut self.flows,
                },
                &mut self.transport,
            )
        }

        fn attach(&mut self, config: TrafficConfig) -> AppId {
            self.transport.attach(&mut self.clock, &self.topology, self.station, config).unwrap()
        }

        fn fire(&mut self, event: SimEvent) {
            let (mut ctx, transport) = self.ctx();
            match event {
                SimEvent::AppStart { app } => transport.on_app_start(&mut ctx, app).unwrap(),
                SimEvent::AppSend { app } => transport.on_app_send(&mut ctx, app).unwrap(),
                SimEvent::AppStop { app } => transport.on_app_stop(&mut ctx, app).unwrap(),
                SimEvent::RetransmitTimeout { app } => transport.on_retransmit_timeout(&mut ctx, app).unwrap(),
                other => panic!("unexpected event {other:?}"),
            }
        }

        fn step(&mut self) -> Option<SimEvent> {
            let (_, event) = self.clock.pop_before(Duration::MAX)?;
            self.fire(event.clone());
            Some(event)
        }
    }

    #[test]
    fn ephemeral_ports_are_per_node() {
        let mut bench = Bench::new();
        let first = bench.attach(TrafficConfig::fixed_count(1, Duration::from_secs(1), Duration::ZERO));
        let second = bench.attach(TrafficConfig::fixed_count(1, Duration::from_secs(1), Duration::ZERO));
        let first = bench.transport.report(first).unwrap();
        let second = bench.transport.report(second).unwrap();
        assert_eq!(first.flow.source_port, FIRST_EPHEMERAL_PORT);
        assert_eq!(second.flow.source_port, FIRST_EPHEMERAL_PORT + 1);
        assert_eq!(first.flow.destination_port, crate::config::DEFAULT_DATAGRAM_PORT);
        assert_eq!(first.flow.destination, bench.topology.address_of(bench.server).unwrap());
    }

    #[test]
    fn attach_rejects_unknown_destination() {
        let mut bench = Bench::new();
        let mut config = TrafficConfig::fixed_count(1, Duration::from_secs(1), Duration::ZERO);
        config.destination = Some(NodeId(42));
        let station = bench.station;
        assert_eq!(bench.transport.attach(&mut bench.clock, &bench.topology, station, config), Err(SimError::UnknownNode(NodeId(42))));
        assert_eq!(bench.transport.report(AppId(0)), Err(SimError::UnknownApp(0)));
    }

    #[test]
    fn fixed_count_app_sends_then_finishes() {
        let mut bench = Bench::new();
        let app = bench.attach(TrafficConfig::fixed_count(3, Duration::from_millis(100), Duration::from_secs(1)));
        while bench.step().is_some() {}
        let outbox = bench.transport.take_outbox();
        assert_eq!(outbox.len(), 3);
        assert!(outbox.iter().all(|o| o.node == bench.station && o.packet.payload_size == 1024));
        assert_eq!(outbox[2].packet.sent_at, Duration::from_millis(1200));
        let report = bench.transport.report(app).unwrap();
        assert_eq!(report.packets_sent, 3);
        assert!(report.finished);
    }

    #[test]
    fn stop_cancels_pending_sends() {
        let mut bench = Bench::new();
        let mut config = TrafficConfig::fixed_count(100, Duration::from_millis(100), Duration::ZERO);
        config.stop = Some(Duration::from_millis(250));
        let app = bench.attach(config);
        while bench.step().is_some() {}
        assert_eq!(bench.transport.take_outbox().len(), 3);
        assert_eq!(bench.transport.report(app).unwrap().packets_sent, 3);
    }

    #[test]
    fn stop_at_start_sends_nothing() {
        for protocol in [Protocol::Datagram, Protocol::Stream] {
            let mut bench = Bench::new();
            let mut config = TrafficConfig::fixed_count(5, Duration::from_millis(100), Duration::from_secs(1));
            config.protocol = protocol;
            config.stop = Some(Duration::from_secs(1));
            let app = bench.attach(config);
            while bench.step().is_some() {}
            assert!(bench.transport.take_outbox().is_empty());
            let report = bench.transport.report(app).unwrap();
            assert_eq!(report.packets_sent, 0);
            assert!(bench.flows.is_empty());
        }
    }

    #[test]
    fn sink_echoes_requests_and_client_counts_replies() {
        let mut bench = Bench::new();
        let mut config = TrafficConfig::fixed_count(1, Duration::from_secs(1), Duration::ZERO);
        config.mode = TrafficMode::FixedCount {
            count: 1,
            interval: Duration::from_secs(1),
            echo: true,
        };
        let app = bench.attach(config);
        bench.step();
        let request = bench.transport.take_outbox().remove(0).packet;
        let server = bench.server;
        let (mut ctx, transport) = bench.ctx();
        transport.on_packet(&mut ctx, server, request).unwrap();
        let reply = transport.take_outbox().remove(0);
        assert_eq!(reply.node, server);
        transport.on_packet(&mut ctx, NodeId(1), reply.packet).unwrap();

        let report = bench.transport.report(app).unwrap();
        assert_eq!(report.echo_replies, 1);
        let sinks = bench.transport.sink_reports();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].packets_received, 1);
        assert_eq!(sinks[0].echo_replies_sent, 1);
        assert_eq!(bench.transport.take_deliveries().len(), 2);
    }

    #[test]
    fn stream_segments_are_acked_and_delivered_in_order() {
        let mut bench = Bench::new();
        let mut config = TrafficConfig::new(Protocol::Stream, TrafficMode::FixedCount {
            count: 1,
            interval: Duration::from_secs(1),
            echo: false,
        });
        config.packet_size = 1000;
        let app = bench.attach(config);
        bench.step();
        let segments = bench.transport.take_outbox();
        assert_eq!(segments.len(), 1);
        assert!(bench.clock.len() >= 1, "retransmission timer armed");

        let server = bench.server;
        let station = bench.station;
        let (mut ctx, transport) = bench.ctx();
        for outgoing in segments {
            transport.on_packet(&mut ctx, server, outgoing.packet).unwrap();
        }
        let acks = transport.take_outbox();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].packet.body, PacketBody::Ack { next_expected: 1000 });
        for outgoing in acks {
            transport.on_packet(&mut ctx, station, outgoing.packet).unwrap();
        }
        let report = bench.transport.report(app).unwrap();
        assert_eq!(report.bytes_acked, 1000);
        assert_eq!(bench.transport.sink_reports()[0].bytes_received, 1000);
        // Nothing outstanding: the timer was cancelled.
        assert!(bench.clock.is_empty());
    }

    #[test]
    fn unanswered_stream_stalls() {
        let mut bench = Bench::new();
        let mut config = TrafficConfig::new(Protocol::Stream, TrafficMode::Bulk);
        config.packet_size = 1000;
        let app = bench.attach(config);
        while bench.step().is_some() {}
        let report = bench.transport.report(app).unwrap();
        assert!(report.stalled);
        assert_eq!(report.timeouts, u64::from(stream::MAX_CONSECUTIVE_TIMEOUTS));
        assert_eq!(report.bytes_acked, 0);
        assert!(bench.flows.record(&report.flow).stalled);
    }
}
