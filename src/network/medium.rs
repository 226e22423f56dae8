//! Medium access: CSMA contention on wireless links, drop-tail wired links.
//!
//! Wireless interfaces keep a MAC queue. The head-of-line frame waits DIFS plus
//! a random backoff, senses the medium and either transmits or defers until the
//! medium is idle again. A reservation only becomes audible one slot after it
//! starts, so two stations whose backoffs end within the same slot both
//! transmit and collide. Collided frames are lost; retrying is left to the
//! transport layer.
//!
//! Wired interfaces serialize frames one after another at the link capacity and
//! deliver them after the propagation delay. A full device queue drops the
//! packet.
//!
//! Every loss is reported to the flow statistics.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use super::airtime::{DIFS, SLOT_TIME, calculate_air_time};
use super::packet::Packet;
use super::topology::{InterfaceId, LinkId, LinkKind, NodeId, Topology};
use crate::config::{DataRate, WifiConfig};
use crate::flow_stats::FlowStatsCollector;
use crate::mobility::MobilityEngine;
use crate::mobility::geometry::{Point, distance};
use crate::simulation::event_queue::{EventHandle, EventQueue};
use crate::simulation::{SimEvent, SimRng};

const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Identifier of a frame on the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

/// Everything the MAC needs from the rest of the simulation for one call.
pub struct MacContext<'a> {
    pub clock: &'a mut EventQueue<SimEvent>,
    pub rng: &'a mut SimRng,
    pub flows: &'a mut FlowStatsCollector,
    pub topology: &'a Topology,
    pub mobility: &'a MobilityEngine,
}

/// Link-layer totals over the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediumCounters {
    /// Frames that started transmission (wireless) or serialization (wired).
    pub frames_transmitted: u64,
    pub frames_delivered: u64,
    /// Wireless frames destroyed by an overlapping transmission.
    pub collisions: u64,
    /// Wireless frames whose receiver was out of range.
    pub out_of_range: u64,
    /// Packets dropped because a device queue was full.
    pub queue_drops: u64,
}

struct QueuedFrame {
    next_hop: NodeId,
    packet: Packet,
}

struct WifiDevice {
    link: LinkId,
    queue: VecDeque<QueuedFrame>,
    /// Pending channel access attempt.
    access: Option<EventHandle>,
    transmitting: bool,
}

struct WiredDevice {
    capacity: DataRate,
    delay: Duration,
    queue_limit: usize,
    busy_until: Duration,
    /// Departure times of packets still in the device.
    departures: VecDeque<Duration>,
}

enum Device {
    Wifi(WifiDevice),
    Wired(WiredDevice),
}

struct Reservation {
    frame: FrameId,
    start: Duration,
    end: Duration,
}

struct Frame {
    interface: InterfaceId,
    sender: NodeId,
    next_hop: NodeId,
    packet: Packet,
    collided: bool,
}

pub struct MediumAccess {
    wifi: WifiConfig,
    devices: Vec<Device>,
    /// Active reservations per wireless link, in start order.
    reservations: BTreeMap<LinkId, Vec<Reservation>>,
    in_flight: BTreeMap<FrameId, Frame>,
    next_frame: u64,
    counters: MediumCounters,
}

impl MediumAccess {
    /// Create one device per interface of `topology`.
    pub fn new(topology: &Topology, wifi: WifiConfig) -> Self {
        let mut reservations = BTreeMap::new();
        let devices = topology
            .interfaces()
            .iter()
            .map(|interface| match topology.link(interface.link).map(|link| link.kind) {
                Some(LinkKind::Wired { capacity, delay, queue_limit }) => Device::Wired(WiredDevice {
                    capacity,
                    delay,
                    queue_limit,
                    busy_until: Duration::ZERO,
                    departures: VecDeque::new(),
                }),
                _ => {
                    reservations.entry(interface.link).or_insert_with(Vec::new);
                    Device::Wifi(WifiDevice {
                        link: interface.link,
                        queue: VecDeque::new(),
                        access: None,
                        transmitting: false,
                    })
                }
            })
            .collect();
        Self {
            wifi,
            devices,
            reservations,
            in_flight: BTreeMap::new(),
            next_frame: 0,
            counters: MediumCounters::default(),
        }
    }

    pub fn wifi(&self) -> &WifiConfig {
        &self.wifi
    }

    pub fn counters(&self) -> MediumCounters {
        self.counters
    }

    /// Number of frames waiting in the MAC queue of a wireless interface.
    pub fn queue_len(&self, interface: InterfaceId) -> usize {
        match self.devices.get(interface.0) {
            Some(Device::Wifi(device)) => device.queue.len(),
            Some(Device::Wired(device)) => device.departures.len(),
            None => 0,
        }
    }

    /// Hand `packet` to `interface` for delivery to the neighbor `next_hop`.
    pub fn transmit(&mut self, ctx: &mut MacContext, interface: InterfaceId, next_hop: NodeId, packet: Packet) {
        let now = ctx.clock.now();
        match self.devices.get_mut(interface.0) {
            Some(Device::Wired(device)) => {
                while device.departures.front().is_some_and(|&departure| departure <= now) {
                    device.departures.pop_front();
                }
                if device.departures.len() >= device.queue_limit {
                    self.counters.queue_drops += 1;
                    log::trace!("Wired queue full on interface {:?}: dropping packet {}", interface, packet.uid);
                    ctx.flows.on_loss(packet.flow, packet.wire_size());
                    return;
                }
                let start = device.busy_until.max(now);
                let done = start + device.capacity.transmission_time(packet.wire_size());
                device.busy_until = done;
                device.departures.push_back(done);
                self.counters.frames_transmitted += 1;
                self.counters.frames_delivered += 1;
                ctx.clock.schedule_in(done - now + device.delay, SimEvent::PacketArrival { node: next_hop, packet });
            }
            Some(Device::Wifi(device)) => {
                if device.queue.len() >= self.wifi.queue_limit {
                    self.counters.queue_drops += 1;
                    log::trace!("MAC queue full on interface {:?}: dropping packet {}", interface, packet.uid);
                    ctx.flows.on_loss(packet.flow, packet.wire_size());
                    return;
                }
                device.queue.push_back(QueuedFrame { next_hop, packet });
                if device.access.is_none() && !device.transmitting {
                    self.schedule_access(ctx, interface, now);
                }
            }
            None => {
                log::warn!("Transmit on unknown interface {:?}: dropping packet {}", interface, packet.uid);
                ctx.flows.on_loss(packet.flow, packet.wire_size());
            }
        }
    }

    /// Schedule a channel access attempt after `idle_from` + DIFS + backoff.
    fn schedule_access(&mut self, ctx: &mut MacContext, interface: InterfaceId, idle_from: Duration) {
        let backoff = SLOT_TIME * ctx.rng.below(self.wifi.contention_window);
        let at = idle_from.max(ctx.clock.now()) + DIFS + backoff;
        let handle = ctx.clock.schedule_in(at - ctx.clock.now(), SimEvent::ChannelAccess { interface });
        if let Some(Device::Wifi(device)) = self.devices.get_mut(interface.0) {
            device.access = Some(handle);
        }
    }

    /// Backoff of `interface` expired: transmit the head-of-line frame or defer.
    pub fn on_channel_access(&mut self, ctx: &mut MacContext, interface: InterfaceId) {
        let now = ctx.clock.now();
        let Some(Device::Wifi(device)) = self.devices.get_mut(interface.0) else {
            return;
        };
        device.access = None;
        let link = device.link;
        let Some(QueuedFrame { next_hop, packet }) = device.queue.pop_front() else {
            return;
        };

        let reservations = self.reservations.entry(link).or_default();
        // Reservations that started at least a slot ago are audible.
        let busy_until = reservations
            .iter()
            .filter(|r| r.end > now && r.start + SLOT_TIME <= now)
            .map(|r| r.end)
            .max();
        if let Some(busy_until) = busy_until {
            if let Some(Device::Wifi(device)) = self.devices.get_mut(interface.0) {
                device.queue.push_front(QueuedFrame { next_hop, packet });
            }
            self.schedule_access(ctx, interface, busy_until);
            return;
        }

        let frame = FrameId(self.next_frame);
        self.next_frame += 1;
        let airtime = calculate_air_time(self.wifi.mode, packet.wire_size());
        let mut collided = false;
        for other in reservations.iter().filter(|r| r.end > now) {
            collided = true;
            if let Some(victim) = self.in_flight.get_mut(&other.frame) {
                victim.collided = true;
            }
        }
        reservations.push(Reservation {
            frame,
            start: now,
            end: now + airtime,
        });

        let sender = ctx.topology.interface(interface).map_or(next_hop, |i| i.node);
        log::trace!("Node {} starts frame {:?} (packet {}) to node {}, airtime {:?}", sender, frame, packet.uid, next_hop, airtime);
        self.in_flight.insert(
            frame,
            Frame {
                interface,
                sender,
                next_hop,
                packet,
                collided,
            },
        );
        if let Some(Device::Wifi(device)) = self.devices.get_mut(interface.0) {
            device.transmitting = true;
        }
        self.counters.frames_transmitted += 1;
        ctx.clock.schedule_in(airtime, SimEvent::TransmissionEnd { frame });
    }

    /// A wireless frame left the air: deliver it or account for the loss.
    pub fn on_transmission_end(&mut self, ctx: &mut MacContext, frame: FrameId) {
        let now = ctx.clock.now();
        let Some(Frame {
            interface,
            sender,
            next_hop,
            packet,
            collided,
        }) = self.in_flight.remove(&frame)
        else {
            return;
        };

        let mut link = None;
        if let Some(Device::Wifi(device)) = self.devices.get_mut(interface.0) {
            device.transmitting = false;
            link = Some(device.link);
        }
        if let Some(reservations) = link.and_then(|link| self.reservations.get_mut(&link)) {
            reservations.retain(|r| r.frame != frame);
        }

        if collided {
            self.counters.collisions += 1;
            log::trace!("Frame {:?} from node {} collided", frame, sender);
            ctx.flows.on_loss(packet.flow, packet.wire_size());
        } else {
            let from = ctx.mobility.position_at(sender, now).unwrap_or(Point::ORIGIN);
            let to = ctx.mobility.position_at(next_hop, now).unwrap_or(Point::ORIGIN);
            let d = distance(&from, &to);
            if d > self.wifi.range {
                self.counters.out_of_range += 1;
                log::trace!("Frame {:?} from node {} lost: node {} is {:.1} m away", frame, sender, next_hop, d);
                ctx.flows.on_loss(packet.flow, packet.wire_size());
            } else {
                self.counters.frames_delivered += 1;
                ctx.clock.schedule_in(Duration::from_secs_f64(d / SPEED_OF_LIGHT), SimEvent::PacketArrival { node: next_hop, packet });
            }
        }

        let backlog = match self.devices.get(interface.0) {
            Some(Device::Wifi(device)) => !device.queue.is_empty() && device.access.is_none(),
            _ => false,
        };
        if backlog {
            self.schedule_access(ctx, interface, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_stats::FiveTuple;
    use crate::network::packet::{EchoKind, PacketBody, Protocol};
    use crate::network::topology::NodeRole;
    use std::net::Ipv4Addr;

    struct Bench {
        clock: EventQueue<SimEvent>,
        rng: SimRng,
        flows: FlowStatsCollector,
        topology: Topology,
        mobility: MobilityEngine,
        medium: MediumAccess,
        ap: NodeId,
        server: NodeId,
        stations: Vec<NodeId>,
        arrivals: Vec<(Duration, NodeId, u64)>,
    }

    impl Bench {
        fn new(stations: usize, wifi: WifiConfig, wired: DataRate, queue_limit: usize) -> Self {
            let mut topology = Topology::new();
            let server = topology.add_node(NodeRole::Server);
            let ap = topology.add_node(NodeRole::AccessPoint);
            let stas: Vec<NodeId> = (0..stations).map(|_| topology.add_node(NodeRole::Station)).collect();
            let mut members = vec![ap];
            members.extend(&stas);
            topology.add_wireless_link("192.168.0.0/24".parse().unwrap(), &members).unwrap();
            topology
                .add_wired_link_with_queue("10.1.1.0/24".parse().unwrap(), ap, server, wired, Duration::from_millis(2), queue_limit)
                .unwrap();
            topology.assign_addresses().unwrap();
            let mut mobility = MobilityEngine::new();
            for node in topology.nodes() {
                mobility.set_fixed(node.id, Point::ORIGIN);
            }
            let medium = MediumAccess::new(&topology, wifi);
            Self {
                clock: EventQueue::new(),
                rng: SimRng::new(1),
                flows: FlowStatsCollector::new(),
                topology,
                mobility,
                medium,
                ap,
                server,
                stations: stas,
                arrivals: Vec::new(),
            }
        }

        fn packet(&self, uid: u64, port: u16) -> Packet {
            Packet {
                uid,
                flow: FiveTuple {
                    source: Ipv4Addr::new(192, 168, 0, 2),
                    destination: Ipv4Addr::new(10, 1, 1, 2),
                    protocol: Protocol::Datagram,
                    source_port: port,
                    destination_port: 9,
                },
                payload_size: 1024,
                sent_at: self.clock.now(),
                body: PacketBody::Datagram { sequence: uid, echo: EchoKind::None },
            }
        }

        fn send(&mut self, from: NodeId, packet: Packet) {
            let destination = packet.flow.destination;
            let route = self.topology.route(from, destination).unwrap();
            let mut ctx = MacContext {
                clock: &mut self.clock,
                rng: &mut self.rng,
                flows: &mut self.flows,
                topology: &self.topology,
                mobility: &self.mobility,
            };
            self.medium.transmit(&mut ctx, route.interface, route.next_hop, packet);
        }

        fn run(&mut self) {
            while let Some((now, event)) = self.clock.pop_before(Duration::from_secs(100)) {
                let mut ctx = MacContext {
                    clock: &mut self.clock,
                    rng: &mut self.rng,
                    flows: &mut self.flows,
                    topology: &self.topology,
                    mobility: &self.mobility,
                };
                match event {
                    SimEvent::ChannelAccess { interface } => self.medium.on_channel_access(&mut ctx, interface),
                    SimEvent::TransmissionEnd { frame } => self.medium.on_transmission_end(&mut ctx, frame),
                    SimEvent::PacketArrival { node, packet } => self.arrivals.push((now, node, packet.uid)),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn single_frame_is_delivered_after_difs_backoff_and_airtime() {
        let mut bench = Bench::new(1, WifiConfig::default(), DataRate::from_mbps(100), 100);
        let sta = bench.stations[0];
        let packet = bench.packet(1, 49153);
        bench.send(sta, packet);
        bench.run();

        assert_eq!(bench.arrivals.len(), 1);
        let (at, node, uid) = bench.arrivals[0];
        assert_eq!((node, uid), (bench.ap, 1));
        let airtime = calculate_air_time(WifiConfig::default().mode, 1052);
        assert!(at >= DIFS + airtime);
        assert!(at <= DIFS + SLOT_TIME * 15 + airtime);
        assert_eq!(bench.medium.counters().frames_delivered, 1);
        assert!(bench.flows.is_empty());
    }

    #[test]
    fn simultaneous_access_collides_and_both_frames_are_lost() {
        // A single-slot window forces both backoffs to zero.
        let wifi = WifiConfig {
            contention_window: 1,
            ..WifiConfig::default()
        };
        let mut bench = Bench::new(2, wifi, DataRate::from_mbps(100), 100);
        let (a, b) = (bench.stations[0], bench.stations[1]);
        let first = bench.packet(1, 1000);
        let second = bench.packet(2, 2000);
        bench.send(a, first);
        bench.send(b, second);
        bench.run();

        assert!(bench.arrivals.is_empty());
        assert_eq!(bench.medium.counters().collisions, 2);
        let snapshot = bench.flows.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|r| r.lost_packets == 1 && r.rx_packets == 0));
    }

    #[test]
    fn queued_frames_from_one_station_never_collide_with_each_other() {
        let mut bench = Bench::new(1, WifiConfig::default(), DataRate::from_mbps(100), 100);
        let sta = bench.stations[0];
        for uid in 0..20 {
            let packet = bench.packet(uid, 49153);
            bench.send(sta, packet);
        }
        bench.run();
        let uids: Vec<u64> = bench.arrivals.iter().map(|a| a.2).collect();
        assert_eq!(uids, (0..20).collect::<Vec<_>>());
        assert_eq!(bench.medium.counters().collisions, 0);
    }

    #[test]
    fn out_of_range_frames_are_lost() {
        let wifi = WifiConfig { range: 10.0, ..WifiConfig::default() };
        let mut bench = Bench::new(1, wifi, DataRate::from_mbps(100), 100);
        let sta = bench.stations[0];
        bench.mobility.set_fixed(sta, Point::new(30.0, 40.0));
        let packet = bench.packet(1, 49153);
        bench.send(sta, packet);
        bench.run();
        assert!(bench.arrivals.is_empty());
        assert_eq!(bench.medium.counters().out_of_range, 1);
        assert_eq!(bench.flows.snapshot()[0].lost_packets, 1);
    }

    #[test]
    fn wired_link_serializes_then_propagates() {
        let mut bench = Bench::new(1, WifiConfig::default(), DataRate::from_mbps(100), 100);
        let (ap, server) = (bench.ap, bench.server);
        for uid in 0..2 {
            let packet = bench.packet(uid, 49153);
            bench.send(ap, packet);
        }
        bench.run();
        // 1052 bytes at 100 Mb/s = 84.16 us per packet, then 2 ms.
        let tx = Duration::from_nanos(84_160);
        let delay = Duration::from_millis(2);
        assert_eq!(bench.arrivals, vec![(tx + delay, server, 0), (tx * 2 + delay, server, 1)]);
    }

    #[test]
    fn full_wired_queue_drops() {
        let mut bench = Bench::new(1, WifiConfig::default(), DataRate::from_kbps(10), 3);
        let ap = bench.ap;
        for uid in 0..5 {
            let packet = bench.packet(uid, 49153);
            bench.send(ap, packet);
        }
        bench.run();
        assert_eq!(bench.arrivals.len(), 3);
        assert_eq!(bench.medium.counters().queue_drops, 2);
        assert_eq!(bench.flows.snapshot()[0].lost_packets, 2);
    }
}
