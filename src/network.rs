//! The ConnectionNetwork routes every packet in the simulation.
//!
//! Hub-and-spoke: each agent owns a single duplex link to the network and
//! each inbound link is drained by a dedicated reader thread. Routing is by
//! `destination` id; `_BROADCAST` types fan out to every registered agent
//! except the sender. The network also keeps the snoop table (packet type ->
//! observers) and is the authoritative quorum counter for the step barrier:
//! it acks every TICK_BLOCKED and emits a single ADVANCE_STEP to the manager
//! once all subscribed agents are blocked.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::link::{link_pair, Link};
use crate::packets::{AgentId, Packet, PacketType, Payload};

pub const NETWORK_ID: &str = "ConnectionNetwork";

struct TickQuorum {
    subscribers: HashSet<AgentId>,
    blocked: HashSet<AgentId>,
    step: u64,
    step_open: bool,
}

struct Shared {
    registry: RwLock<HashMap<AgentId, Sender<Packet>>>,
    snoop_table: RwLock<HashMap<PacketType, BTreeSet<AgentId>>>,
    quorum: Mutex<TickQuorum>,
    kill_all_seen: Mutex<bool>,
    manager_id: AgentId,
    /// The only agent whose SNOOP_START requests are honored.
    observer_id: Option<AgentId>,
}

impl Shared {
    fn send_to(&self, destination: &str, packet: Packet) -> bool {
        let registry = self.registry.read().expect("registry lock poisoned");
        match registry.get(destination) {
            Some(tx) => {
                debug!(target: "network", %packet, %destination, "OUTBOUND");
                tx.send(packet).is_ok()
            }
            None => false,
        }
    }

    /// ERROR packet back to a sender whose packet could not be delivered.
    fn send_error(&self, to: &str, message: String, transaction_id: Option<String>) {
        let mut err = Packet::new(NETWORK_ID, to, PacketType::Error, Payload::Text(message));
        err.transaction_id = transaction_id;
        if !self.send_to(to, err) {
            warn!(target: "network", agent = to, "could not deliver ERROR packet");
        }
    }

    /// Forward a snoop copy to each registered observer of this packet type.
    /// Copies are marked non-incoming so they can never be snooped again, and
    /// self-snooping is suppressed.
    fn snoop(&self, packet: &Packet) {
        if !packet.incoming {
            return;
        }
        let observers: Vec<AgentId> = {
            let table = self.snoop_table.read().expect("snoop lock poisoned");
            match table.get(&packet.packet_type) {
                Some(set) => set.iter().cloned().collect(),
                None => return,
            }
        };
        for observer in observers {
            if observer == packet.sender {
                continue;
            }
            let mut inner = packet.clone();
            inner.incoming = false;
            let mut copy = Packet::new(
                NETWORK_ID,
                observer.clone(),
                PacketType::Snoop,
                Payload::Wrapped(Box::new(inner)),
            );
            copy.incoming = false;
            self.send_to(&observer, copy);
        }
    }
}

pub struct ConnectionNetwork {
    shared: Arc<Shared>,
    /// Links waiting for `start` to attach their reader threads.
    pending: Vec<(AgentId, Link)>,
    readers: Vec<JoinHandle<()>>,
}

impl ConnectionNetwork {
    pub fn new(manager_id: impl Into<AgentId>, observer_id: Option<AgentId>) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(HashMap::new()),
                snoop_table: RwLock::new(HashMap::new()),
                quorum: Mutex::new(TickQuorum {
                    subscribers: HashSet::new(),
                    blocked: HashSet::new(),
                    step: 0,
                    step_open: false,
                }),
                kill_all_seen: Mutex::new(false),
                manager_id: manager_id.into(),
                observer_id,
            }),
            pending: Vec::new(),
            readers: Vec::new(),
        }
    }

    /// Register an agent's link with the network. The reader thread is
    /// attached by `start`.
    pub fn add_connection(&mut self, agent_id: impl Into<AgentId>, link: Link) {
        let agent_id = agent_id.into();
        info!(target: "network", agent = %agent_id, "adding connection");
        self.shared
            .registry
            .write()
            .expect("registry lock poisoned")
            .insert(agent_id.clone(), link.sender());
        self.pending.push((agent_id, link));
    }

    /// Convenience: build a fresh duplex pair, register the network end and
    /// hand back the agent end.
    pub fn register(&mut self, agent_id: impl Into<AgentId>) -> Link {
        let (network_end, agent_end) = link_pair();
        self.add_connection(agent_id, network_end);
        agent_end
    }

    /// Route an additional agent id through an existing outbound sender.
    /// Used for remote agents proxied over a per-process gateway link: the
    /// gateway link gets one reader, every agent behind it gets a route.
    pub fn add_route(&mut self, agent_id: impl Into<AgentId>, sender: Sender<Packet>) {
        self.shared
            .registry
            .write()
            .expect("registry lock poisoned")
            .insert(agent_id.into(), sender);
    }

    /// Spawn one reader thread per registered link.
    pub fn start(&mut self) {
        for (agent_id, link) in self.pending.drain(..) {
            let shared = Arc::clone(&self.shared);
            let name = format!("net-reader-{agent_id}");
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || reader_loop(shared, agent_id, link))
                .expect("failed to spawn network reader");
            self.readers.push(handle);
        }
    }

    /// Block until every reader thread has exited (all links killed).
    pub fn join(&mut self) {
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn reader_loop(shared: Arc<Shared>, agent_id: AgentId, link: Link) {
    info!(target: "network", agent = %agent_id, "monitoring link");
    while let Ok(packet) = link.recv() {
        debug!(target: "network", %packet, agent = %agent_id, "INBOUND");

        shared.snoop(&packet);

        match packet.packet_type {
            PacketType::KillPipeNetwork => {
                info!(target: "network", agent = %packet.sender, "killing route");
                shared
                    .registry
                    .write()
                    .expect("registry lock poisoned")
                    .remove(&packet.sender);
                // A gateway link carries many agents; the reader only exits
                // when the link's own registrant says so.
                if packet.sender == agent_id {
                    break;
                }
            }

            PacketType::SnoopStart => handle_snoop_start(&shared, packet),

            t if t.is_broadcast() => handle_broadcast(&shared, packet),

            PacketType::TickBlockSubscribe => {
                {
                    let mut quorum = shared.quorum.lock().expect("quorum lock poisoned");
                    quorum.subscribers.insert(packet.sender.clone());
                }
                let manager = shared.manager_id.clone();
                route(&shared, manager.as_str(), packet);
            }

            PacketType::TickBlocked => handle_tick_blocked(&shared, packet),

            _ => {
                // TICK_GRANT rides the broadcast arm; a targeted grant (used
                // to re-sync a single stalled agent) still reopens the step.
                if packet.packet_type == PacketType::TickGrant {
                    open_step(&shared, &packet);
                }
                let Some(destination) = packet.destination.clone() else {
                    shared.send_error(
                        &packet.sender.clone(),
                        format!("packet {packet} has no destination"),
                        packet.transaction_id,
                    );
                    continue;
                };
                if destination == NETWORK_ID {
                    // Snoop-only traffic (e.g. PRODUCTION_NOTIFICATION) is
                    // addressed to the network and ends here.
                    continue;
                }
                route(&shared, &destination, packet);
            }
        }
    }
    info!(target: "network", agent = %agent_id, "ending link monitor");
}

fn route(shared: &Shared, destination: &str, packet: Packet) {
    let sender = packet.sender.clone();
    let transaction_id = packet.transaction_id.clone();
    if !shared.send_to(destination, packet) {
        shared.send_error(
            &sender,
            format!("destination \"{destination}\" not connected to network"),
            transaction_id,
        );
    }
}

fn handle_snoop_start(shared: &Shared, packet: Packet) {
    let authorized = shared
        .observer_id
        .as_deref()
        .map(|id| id == packet.sender)
        .unwrap_or(false);
    if !authorized {
        warn!(target: "network", sender = %packet.sender, "unauthorized SNOOP_START");
        shared.send_error(
            &packet.sender.clone(),
            "SNOOP_START is only honored from the statistics observer".into(),
            packet.transaction_id,
        );
        return;
    }
    if let Payload::SnoopStart(types) = packet.payload {
        let mut table = shared.snoop_table.write().expect("snoop lock poisoned");
        for packet_type in types {
            debug!(target: "network", %packet_type, observer = %packet.sender, "adding snoop");
            table.entry(packet_type).or_default().insert(packet.sender.clone());
        }
    } else {
        warn!(target: "network", sender = %packet.sender, "malformed SNOOP_START payload");
    }
}

fn handle_broadcast(shared: &Shared, packet: Packet) {
    if packet.packet_type == PacketType::KillAllBroadcast {
        let mut seen = shared.kill_all_seen.lock().expect("kill-all lock poisoned");
        if *seen {
            debug!(target: "network", "kill-all already forwarded, ignoring");
            return;
        }
        *seen = true;
    }
    if packet.packet_type == PacketType::TickGrantBroadcast {
        open_step(shared, &packet);
    }

    let recipients: Vec<(AgentId, Sender<Packet>)> = {
        let registry = shared.registry.read().expect("registry lock poisoned");
        registry
            .iter()
            .filter(|(id, _)| **id != packet.sender)
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect()
    };
    // Fan out inline on this reader thread so the broadcast stays FIFO with
    // respect to other packets from the same sender.
    for (id, tx) in recipients {
        let mut copy = packet.clone();
        copy.destination = Some(id.clone());
        debug!(target: "network", packet = %copy, "OUTBOUND broadcast");
        if tx.send(copy).is_err() {
            warn!(target: "network", agent = %id, "broadcast recipient link closed");
        }
    }
}

fn open_step(shared: &Shared, packet: &Packet) {
    if let Payload::TickGrant { step, .. } = packet.payload {
        let mut quorum = shared.quorum.lock().expect("quorum lock poisoned");
        quorum.blocked.clear();
        quorum.step = step;
        quorum.step_open = true;
    }
}

fn handle_tick_blocked(shared: &Shared, packet: Packet) {
    // Ack first: the barrier counts an agent only once its ack is on the wire.
    let ack = Packet::new(NETWORK_ID, packet.sender.clone(), PacketType::TickBlockedAck, Payload::Empty);
    shared.send_to(&packet.sender, ack);

    let advance = {
        let mut quorum = shared.quorum.lock().expect("quorum lock poisoned");
        quorum.blocked.insert(packet.sender.clone());
        let complete = quorum.step_open
            && !quorum.subscribers.is_empty()
            && quorum.subscribers.iter().all(|id| quorum.blocked.contains(id));
        if complete {
            quorum.step_open = false;
            Some(quorum.step)
        } else {
            None
        }
    };

    // The manager still sees each TICK_BLOCKED for stall bookkeeping.
    let manager = shared.manager_id.clone();
    route(shared, manager.as_str(), packet);

    if let Some(step) = advance {
        debug!(target: "network", step, "all subscribers blocked, advancing");
        let advance_packet = Packet::new(
            NETWORK_ID,
            manager.clone(),
            PacketType::AdvanceStep,
            Payload::AdvanceStep { step },
        );
        shared.send_to(&manager, advance_packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targeted(from: &str, to: &str, t: PacketType) -> Packet {
        Packet::new(from, to, t, Payload::Empty)
    }

    #[test]
    fn test_targeted_routing() {
        let mut network = ConnectionNetwork::new("manager", None);
        let a = network.register("a");
        let b = network.register("b");
        let _mgr = network.register("manager");
        network.start();

        a.send(targeted("a", "b", PacketType::ControllerMsg)).unwrap();
        let got = b.recv().unwrap();
        assert_eq!(got.sender, "a");
        assert_eq!(got.packet_type, PacketType::ControllerMsg);
    }

    #[test]
    fn test_unknown_destination_answered_with_error() {
        let mut network = ConnectionNetwork::new("manager", None);
        let a = network.register("a");
        network.start();

        a.send(targeted("a", "ghost", PacketType::ControllerMsg).with_transaction("t1"))
            .unwrap();
        let got = a.recv().unwrap();
        assert_eq!(got.packet_type, PacketType::Error);
        assert_eq!(got.transaction_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let mut network = ConnectionNetwork::new("manager", None);
        let a = network.register("a");
        let b = network.register("b");
        let c = network.register("c");
        network.start();

        a.send(Packet::broadcast("a", PacketType::ControllerMsgBroadcast, Payload::Empty))
            .unwrap();
        assert_eq!(b.recv().unwrap().packet_type, PacketType::ControllerMsgBroadcast);
        assert_eq!(c.recv().unwrap().packet_type, PacketType::ControllerMsgBroadcast);
        assert!(a.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_snoop_forwarding_and_loop_suppression() {
        let mut network = ConnectionNetwork::new("manager", Some("observer".into()));
        let a = network.register("a");
        let b = network.register("b");
        let observer = network.register("observer");
        network.start();

        observer
            .send(Packet::new(
                "observer",
                NETWORK_ID,
                PacketType::SnoopStart,
                Payload::SnoopStart(vec![PacketType::ControllerMsg]),
            ))
            .unwrap();
        // Snoop table updates are ordered with the observer's own traffic;
        // give the unrelated reader a moment.
        std::thread::sleep(std::time::Duration::from_millis(20));

        a.send(targeted("a", "b", PacketType::ControllerMsg)).unwrap();
        assert_eq!(b.recv().unwrap().packet_type, PacketType::ControllerMsg);

        let snooped = observer.recv().unwrap();
        assert_eq!(snooped.packet_type, PacketType::Snoop);
        assert!(!snooped.incoming);
        match snooped.payload {
            Payload::Wrapped(inner) => {
                assert_eq!(inner.packet_type, PacketType::ControllerMsg);
                assert!(!inner.incoming);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        // A packet sent by the observer itself is not snooped back.
        observer.send(targeted("observer", "b", PacketType::ControllerMsg)).unwrap();
        assert_eq!(b.recv().unwrap().sender, "observer");
        assert!(observer.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_unauthorized_snoop_rejected() {
        let mut network = ConnectionNetwork::new("manager", Some("observer".into()));
        let a = network.register("a");
        network.start();

        a.send(Packet::new(
            "a",
            NETWORK_ID,
            PacketType::SnoopStart,
            Payload::SnoopStart(vec![PacketType::ControllerMsg]),
        ))
        .unwrap();
        assert_eq!(a.recv().unwrap().packet_type, PacketType::Error);
    }

    #[test]
    fn test_tick_quorum_emits_single_advance_step() {
        let mut network = ConnectionNetwork::new("manager", None);
        let a = network.register("a");
        let b = network.register("b");
        let mgr = network.register("manager");
        network.start();

        a.send(targeted("a", "manager", PacketType::TickBlockSubscribe)).unwrap();
        b.send(targeted("b", "manager", PacketType::TickBlockSubscribe)).unwrap();
        assert_eq!(mgr.recv().unwrap().packet_type, PacketType::TickBlockSubscribe);
        assert_eq!(mgr.recv().unwrap().packet_type, PacketType::TickBlockSubscribe);

        mgr.send(Packet::broadcast(
            "manager",
            PacketType::TickGrantBroadcast,
            Payload::TickGrant { ticks: 2, step: 0 },
        ))
        .unwrap();
        assert_eq!(a.recv().unwrap().packet_type, PacketType::TickGrantBroadcast);
        assert_eq!(b.recv().unwrap().packet_type, PacketType::TickGrantBroadcast);

        a.send(targeted("a", "manager", PacketType::TickBlocked)).unwrap();
        assert_eq!(a.recv().unwrap().packet_type, PacketType::TickBlockedAck);
        assert_eq!(mgr.recv().unwrap().packet_type, PacketType::TickBlocked);

        b.send(targeted("b", "manager", PacketType::TickBlocked)).unwrap();
        assert_eq!(b.recv().unwrap().packet_type, PacketType::TickBlockedAck);
        assert_eq!(mgr.recv().unwrap().packet_type, PacketType::TickBlocked);

        let advance = mgr.recv().unwrap();
        assert_eq!(advance.packet_type, PacketType::AdvanceStep);
        match advance.payload {
            Payload::AdvanceStep { step } => assert_eq!(step, 0),
            other => panic!("unexpected payload {other:?}"),
        }
        // Exactly one ADVANCE_STEP.
        assert!(mgr.recv_timeout(std::time::Duration::from_millis(50)).is_err());
    }
}
