//! Agent host process.
//!
//! A worker is spawned by the runner with a hub address, connects its single
//! gateway socket, receives its blueprint batch as the first frame, and
//! instantiates the agents locally. From then on it is a plain proxy:
//! everything the agents send is multiplexed onto the socket; inbound frames
//! are dispatched to agents by destination. The worker exits once all of
//! its agents have shut down.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::controllers::build_controller;
use crate::error::{Result, SimError};
use crate::link::link_pair;
use crate::manager::MANAGER_ID;
use crate::packets::{AgentId, Packet, PacketType, Payload};
use crate::wire::{read_frame, write_frame, Frame};

pub fn run_worker(hub_address: &str) -> Result<()> {
    let mut stream = TcpStream::connect(hub_address)
        .map_err(|e| SimError::Fatal(format!("cannot reach hub at {hub_address}: {e}")))?;

    let assignment = match read_frame(&mut stream)? {
        Frame::Assignment(assignment) => assignment,
        Frame::Packet(_) => {
            return Err(SimError::Fatal("expected an assignment frame from the hub".into()));
        }
    };
    let proc_name = assignment.proc_name.clone();
    info!(target: "worker", proc = %proc_name, agents = assignment.blueprints.len(), "assignment received");

    // Every local agent shares one outbound channel to the socket writer.
    let (out_tx, out_rx) = unbounded::<Packet>();
    let mut routes: HashMap<AgentId, crossbeam_channel::Sender<Packet>> = HashMap::new();
    let mut agents: Vec<Agent> = Vec::new();

    let items = Arc::new(assignment.items);
    for blueprint in assignment.blueprints {
        let (worker_end, agent_end) = link_pair();
        routes.insert(blueprint.agent_id.clone(), worker_end.sender());

        // Forward this agent's outbound traffic onto the shared channel.
        let agent_rx = worker_end.receiver();
        let forward_tx = out_tx.clone();
        thread::spawn(move || {
            while let Ok(packet) = agent_rx.recv() {
                if forward_tx.send(packet).is_err() {
                    break;
                }
            }
        });

        let controller = build_controller(&blueprint.controller_type, &blueprint.agent_id);
        agents.push(Agent::spawn(blueprint, agent_end, Arc::clone(&items), controller));
    }

    // Socket writer. Agents hold their outbound senders for as long as they
    // live, so the channel never disconnects on its own; the done flag tells
    // the writer to drain and close.
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer_done = Arc::clone(&done);
    let mut write_stream = stream.try_clone()?;
    let writer = thread::Builder::new()
        .name(format!("worker-writer-{proc_name}"))
        .spawn(move || {
            loop {
                match out_rx.recv_timeout(std::time::Duration::from_millis(100)) {
                    Ok(packet) => {
                        if write_frame(&mut write_stream, &Frame::Packet(packet)).is_err() {
                            break;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if writer_done.load(std::sync::atomic::Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            let _ = write_stream.shutdown(Shutdown::Write);
        })
        .expect("failed to spawn worker writer");

    // Socket reader: dispatch inbound packets to local agents.
    let reader_routes = routes.clone();
    let reader_proc = proc_name.clone();
    let reader = thread::Builder::new()
        .name(format!("worker-reader-{proc_name}"))
        .spawn(move || {
            let mut stream = stream;
            loop {
                let packet = match read_frame(&mut stream) {
                    Ok(Frame::Packet(packet)) => packet,
                    Ok(Frame::Assignment(_)) => {
                        warn!(target: "worker", proc = %reader_proc, "unexpected assignment frame");
                        continue;
                    }
                    Err(_) => break,
                };
                debug!(target: "worker", proc = %reader_proc, %packet, "INBOUND");

                let destination = packet.destination.clone();
                match destination.as_deref() {
                    Some(id) if id == reader_proc => {
                        // Addressed to the host process itself: only stop
                        // signals are meaningful here.
                        if matches!(
                            packet.packet_type,
                            PacketType::ProcStop | PacketType::KillAllBroadcast
                        ) {
                            break;
                        }
                    }
                    Some(id) => match reader_routes.get(id) {
                        Some(tx) => {
                            if tx.send(packet).is_err() {
                                debug!(target: "worker", proc = %reader_proc, agent = id, "agent gone");
                            }
                        }
                        None => {
                            warn!(target: "worker", proc = %reader_proc, agent = id, "no route for inbound packet");
                        }
                    },
                    None => {
                        warn!(target: "worker", proc = %reader_proc, %packet, "inbound packet without destination");
                    }
                }
            }
        })
        .expect("failed to spawn worker reader");

    // All agents are up: tell the manager this process is ready.
    let ready = Packet::new(
        proc_name.clone(),
        MANAGER_ID,
        PacketType::ProcReady,
        Payload::ProcStatus { proc_name: proc_name.clone(), error: None },
    );
    out_tx.send(ready).map_err(|_| SimError::LinkClosed)?;

    // Block until every agent has processed its kill packet.
    for agent in &agents {
        agent.join();
    }
    info!(target: "worker", proc = %proc_name, "all agents stopped");

    // Deregister the gateway itself, then let the writer drain and close.
    let kill = Packet::new(proc_name.clone(), proc_name.clone(), PacketType::KillPipeNetwork, Payload::Empty);
    let _ = out_tx.send(kill);
    drop(out_tx);
    drop(routes);
    done.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = writer.join();
    let _ = reader.join();
    Ok(())
}
