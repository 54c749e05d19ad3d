//! Simulation assembly: wires the network, marketplaces, manager and
//! statistics gatherer in the hub process, hosts or spawns the agent
//! processes, runs the manager to completion and tears everything down.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::agent::production::ItemDef;
use crate::agent::Agent;
use crate::config::{build_blueprints, load_items, SimulationConfig};
use crate::controllers::build_controller;
use crate::error::{Result, SimError};
use crate::link::link_pair;
use crate::manager::{ManagerSettings, SimulationManager, MANAGER_ID};
use crate::markets::{
    spawn_item_marketplace, spawn_labor_marketplace, spawn_land_marketplace, ITEM_MARKET_ID,
    LABOR_MARKET_ID, LAND_MARKET_ID,
};
use crate::network::ConnectionNetwork;
use crate::stats::{spawn_statistics_gatherer, STATS_ID};
use crate::wire::{read_frame, write_frame, Frame, WorkerAssignment};

/// Run one simulation to completion. Returns the number of completed steps.
pub fn run_simulation(config: SimulationConfig, config_dir: &Path) -> Result<u64> {
    let items: Arc<HashMap<String, ItemDef>> = Arc::new(match &config.settings.item_settings {
        Some(dir) => {
            let resolved =
                if dir.is_absolute() { dir.clone() } else { config_dir.join(dir) };
            load_items(&resolved)?
        }
        None => HashMap::new(),
    });

    let output_dir = PathBuf::from("OUTPUT").join(&config.name);
    let checkpoint_dir = output_dir.join("CHECKPOINTS");

    info!(
        target: "manager",
        sim = %config.name,
        steps = config.settings.simulation_steps,
        ticks = config.settings.ticks_per_step,
        processes = config.settings.agent_num_processes,
        "assembling simulation"
    );

    let mut network = ConnectionNetwork::new(MANAGER_ID, Some(STATS_ID.to_string()));

    let mut service_handles = vec![
        spawn_item_marketplace(network.register(ITEM_MARKET_ID), MANAGER_ID),
        spawn_labor_marketplace(network.register(LABOR_MARKET_ID), MANAGER_ID),
        spawn_land_marketplace(network.register(LAND_MARKET_ID), MANAGER_ID),
        spawn_statistics_gatherer(
            network.register(STATS_ID),
            config.settings.statistics.clone(),
            output_dir.clone(),
        ),
    ];

    let manager_link = network.register(MANAGER_ID);

    let batches = build_blueprints(&config);
    let total_agents: usize = batches.iter().map(|b| b.len()).sum();
    info!(target: "manager", agents = total_agents, "spawning agents");

    let mut local_agents: Vec<Agent> = Vec::new();
    let mut children: Vec<Child> = Vec::new();

    if config.settings.agent_num_processes == 0 {
        // Hub-hosted agents: no worker processes at all.
        for blueprint in batches.into_iter().flatten() {
            let link = network.register(blueprint.agent_id.clone());
            let controller = build_controller(&blueprint.controller_type, &blueprint.agent_id);
            local_agents.push(Agent::spawn(blueprint, link, Arc::clone(&items), controller));
        }
    } else {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let hub_address = listener.local_addr()?.to_string();

        for (index, batch) in batches.into_iter().enumerate() {
            let proc_name = format!("Simulation_Proc{index}");
            let exe = std::env::current_exe()
                .map_err(|e| SimError::Fatal(format!("cannot locate own executable: {e}")))?;
            let child = Command::new(exe)
                .arg("worker")
                .arg("--connect")
                .arg(&hub_address)
                .spawn()
                .map_err(|e| SimError::Fatal(format!("cannot spawn {proc_name}: {e}")))?;
            children.push(child);

            let (stream, peer) = listener.accept()?;
            info!(target: "network", proc = %proc_name, %peer, "worker connected");
            service_handles.extend(attach_worker(
                &mut network,
                stream,
                proc_name,
                batch,
                &items,
            )?);
        }
    }

    network.start();

    let manager_settings = ManagerSettings {
        simulation_steps: config.settings.simulation_steps,
        ticks_per_step: config.settings.ticks_per_step,
        checkpoint_frequency: config.settings.checkpoint_frequency,
        checkpoint_dir,
        initial_checkpoint: config.settings.initial_checkpoint.clone(),
        expected_procs: config.settings.agent_num_processes,
        ..ManagerSettings::default()
    };
    let mut manager = SimulationManager::new(manager_link, manager_settings);
    let outcome = manager.run();
    if outcome.is_err() {
        // Make sure everything hears the shutdown even on a fatal path.
        manager.shutdown();
    }

    for agent in &local_agents {
        agent.join();
    }
    network.join();
    for handle in service_handles {
        let _ = handle.join();
    }
    for mut child in children {
        match child.wait() {
            Ok(status) if !status.success() => {
                warn!(target: "manager", ?status, "worker exited abnormally")
            }
            Err(e) => error!(target: "manager", error = %e, "waiting on worker failed"),
            _ => {}
        }
    }

    outcome
}

/// Wire one worker process into the hub: a gateway link with a single
/// network reader plus routes for every agent hosted behind it, and a pair
/// of proxy threads pumping frames.
fn attach_worker(
    network: &mut ConnectionNetwork,
    stream: TcpStream,
    proc_name: String,
    batch: Vec<crate::agent::AgentBlueprint>,
    items: &Arc<HashMap<String, ItemDef>>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut setup_stream = stream.try_clone()?;
    let assignment = WorkerAssignment {
        proc_name: proc_name.clone(),
        blueprints: batch.clone(),
        items: (**items).clone(),
    };
    write_frame(&mut setup_stream, &Frame::Assignment(assignment))?;

    let (network_end, proxy_end) = link_pair();
    let gateway_tx = network_end.sender();
    network.add_connection(proc_name.clone(), network_end);
    for blueprint in &batch {
        network.add_route(blueprint.agent_id.clone(), gateway_tx.clone());
    }

    // Hub -> worker: drain everything routed at the gateway onto the socket.
    let mut write_stream = setup_stream;
    let outbound_rx = proxy_end.receiver();
    let writer_proc = proc_name.clone();
    let writer = thread::Builder::new()
        .name(format!("gateway-writer-{proc_name}"))
        .spawn(move || {
            while let Ok(packet) = outbound_rx.recv() {
                if write_frame(&mut write_stream, &Frame::Packet(packet)).is_err() {
                    warn!(target: "network", proc = %writer_proc, "gateway socket write failed");
                    break;
                }
            }
            let _ = write_stream.shutdown(std::net::Shutdown::Write);
        })
        .expect("failed to spawn gateway writer");

    // Worker -> hub: inject frames as if the agents were local.
    let inbound_tx = proxy_end.sender();
    let reader_proc = proc_name;
    let reader = thread::Builder::new()
        .name(format!("gateway-reader-{reader_proc}"))
        .spawn(move || {
            let mut stream = stream;
            loop {
                match read_frame(&mut stream) {
                    Ok(Frame::Packet(packet)) => {
                        if inbound_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Assignment(_)) => {
                        warn!(target: "network", proc = %reader_proc, "unexpected assignment frame")
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("failed to spawn gateway reader");

    Ok(vec![writer, reader])
}
