//! The SimulationManager drives global time: it grants ticks at each step,
//! waits for the network's ADVANCE_STEP quorum signal, triggers checkpoints
//! at step boundaries, and tears the simulation down when the step budget is
//! spent.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{Result, SimError};
use crate::link::Link;
use crate::packets::{AgentId, Packet, PacketType, Payload};

pub const MANAGER_ID: &str = "SimulationManager";

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub simulation_steps: u64,
    pub ticks_per_step: u32,
    pub checkpoint_frequency: Option<u64>,
    pub checkpoint_dir: PathBuf,
    pub initial_checkpoint: Option<PathBuf>,
    /// Worker processes that must report PROC_READY before the run starts.
    pub expected_procs: usize,
    /// How long a step may take before non-blocked agents are declared
    /// stalled and the step is forced forward.
    pub stall_budget: Duration,
    /// Grace period for controller start-up and shutdown flushing.
    pub settle_delay: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            simulation_steps: 0,
            ticks_per_step: 24,
            checkpoint_frequency: None,
            checkpoint_dir: PathBuf::from("CHECKPOINTS"),
            initial_checkpoint: None,
            expected_procs: 0,
            stall_budget: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ManagerCheckpoint {
    step: u64,
}

enum Event {
    Advance(u64),
    Nothing,
}

pub struct SimulationManager {
    link: Link,
    settings: ManagerSettings,
    subscribers: HashSet<AgentId>,
    blocked: HashSet<AgentId>,
    procs_ready: HashSet<String>,
    checkpoint_acks: usize,
    step: u64,
    terminated: bool,
}

impl SimulationManager {
    pub fn new(link: Link, settings: ManagerSettings) -> Self {
        Self {
            link,
            settings,
            subscribers: HashSet::new(),
            blocked: HashSet::new(),
            procs_ready: HashSet::new(),
            checkpoint_acks: 0,
            step: 0,
            terminated: false,
        }
    }

    /// Run the whole simulation to completion. Returns the number of
    /// completed steps.
    pub fn run(&mut self) -> Result<u64> {
        self.wait_for_procs()?;

        if let Some(path) = self.settings.initial_checkpoint.clone() {
            info!(target: "manager", path = %path.display(), "loading initial checkpoint");
            self.broadcast(
                PacketType::LoadCheckpointBroadcast,
                Payload::Checkpoint { path: path.display().to_string(), step: 0 },
            );
            self.drain_for(self.settings.settle_delay);
        }

        info!(target: "manager", "starting all agent controllers");
        self.broadcast(PacketType::ControllerStartBroadcast, Payload::Empty);
        self.drain_for(self.settings.settle_delay);

        let started = Instant::now();
        let steps = self.settings.simulation_steps;
        while self.step < steps && !self.terminated {
            let step = self.step;
            debug!(target: "manager", step, "running simulation step");

            self.blocked.clear();
            self.broadcast(
                PacketType::TickGrantBroadcast,
                Payload::TickGrant { ticks: self.settings.ticks_per_step, step },
            );

            self.await_advance(step);

            if let Some(frequency) = self.settings.checkpoint_frequency {
                if frequency > 0 && (step + 1) % frequency == 0 {
                    self.save_checkpoint(step);
                }
            }

            self.step += 1;
        }

        info!(
            target: "manager",
            steps = self.step,
            elapsed = ?started.elapsed(),
            "simulation finished"
        );
        self.shutdown();
        Ok(self.step)
    }

    /// End the run early: stop trading, then kill every connection.
    pub fn shutdown(&mut self) {
        info!(target: "manager", "stopping all trading activity");
        let stop = Packet::broadcast(MANAGER_ID, PacketType::StopTrading, Payload::Empty);
        self.broadcast(PacketType::ControllerMsgBroadcast, Payload::Wrapped(Box::new(stop)));
        self.drain_for(self.settings.settle_delay);

        info!(target: "manager", "killing all network connections");
        self.broadcast(PacketType::KillAllBroadcast, Payload::Empty);
        self.drain_for(self.settings.settle_delay);

        let kill = Packet::new(MANAGER_ID, MANAGER_ID, PacketType::KillPipeNetwork, Payload::Empty);
        let _ = self.link.send(kill);
    }

    fn broadcast(&self, packet_type: PacketType, payload: Payload) {
        let packet = Packet::broadcast(MANAGER_ID, packet_type, payload);
        debug!(target: "manager", %packet, "OUTBOUND");
        if self.link.send(packet).is_err() {
            error!(target: "manager", "network link closed");
        }
    }

    fn wait_for_procs(&mut self) -> Result<()> {
        if self.settings.expected_procs == 0 {
            return Ok(());
        }
        info!(target: "manager", expected = self.settings.expected_procs, "waiting for host processes");
        let deadline = Instant::now() + Duration::from_secs(60);
        while self.procs_ready.len() < self.settings.expected_procs {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| SimError::Fatal("host processes did not come up".into()))?;
            match self.link.recv_timeout(remaining) {
                Ok(packet) => {
                    self.handle_packet(packet)?;
                }
                Err(SimError::LinkClosed) => return Err(SimError::LinkClosed),
                Err(_) => {
                    return Err(SimError::Fatal("host processes did not come up".into()));
                }
            }
        }
        info!(target: "manager", "all host processes ready");
        Ok(())
    }

    /// Wait for the network's ADVANCE_STEP, bounded by the stall budget.
    /// A stalled run is forced forward so global progress is guaranteed.
    fn await_advance(&mut self, step: u64) {
        let deadline = Instant::now() + self.settings.stall_budget;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                let stalled: Vec<&AgentId> =
                    self.subscribers.difference(&self.blocked).collect();
                warn!(target: "manager", step, ?stalled, "stall budget exhausted, forcing step forward");
                return;
            };
            match self.link.recv_timeout(remaining) {
                Ok(packet) => match self.classify(packet) {
                    Ok(Event::Advance(advanced_step)) => {
                        if advanced_step == step {
                            return;
                        }
                        debug!(target: "manager", advanced_step, step, "stale advance signal");
                    }
                    Ok(Event::Nothing) => {}
                    Err(_) => return,
                },
                Err(SimError::LinkClosed) => {
                    self.terminated = true;
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Pump the link for a fixed window, absorbing bookkeeping packets.
    fn drain_for(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match self.link.recv_timeout(remaining) {
                Ok(packet) => {
                    let _ = self.handle_packet(packet);
                }
                Err(_) => break,
            }
        }
    }

    fn save_checkpoint(&mut self, step: u64) {
        let directory = self.settings.checkpoint_dir.join(format!("step_{step}"));
        info!(target: "manager", step, path = %directory.display(), "saving checkpoint");
        if let Err(e) =
            crate::checkpoint::save_store(&directory, MANAGER_ID, &ManagerCheckpoint { step })
        {
            error!(target: "manager", error = %e, "manager checkpoint failed");
            return;
        }

        self.checkpoint_acks = 0;
        self.broadcast(
            PacketType::SaveCheckpointBroadcast,
            Payload::Checkpoint { path: directory.display().to_string(), step },
        );
        self.drain_for(self.settings.settle_delay);
        info!(target: "manager", step, acks = self.checkpoint_acks, "checkpoint acknowledged");
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        match self.classify(packet)? {
            Event::Advance(step) => {
                debug!(target: "manager", step, "late advance signal absorbed");
                Ok(())
            }
            Event::Nothing => Ok(()),
        }
    }

    fn classify(&mut self, packet: Packet) -> Result<Event> {
        debug!(target: "manager", %packet, "INBOUND");
        match packet.packet_type {
            PacketType::TickBlockSubscribe => {
                debug!(target: "manager", agent = %packet.sender, "subscribed to tick blocking");
                self.subscribers.insert(packet.sender);
                Ok(Event::Nothing)
            }
            PacketType::TickBlocked => {
                self.blocked.insert(packet.sender);
                Ok(Event::Nothing)
            }
            PacketType::AdvanceStep => match packet.payload {
                Payload::AdvanceStep { step } => Ok(Event::Advance(step)),
                _ => Ok(Event::Nothing),
            },
            PacketType::SaveCheckpointAck => {
                self.checkpoint_acks += 1;
                Ok(Event::Nothing)
            }
            PacketType::ProcReady => {
                if let Payload::ProcStatus { proc_name, .. } = packet.payload {
                    info!(target: "manager", proc = %proc_name, "host process ready");
                    self.procs_ready.insert(proc_name);
                }
                Ok(Event::Nothing)
            }
            PacketType::ProcError => {
                let detail = match packet.payload {
                    Payload::ProcStatus { proc_name, error } => {
                        format!("{proc_name}: {}", error.unwrap_or_default())
                    }
                    _ => "unknown host process error".to_string(),
                };
                error!(target: "manager", detail, "host process failed");
                Err(SimError::Fatal(detail))
            }
            PacketType::TerminateSimulation => {
                warn!(target: "manager", sender = %packet.sender, "termination requested");
                self.terminated = true;
                Err(SimError::Fatal("simulation terminated by request".into()))
            }
            PacketType::ErrorControllerStart => {
                error!(target: "manager", sender = %packet.sender, "controller failed to start");
                Ok(Event::Nothing)
            }
            PacketType::Error => {
                warn!(target: "manager", %packet, "error packet");
                Ok(Event::Nothing)
            }
            _ => {
                debug!(target: "manager", %packet, "ignoring packet");
                Ok(Event::Nothing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_pair;
    use std::thread;

    fn settings(steps: u64) -> ManagerSettings {
        ManagerSettings {
            simulation_steps: steps,
            ticks_per_step: 2,
            stall_budget: Duration::from_secs(2),
            settle_delay: Duration::from_millis(20),
            ..ManagerSettings::default()
        }
    }

    /// Drive the manager's link directly, playing the network's role.
    #[test]
    fn test_step_loop_grants_and_advances() {
        let (manager_end, network_end) = link_pair();
        let handle = thread::spawn(move || {
            let mut manager = SimulationManager::new(manager_end, settings(3));
            manager.run().unwrap()
        });

        // Controller start.
        let start = network_end.recv().unwrap();
        assert_eq!(start.packet_type, PacketType::ControllerStartBroadcast);

        for step in 0..3 {
            let grant = network_end.recv().unwrap();
            assert_eq!(grant.packet_type, PacketType::TickGrantBroadcast);
            match grant.payload {
                Payload::TickGrant { ticks, step: granted } => {
                    assert_eq!(ticks, 2);
                    assert_eq!(granted, step);
                }
                other => panic!("unexpected payload {other:?}"),
            }
            network_end
                .send(Packet::new(
                    "ConnectionNetwork",
                    MANAGER_ID,
                    PacketType::AdvanceStep,
                    Payload::AdvanceStep { step },
                ))
                .unwrap();
        }

        // Shutdown sequence: stop-trading wrapper then kill-all.
        let stop = network_end.recv().unwrap();
        assert_eq!(stop.packet_type, PacketType::ControllerMsgBroadcast);
        let kill = network_end.recv().unwrap();
        assert_eq!(kill.packet_type, PacketType::KillAllBroadcast);

        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    fn test_stall_budget_forces_progress() {
        let (manager_end, network_end) = link_pair();
        let mut stalled_settings = settings(1);
        stalled_settings.stall_budget = Duration::from_millis(50);
        let handle = thread::spawn(move || {
            let mut manager = SimulationManager::new(manager_end, stalled_settings);
            manager.run().unwrap()
        });

        assert_eq!(network_end.recv().unwrap().packet_type, PacketType::ControllerStartBroadcast);
        assert_eq!(network_end.recv().unwrap().packet_type, PacketType::TickGrantBroadcast);
        // Never send ADVANCE_STEP: the stall budget must move the run along.
        assert_eq!(handle.join().unwrap(), 1);
    }
}
