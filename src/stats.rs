//! Statistics gathering.
//!
//! The StatisticsGatherer is an ordinary agent that snoops selected packet
//! types off the network and dumps one CSV row per simulation step per
//! tracker. It is the only agent whose SNOOP_START requests the network
//! honors. Rows are flushed when the next step's tick grant arrives, and a
//! final row is flushed on STOP_TRADING, so output survives up to the last
//! completed step even when a run aborts.

use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::link::Link;
use crate::network::NETWORK_ID;
use crate::packets::{AgentId, Cents, Packet, PacketType, Payload};
use crate::trade::InfoRequest;

pub const STATS_ID: &str = "StatSlurper";

/// tracker name -> (tracker type -> tracker settings)
pub type StatisticsConfig = HashMap<String, HashMap<String, serde_json::Value>>;

fn open_csv_with_header(directory: &Path, filename: &str, header: &str) -> std::io::Result<File> {
    let path: PathBuf = directory.join(filename);
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    file.write_all(header.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(file)
}

fn write_row(file: &mut File, tracker: &str, line: &str) {
    if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.write_all(b"\n")) {
        error!(target: "stats", tracker, error = %e, "csv write failed");
    }
}

/// One statistic accumulated over a run. Snooped packets arrive between
/// steps; `flush_step` writes the finished step's row.
trait StatTracker: Send {
    fn name(&self) -> &str;
    fn snoop_types(&self) -> Vec<PacketType>;
    fn on_snoop(&mut self, packet: &Packet);
    fn on_info_response(&mut self, _request: &InfoRequest, _step: u64) {}
    /// Poll requests to emit when a new step opens (AccountingTracker).
    fn poll_requests(&self) -> Vec<Packet> {
        Vec::new()
    }
    fn flush_step(&mut self, step: u64);
}

#[derive(Debug, Deserialize)]
struct CommonSettings {
    #[serde(rename = "OuputPath")]
    output_path: String,
    #[serde(rename = "ConsumerClasses", default)]
    consumer_classes: Vec<String>,
    #[serde(rename = "Items", default)]
    items: Vec<String>,
    #[serde(rename = "Agents", default)]
    agents: Vec<AgentId>,
}

// ----------------------------------------------------------------------
// Trackers
// ----------------------------------------------------------------------

/// Net currency spent by consumers on accepted trades, per step.
struct ConsumptionTracker {
    name: String,
    file: File,
    consumer_classes: Vec<String>,
    net_consumption: Cents,
}

impl ConsumptionTracker {
    fn new(name: &str, settings: &CommonSettings, directory: &Path) -> std::io::Result<Self> {
        let file =
            open_csv_with_header(directory, &settings.output_path, "step,consumption_cents")?;
        Ok(Self {
            name: format!("{name}.ConsumptionTracker"),
            file,
            consumer_classes: settings.consumer_classes.clone(),
            net_consumption: 0,
        })
    }
}

impl StatTracker for ConsumptionTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn snoop_types(&self) -> Vec<PacketType> {
        vec![PacketType::TradeReqAck]
    }

    fn on_snoop(&mut self, packet: &Packet) {
        let Payload::TradeRequestAck { request, accepted: true } = &packet.payload else {
            return;
        };
        let is_consumer = self.consumer_classes.is_empty()
            || self.consumer_classes.iter().any(|class| request.buyer_id.contains(class));
        if is_consumer {
            self.net_consumption += request.currency_amount;
        }
    }

    fn flush_step(&mut self, step: u64) {
        let line = format!("{},{}", step, self.net_consumption);
        write_row(&mut self.file, &self.name, &line);
        self.net_consumption = 0;
    }
}

/// Min/mean/max advertised unit price per tracked item, per step.
struct ItemPriceTracker {
    name: String,
    file: File,
    items: Vec<String>,
    prices: HashMap<String, Vec<Cents>>,
}

impl ItemPriceTracker {
    fn new(name: &str, settings: &CommonSettings, directory: &Path) -> std::io::Result<Self> {
        let file = open_csv_with_header(
            directory,
            &settings.output_path,
            "step,item,min_price,mean_price,max_price,listings",
        )?;
        Ok(Self {
            name: format!("{name}.ItemPriceTracker"),
            file,
            items: settings.items.clone(),
            prices: HashMap::new(),
        })
    }
}

impl StatTracker for ItemPriceTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn snoop_types(&self) -> Vec<PacketType> {
        vec![PacketType::ItemMarketUpdate]
    }

    fn on_snoop(&mut self, packet: &Packet) {
        let Payload::ItemListing(listing) = &packet.payload else {
            return;
        };
        if self.items.is_empty() || self.items.contains(&listing.item_id) {
            self.prices.entry(listing.item_id.clone()).or_default().push(listing.unit_price);
        }
    }

    fn flush_step(&mut self, step: u64) {
        for (item, prices) in self.prices.drain() {
            let min = prices.iter().min().copied().unwrap_or(0);
            let max = prices.iter().max().copied().unwrap_or(0);
            let mean = prices.iter().sum::<Cents>() as f64 / prices.len().max(1) as f64;
            let line = format!("{step},{item},{min},{mean:.2},{max},{}", prices.len());
            write_row(&mut self.file, &self.name, &line);
        }
    }
}

/// Quantity produced per tracked item, per step.
struct ProductionTracker {
    name: String,
    file: File,
    items: Vec<String>,
    produced: HashMap<String, f64>,
}

impl ProductionTracker {
    fn new(name: &str, settings: &CommonSettings, directory: &Path) -> std::io::Result<Self> {
        let file =
            open_csv_with_header(directory, &settings.output_path, "step,item,quantity")?;
        Ok(Self {
            name: format!("{name}.ProductionTracker"),
            file,
            items: settings.items.clone(),
            produced: HashMap::new(),
        })
    }
}

impl StatTracker for ProductionTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn snoop_types(&self) -> Vec<PacketType> {
        vec![PacketType::ProductionNotification]
    }

    fn on_snoop(&mut self, packet: &Packet) {
        let Payload::ProductionNotification { item, .. } = &packet.payload else {
            return;
        };
        if self.items.is_empty() || self.items.contains(&item.item_id) {
            *self.produced.entry(item.item_id.clone()).or_insert(0.0) += item.quantity;
        }
    }

    fn flush_step(&mut self, step: u64) {
        for (item, quantity) in self.produced.drain() {
            let line = format!("{step},{item},{quantity}");
            write_row(&mut self.file, &self.name, &line);
        }
    }
}

/// Accepted labor contracts and their wage statistics, per step.
struct LaborContractTracker {
    name: String,
    file: File,
    accepted: u64,
    total_ticks: u64,
    wages: Vec<Cents>,
}

impl LaborContractTracker {
    fn new(name: &str, settings: &CommonSettings, directory: &Path) -> std::io::Result<Self> {
        let file = open_csv_with_header(
            directory,
            &settings.output_path,
            "step,contracts_accepted,mean_wage_per_tick,total_ticks_per_step",
        )?;
        Ok(Self {
            name: format!("{name}.LaborContractTracker"),
            file,
            accepted: 0,
            total_ticks: 0,
            wages: Vec::new(),
        })
    }
}

impl StatTracker for LaborContractTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn snoop_types(&self) -> Vec<PacketType> {
        vec![PacketType::LaborApplicationAck]
    }

    fn on_snoop(&mut self, packet: &Packet) {
        let Payload::LaborApplicationAck { contract, accepted: true } = &packet.payload else {
            return;
        };
        self.accepted += 1;
        self.total_ticks += contract.ticks_per_step as u64;
        self.wages.push(contract.wage_per_tick);
    }

    fn flush_step(&mut self, step: u64) {
        let mean_wage = if self.wages.is_empty() {
            0.0
        } else {
            self.wages.iter().sum::<Cents>() as f64 / self.wages.len() as f64
        };
        let line = format!("{step},{},{mean_wage:.2},{}", self.accepted, self.total_ticks);
        write_row(&mut self.file, &self.name, &line);
        self.accepted = 0;
        self.total_ticks = 0;
        self.wages.clear();
    }
}

/// Balances of named agents, polled with INFO_REQ at each step.
struct AccountingTracker {
    name: String,
    file: File,
    agents: Vec<AgentId>,
    balances: HashMap<AgentId, Cents>,
}

impl AccountingTracker {
    fn new(name: &str, settings: &CommonSettings, directory: &Path) -> std::io::Result<Self> {
        let file =
            open_csv_with_header(directory, &settings.output_path, "step,agent,balance_cents")?;
        Ok(Self {
            name: format!("{name}.AccountingTracker"),
            file,
            agents: settings.agents.clone(),
            balances: HashMap::new(),
        })
    }
}

impl StatTracker for AccountingTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn snoop_types(&self) -> Vec<PacketType> {
        Vec::new()
    }

    fn on_snoop(&mut self, _packet: &Packet) {}

    fn poll_requests(&self) -> Vec<Packet> {
        self.agents
            .iter()
            .map(|agent_id| {
                Packet::new(
                    STATS_ID,
                    agent_id.clone(),
                    PacketType::InfoReq,
                    Payload::InfoRequest(InfoRequest::new(STATS_ID, agent_id.clone(), "currencyBalance")),
                )
            })
            .collect()
    }

    fn on_info_response(&mut self, request: &InfoRequest, _step: u64) {
        if request.info_key != "currencyBalance" {
            return;
        }
        if let Some(balance) = request.info.as_ref().and_then(|v| v.as_i64()) {
            self.balances.insert(request.agent_id.clone(), balance);
        }
    }

    fn flush_step(&mut self, step: u64) {
        for (agent, balance) in self.balances.drain() {
            let line = format!("{step},{agent},{balance}");
            write_row(&mut self.file, &self.name, &line);
        }
    }
}

// ----------------------------------------------------------------------
// Gatherer
// ----------------------------------------------------------------------

fn build_trackers(config: &StatisticsConfig, output_dir: &Path) -> Vec<Box<dyn StatTracker>> {
    let mut trackers: Vec<Box<dyn StatTracker>> = Vec::new();
    for (stat_name, by_type) in config {
        for (tracker_type, raw_settings) in by_type {
            let settings: CommonSettings = match serde_json::from_value(raw_settings.clone()) {
                Ok(s) => s,
                Err(e) => {
                    error!(target: "stats", stat = %stat_name, error = %e, "bad tracker settings");
                    continue;
                }
            };
            let built: std::io::Result<Box<dyn StatTracker>> = match tracker_type.as_str() {
                "ConsumptionTracker" => ConsumptionTracker::new(stat_name, &settings, output_dir)
                    .map(|t| Box::new(t) as Box<dyn StatTracker>),
                "ItemPriceTracker" => ItemPriceTracker::new(stat_name, &settings, output_dir)
                    .map(|t| Box::new(t) as Box<dyn StatTracker>),
                "ProductionTracker" => ProductionTracker::new(stat_name, &settings, output_dir)
                    .map(|t| Box::new(t) as Box<dyn StatTracker>),
                "LaborContractTracker" => {
                    LaborContractTracker::new(stat_name, &settings, output_dir)
                        .map(|t| Box::new(t) as Box<dyn StatTracker>)
                }
                "AccountingTracker" => AccountingTracker::new(stat_name, &settings, output_dir)
                    .map(|t| Box::new(t) as Box<dyn StatTracker>),
                other => {
                    error!(target: "stats", tracker = other, "unknown tracker type");
                    continue;
                }
            };
            match built {
                Ok(tracker) => {
                    info!(target: "stats", tracker = tracker.name(), "tracker up");
                    trackers.push(tracker);
                }
                Err(e) => error!(target: "stats", error = %e, "tracker file open failed"),
            }
        }
    }
    trackers
}

pub fn spawn_statistics_gatherer(
    link: Link,
    config: StatisticsConfig,
    output_dir: PathBuf,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("stats-gatherer".into())
        .spawn(move || gatherer_loop(link, config, output_dir))
        .expect("failed to spawn statistics gatherer")
}

fn gatherer_loop(link: Link, config: StatisticsConfig, output_dir: PathBuf) {
    let mut trackers = build_trackers(&config, &output_dir);
    let mut step: u64 = 0;
    let mut step_open = false;

    info!(target: "stats", trackers = trackers.len(), "statistics gatherer up");
    while let Ok(packet) = link.recv() {
        match packet.packet_type {
            PacketType::KillPipeAgent | PacketType::KillAllBroadcast => {
                if step_open {
                    for tracker in trackers.iter_mut() {
                        tracker.flush_step(step);
                    }
                }
                let kill =
                    Packet::new(STATS_ID, STATS_ID, PacketType::KillPipeNetwork, Payload::Empty);
                let _ = link.send(kill);
                break;
            }

            PacketType::ControllerStart | PacketType::ControllerStartBroadcast => {
                // One aggregate snoop request covering every tracker.
                let mut types: Vec<PacketType> = trackers
                    .iter()
                    .flat_map(|tracker| tracker.snoop_types())
                    .collect();
                types.sort();
                types.dedup();
                if !types.is_empty() {
                    let snoop = Packet::new(
                        STATS_ID,
                        NETWORK_ID,
                        PacketType::SnoopStart,
                        Payload::SnoopStart(types),
                    );
                    let _ = link.send(snoop);
                }
            }

            PacketType::TickGrant | PacketType::TickGrantBroadcast => {
                if let Payload::TickGrant { step: new_step, .. } = packet.payload {
                    if step_open {
                        for tracker in trackers.iter_mut() {
                            tracker.flush_step(step);
                        }
                    }
                    step = new_step;
                    step_open = true;
                    for tracker in trackers.iter() {
                        for request in tracker.poll_requests() {
                            let _ = link.send(request);
                        }
                    }
                }
            }

            PacketType::Snoop => {
                if let Payload::Wrapped(inner) = &packet.payload {
                    debug!(target: "stats", inner = %inner, "snooped packet");
                    for tracker in trackers.iter_mut() {
                        if tracker.snoop_types().contains(&inner.packet_type) {
                            tracker.on_snoop(inner);
                        }
                    }
                }
            }

            PacketType::InfoResp => {
                if let Payload::InfoRequest(request) = &packet.payload {
                    for tracker in trackers.iter_mut() {
                        tracker.on_info_response(request, step);
                    }
                }
            }

            PacketType::ControllerMsg | PacketType::ControllerMsgBroadcast => {
                if let Payload::Wrapped(inner) = &packet.payload {
                    if inner.packet_type == PacketType::StopTrading && step_open {
                        for tracker in trackers.iter_mut() {
                            tracker.flush_step(step);
                        }
                        step_open = false;
                    }
                }
            }

            PacketType::Error => {
                warn!(target: "stats", %packet, "error packet");
            }

            _ => {}
        }
    }
    info!(target: "stats", "statistics gatherer down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_pair;
    use crate::trade::{ItemContainer, TradeRequest};
    use std::time::Duration;

    fn tick_grant(step: u64) -> Packet {
        Packet::broadcast(
            "SimulationManager",
            PacketType::TickGrantBroadcast,
            Payload::TickGrant { ticks: 4, step },
        )
    }

    fn snooped_trade_ack(amount: Cents) -> Packet {
        let request =
            TradeRequest::new("home.Consumer.0", "farm.Seller.0", ItemContainer::new("apple", 2.0), amount);
        let inner = Packet::new(
            "farm.Seller.0",
            "home.Consumer.0",
            PacketType::TradeReqAck,
            Payload::TradeRequestAck { request, accepted: true },
        );
        Packet::new(NETWORK_ID, STATS_ID, PacketType::Snoop, Payload::Wrapped(Box::new(inner)))
    }

    #[test]
    fn test_consumption_rows_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let config: StatisticsConfig = HashMap::from([(
            "household".to_string(),
            HashMap::from([(
                "ConsumptionTracker".to_string(),
                serde_json::json!({"OuputPath": "Consumption.csv", "ConsumerClasses": ["Consumer"]}),
            )]),
        )]);

        let (gatherer_end, test_end) = link_pair();
        let handle = spawn_statistics_gatherer(gatherer_end, config, dir.path().to_path_buf());

        test_end
            .send(Packet::broadcast("m", PacketType::ControllerStartBroadcast, Payload::Empty))
            .unwrap();
        // Snoop request goes out.
        let snoop = test_end.recv().unwrap();
        assert_eq!(snoop.packet_type, PacketType::SnoopStart);

        test_end.send(tick_grant(0)).unwrap();
        test_end.send(snooped_trade_ack(30)).unwrap();
        test_end.send(snooped_trade_ack(25)).unwrap();
        test_end.send(tick_grant(1)).unwrap();
        test_end.send(snooped_trade_ack(10)).unwrap();
        test_end
            .send(Packet::broadcast("m", PacketType::KillAllBroadcast, Payload::Empty))
            .unwrap();
        // Gatherer replies KILL_PIPE_NETWORK before exiting.
        loop {
            match test_end.recv_timeout(Duration::from_secs(2)) {
                Ok(p) if p.packet_type == PacketType::KillPipeNetwork => break,
                Ok(_) => continue,
                Err(e) => panic!("gatherer did not shut down: {e}"),
            }
        }
        handle.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("Consumption.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "step,consumption_cents");
        assert_eq!(lines[1], "0,55");
        assert_eq!(lines[2], "1,10");
    }
}
