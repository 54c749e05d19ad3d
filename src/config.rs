//! Simulation configuration loading.
//!
//! The top-level JSON names the simulation, the process/step/tick settings,
//! the agent spawn table and the statistics trackers. Item definitions live
//! in their own directory of JSON files referenced by `ItemSettings`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::agent::production::ItemDef;
use crate::agent::{AgentBlueprint, AgentSettings};
use crate::error::{Result, SimError};
use crate::manager::MANAGER_ID;
use crate::stats::StatisticsConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(rename = "AgentNumProcesses")]
    pub agent_num_processes: usize,
    #[serde(rename = "SimulationSteps")]
    pub simulation_steps: u64,
    #[serde(rename = "TicksPerStep")]
    pub ticks_per_step: u32,
    #[serde(rename = "CheckpointFrequency", default)]
    pub checkpoint_frequency: Option<u64>,
    #[serde(rename = "InitialCheckpoint", default)]
    pub initial_checkpoint: Option<PathBuf>,
    /// Directory of item definition JSON files.
    #[serde(rename = "ItemSettings", default)]
    pub item_settings: Option<PathBuf>,
    /// spawn prefix -> controller type -> spawn block.
    #[serde(rename = "AgentSpawns", default)]
    pub agent_spawns: HashMap<String, HashMap<String, SpawnBlock>>,
    #[serde(rename = "Statistics", default)]
    pub statistics: StatisticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnBlock {
    pub quantity: usize,
    #[serde(default)]
    pub settings: AgentSettings,
}

pub fn load_config(path: &Path) -> Result<SimulationConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| SimError::Fatal(format!("cannot read config {}: {e}", path.display())))?;
    let config: SimulationConfig = serde_json::from_str(&raw)
        .map_err(|e| SimError::Fatal(format!("invalid config {}: {e}", path.display())))?;

    if config.settings.simulation_steps == 0 {
        return Err(SimError::Fatal("SimulationSteps must be positive".into()));
    }
    if config.settings.ticks_per_step == 0 {
        return Err(SimError::Fatal("TicksPerStep must be positive".into()));
    }
    if let Some(description) = &config.description {
        info!(target: "manager", sim = %config.name, "{description}");
    }
    Ok(config)
}

/// Gather all item definitions under the item directory (one JSON file per
/// item; one level of subdirectories, as the data packs are organized by
/// category).
pub fn load_items(directory: &Path) -> Result<HashMap<String, ItemDef>> {
    let mut items = HashMap::new();
    if !directory.exists() {
        return Err(SimError::Fatal(format!(
            "item directory {} does not exist",
            directory.display()
        )));
    }
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            for sub in fs::read_dir(&path)? {
                paths.push(sub?.path());
            }
        } else {
            paths.push(path);
        }
    }
    for path in paths {
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str::<ItemDef>(&raw) {
            Ok(def) => {
                items.insert(def.id.clone(), def);
            }
            Err(e) => warn!(target: "manager", file = %path.display(), error = %e, "skipping bad item file"),
        }
    }
    info!(target: "manager", count = items.len(), "item definitions loaded");
    Ok(items)
}

/// Expand the spawn table into per-process blueprint batches. Agent ids are
/// `prefix.controllerType.index`; agents are dealt round-robin across
/// processes.
pub fn build_blueprints(config: &SimulationConfig) -> Vec<Vec<AgentBlueprint>> {
    let processes = config.settings.agent_num_processes.max(1);
    let mut batches: Vec<Vec<AgentBlueprint>> = vec![Vec::new(); processes];

    for (prefix, by_controller) in &config.settings.agent_spawns {
        for (controller_type, block) in by_controller {
            for index in 0..block.quantity {
                let agent_id = format!("{prefix}.{controller_type}.{index}");
                let blueprint = AgentBlueprint {
                    agent_id,
                    controller_type: controller_type.clone(),
                    ticks_per_step: config.settings.ticks_per_step,
                    manager_id: MANAGER_ID.to_string(),
                    settings: block.settings.clone(),
                };
                batches[index % processes].push(blueprint);
            }
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "name": "micro",
        "description": "two traders",
        "settings": {
            "AgentNumProcesses": 2,
            "SimulationSteps": 10,
            "TicksPerStep": 8,
            "AgentSpawns": {
                "farm": {"Pushover": {"quantity": 3, "settings": {"initial_balance": 1000}}}
            },
            "Statistics": {
                "consumption": {"ConsumptionTracker": {"OuputPath": "Consumption.csv"}}
            }
        }
    }"#;

    #[test]
    fn test_parse_and_expand() {
        let config: SimulationConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.settings.agent_num_processes, 2);
        let batches = build_blueprints(&config);
        assert_eq!(batches.len(), 2);
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 3);
        let all_ids: Vec<&str> = batches
            .iter()
            .flatten()
            .map(|blueprint| blueprint.agent_id.as_str())
            .collect();
        assert!(all_ids.contains(&"farm.Pushover.0"));
        assert!(all_ids.contains(&"farm.Pushover.2"));
        let blueprint = &batches[0][0];
        assert_eq!(blueprint.settings.initial_balance, 1000);
        assert_eq!(blueprint.ticks_per_step, 8);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"name": "bad", "settings": {"AgentNumProcesses": 1, "SimulationSteps": 0, "TicksPerStep": 4}}"#,
        )
        .unwrap();
        assert!(matches!(load_config(&path), Err(SimError::Fatal(_))));
    }

    #[test]
    fn test_item_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("apple.json"),
            r#"{"id": "apple", "unit": "kg", "nutrients": {"calories": 52.0}}"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("grain")).unwrap();
        std::fs::write(
            dir.path().join("grain").join("wheat.json"),
            r#"{"id": "wheat", "unit": "kg"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an item").unwrap();

        let items = load_items(dir.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.contains_key("apple"));
        assert!(items.contains_key("wheat"));
    }
}
