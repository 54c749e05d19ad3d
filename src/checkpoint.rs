//! Checkpoints are directory trees: one version-tagged JSON file per agent,
//! plus one per marketplace and one for the manager. Loading rejects any
//! other format version deterministically.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agent::accounting::Ledger;
use crate::agent::nutrition::NutritionTracker;
use crate::agent::production::{LaborPool, RecipeProduction};
use crate::agent::LandHolding;
use crate::error::{Result, SimError};
use crate::packets::Cents;
use crate::trade::{ItemListing, LaborContract, LandListing};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Complete serialized agent state, including the controller's opaque blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub version: u32,
    pub agent_id: String,
    pub controller_type: String,
    pub skill_level: f64,
    pub balance: Cents,
    pub ledger: Ledger,
    pub inventory: HashMap<String, f64>,
    pub land: HashMap<String, LandHolding>,
    pub contracts_as_employer: Vec<LaborContract>,
    pub contracts_as_worker: Vec<LaborContract>,
    pub labor_pool: LaborPool,
    pub ticks_remaining: u32,
    pub committed_ticks: u32,
    pub committed_next_step: u32,
    pub step: u64,
    pub nutrition: Option<NutritionTracker>,
    pub production: HashMap<String, RecipeProduction>,
    pub my_item_listings: HashMap<String, ItemListing>,
    pub my_land_listings: HashMap<String, LandListing>,
    #[serde(default)]
    pub controller_state: Vec<u8>,
}

/// Non-agent state (marketplace stores, manager step counter) saved under a
/// well-known name.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile<T> {
    version: u32,
    state: T,
}

fn file_name(id: &str) -> String {
    format!("{id}.json")
}

pub fn save_agent(directory: &Path, checkpoint: &AgentCheckpoint) -> Result<()> {
    fs::create_dir_all(directory)?;
    let path = directory.join(file_name(&checkpoint.agent_id));
    let encoded = serde_json::to_vec_pretty(checkpoint)?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_agent(directory: &Path, agent_id: &str) -> Result<AgentCheckpoint> {
    let path = directory.join(file_name(agent_id));
    let bytes = fs::read(&path)?;
    let checkpoint: AgentCheckpoint = serde_json::from_slice(&bytes)?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(SimError::Fatal(format!(
            "checkpoint {} has version {}, expected {}",
            path.display(),
            checkpoint.version,
            CHECKPOINT_VERSION
        )));
    }
    Ok(checkpoint)
}

pub fn save_store<T: Serialize>(directory: &Path, name: &str, state: &T) -> Result<()> {
    fs::create_dir_all(directory)?;
    let file = StoreFile { version: CHECKPOINT_VERSION, state };
    let encoded = serde_json::to_vec_pretty(&file)?;
    fs::write(directory.join(file_name(name)), encoded)?;
    Ok(())
}

pub fn load_store<T: DeserializeOwned>(directory: &Path, name: &str) -> Result<T> {
    let path = directory.join(file_name(name));
    let bytes = fs::read(&path)?;
    let file: StoreFile<T> = serde_json::from_slice(&bytes)?;
    if file.version != CHECKPOINT_VERSION {
        return Err(SimError::Fatal(format!(
            "checkpoint {} has version {}, expected {}",
            path.display(),
            file.version,
            CHECKPOINT_VERSION
        )));
    }
    Ok(file.state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_checkpoint() -> AgentCheckpoint {
        AgentCheckpoint {
            version: CHECKPOINT_VERSION,
            agent_id: "farm.Producer.0".into(),
            controller_type: "Null".into(),
            skill_level: 0.42,
            balance: 1234,
            ledger: Ledger::default(),
            inventory: HashMap::from([("apple".into(), 6.0)]),
            land: HashMap::from([(
                "apple".into(),
                LandHolding { allocated: 2.0, unallocated: 1.0 },
            )]),
            contracts_as_employer: vec![],
            contracts_as_worker: vec![],
            labor_pool: LaborPool::default(),
            ticks_remaining: 8,
            committed_ticks: 0,
            committed_next_step: 0,
            step: 7,
            nutrition: None,
            production: HashMap::new(),
            my_item_listings: HashMap::new(),
            my_land_listings: HashMap::new(),
            controller_state: b"opaque".to_vec(),
        }
    }

    #[test]
    fn test_agent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = sample_checkpoint();
        save_agent(dir.path(), &checkpoint).unwrap();
        let loaded = load_agent(dir.path(), "farm.Producer.0").unwrap();
        assert_eq!(loaded.balance, 1234);
        assert_eq!(loaded.inventory["apple"], 6.0);
        assert_eq!(loaded.step, 7);
        assert_eq!(loaded.controller_state, b"opaque");
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = sample_checkpoint();
        checkpoint.version = 99;
        save_agent(dir.path(), &checkpoint).unwrap();
        match load_agent(dir.path(), "farm.Producer.0") {
            Err(SimError::Fatal(_)) => {}
            other => panic!("expected fatal version error, got {other:?}"),
        }
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let listings = vec![ItemListing::new("s", "apple", 5, 10.0)];
        save_store(dir.path(), "ItemMarketplace", &listings).unwrap();
        let loaded: Vec<ItemListing> = load_store(dir.path(), "ItemMarketplace").unwrap();
        assert_eq!(loaded, listings);
    }
}
