//! econ-sim: the simulation substrate for a multi-agent economic simulator.
//!
//! A hub-and-spoke packet fabric (`network`) connects generic transactional
//! agents (`agent`), three marketplace billboards (`markets`), a statistics
//! observer (`stats`) and the step-barrier time authority (`manager`),
//! optionally across OS processes (`wire`, `worker`). The `runner` wires a
//! whole simulation from a JSON config.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod controllers;
pub mod error;
pub mod link;
pub mod manager;
pub mod markets;
pub mod network;
pub mod packets;
pub mod runner;
pub mod stats;
pub mod trade;
pub mod wire;
pub mod worker;

/// Short random salt for transaction and payment ids.
pub fn fresh_salt() -> String {
    use rand::Rng;
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}
