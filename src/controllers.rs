//! Controller interface and the built-in basic controllers.
//!
//! A controller is the decision policy plugged into an agent; the runtime is
//! deliberately policy-free. Domain controllers live outside this crate —
//! the ones here exist so a simulation can be wired and exercised end to
//! end.

use tracing::{info, warn};

use crate::agent::Agent;
use crate::packets::Packet;
use crate::trade::{LaborContract, LandTradeRequest, TradeRequest};

/// The decision surface called by the agent runtime. All calls for one
/// agent are serialized.
pub trait Controller: Send {
    fn name(&self) -> &str;

    fn on_start(&mut self, _agent: &Agent) {}
    fn on_packet(&mut self, _agent: &Agent, _packet: &Packet) {}
    fn on_tick_grant(&mut self, _agent: &Agent, _ticks: u32, _step: u64) {}

    fn eval_trade_request(&mut self, _agent: &Agent, _request: &TradeRequest) -> bool {
        false
    }
    fn eval_land_trade_request(&mut self, _agent: &Agent, _request: &LandTradeRequest) -> bool {
        false
    }
    fn eval_job_application(&mut self, _agent: &Agent, _contract: &LaborContract) -> bool {
        false
    }

    /// Opaque state blob carried through checkpoints.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }
    fn load_state(&mut self, _bytes: &[u8]) {}
}

/// Takes no actions at all and rejects every request. An agent with this
/// controller is pure bookkeeping, driven entirely by its counterparties.
pub struct NullController {
    name: String,
}

impl NullController {
    pub fn new(agent_id: &str) -> Self {
        Self { name: format!("{agent_id}_NullController") }
    }
}

impl Controller for NullController {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Accepts every request that is possible given current holdings, and takes
/// no other action.
pub struct PushoverController {
    name: String,
}

impl PushoverController {
    pub fn new(agent_id: &str) -> Self {
        Self { name: format!("{agent_id}_PushoverController") }
    }
}

impl Controller for PushoverController {
    fn name(&self) -> &str {
        &self.name
    }

    fn eval_trade_request(&mut self, agent: &Agent, request: &TradeRequest) -> bool {
        let accepted = if agent.id() == request.buyer_id {
            request.currency_amount <= agent.balance()
        } else if agent.id() == request.seller_id {
            agent.inventory_quantity(&request.item.item_id) >= request.item.quantity
        } else {
            false
        };
        info!(controller = %self.name, accepted, "evaluated trade request");
        accepted
    }

    fn eval_land_trade_request(&mut self, agent: &Agent, request: &LandTradeRequest) -> bool {
        if agent.id() == request.seller_id {
            agent.land_holding(&request.allocation).unallocated >= request.hectares
        } else {
            agent.id() == request.buyer_id && request.currency_amount <= agent.balance()
        }
    }

    fn eval_job_application(&mut self, _agent: &Agent, _contract: &LaborContract) -> bool {
        true
    }
}

/// Participates in the step barrier but does nothing with its time:
/// subscribes to tick blocking at start and relinquishes every grant.
pub struct IdleController {
    name: String,
}

impl IdleController {
    pub fn new(agent_id: &str) -> Self {
        Self { name: format!("{agent_id}_IdleController") }
    }
}

impl Controller for IdleController {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, agent: &Agent) {
        agent.subscribe_tick_blocking();
    }

    fn on_tick_grant(&mut self, agent: &Agent, _ticks: u32, _step: u64) {
        agent.relinquish_time_ticks();
    }
}

/// Resolve a `controllerType` string from the configuration to a controller
/// instance. Unknown types fall back to `NullController` with a warning so a
/// typo does not stall the whole launch.
pub fn build_controller(controller_type: &str, agent_id: &str) -> Box<dyn Controller> {
    match controller_type {
        "Null" | "NullController" => Box::new(NullController::new(agent_id)),
        "Pushover" | "PushoverController" => Box::new(PushoverController::new(agent_id)),
        "Idle" | "IdleController" => Box::new(IdleController::new(agent_id)),
        other => {
            warn!(target: "agent", controller = other, agent = agent_id, "unknown controller type, using Null");
            Box::new(NullController::new(agent_id))
        }
    }
}
