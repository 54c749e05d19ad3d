//! Value types carried inside packets: item containers, marketplace
//! listings, trade requests and labor contracts.

use std::fmt;
use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};

use crate::packets::{AgentId, Cents};

/// A quantity of a single item. Containers of the same item compose by
/// addition; quantities are non-negative reals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemContainer {
    pub item_id: String,
    pub quantity: f64,
}

impl ItemContainer {
    pub fn new(item_id: impl Into<String>, quantity: f64) -> Self {
        Self { item_id: item_id.into(), quantity }
    }
}

impl AddAssign<&ItemContainer> for ItemContainer {
    fn add_assign(&mut self, other: &ItemContainer) {
        debug_assert_eq!(self.item_id, other.item_id);
        self.quantity += other.quantity;
    }
}

impl SubAssign<&ItemContainer> for ItemContainer {
    fn sub_assign(&mut self, other: &ItemContainer) {
        debug_assert_eq!(self.item_id, other.item_id);
        self.quantity -= other.quantity;
    }
}

impl fmt::Display for ItemContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.quantity, self.item_id)
    }
}

/// An advertised item offer. Identity is `(seller_id, item_id)`: a seller
/// has at most one active listing per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemListing {
    pub seller_id: AgentId,
    pub item_id: String,
    pub unit_price: Cents,
    pub max_quantity: f64,
    #[serde(default)]
    pub last_updated: u64,
}

impl ItemListing {
    pub fn new(seller_id: impl Into<AgentId>, item_id: impl Into<String>, unit_price: Cents, max_quantity: f64) -> Self {
        Self {
            seller_id: seller_id.into(),
            item_id: item_id.into(),
            unit_price,
            max_quantity,
            last_updated: 0,
        }
    }
}

/// An advertised job offer. Identity is `(employer_id, listing_tag)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborListing {
    pub employer_id: AgentId,
    pub listing_tag: String,
    pub skill_level: f64,
    pub wage_per_tick: Cents,
    pub ticks_per_step: u32,
    pub contract_length: u64,
    pub applicants_considered: u32,
    #[serde(default)]
    pub last_updated: u64,
}

impl LaborListing {
    /// Build the contract a worker applies with. `end_step` is inclusive.
    pub fn generate_contract(&self, worker_id: &str, worker_skill: f64, start_step: u64) -> LaborContract {
        LaborContract {
            employer_id: self.employer_id.clone(),
            worker_id: worker_id.to_string(),
            skill_level: worker_skill,
            wage_per_tick: self.wage_per_tick,
            ticks_per_step: self.ticks_per_step,
            contract_length: self.contract_length,
            start_step,
            end_step: start_step + self.contract_length.saturating_sub(1),
            contract_id: format!(
                "contract_{}_{}_{}_{}",
                self.employer_id, worker_id, self.listing_tag, start_step
            ),
        }
    }
}

/// An advertised land offer. Identity is `(seller_id, allocation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandListing {
    pub seller_id: AgentId,
    pub allocation: String,
    pub hectares: f64,
    pub price_per_hectare: Cents,
}

/// An agreed employment relationship. At most one is active per
/// `(employer, worker, skill_level)` at any step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborContract {
    pub employer_id: AgentId,
    pub worker_id: AgentId,
    pub skill_level: f64,
    pub wage_per_tick: Cents,
    pub ticks_per_step: u32,
    pub contract_length: u64,
    pub start_step: u64,
    pub end_step: u64,
    pub contract_id: String,
}

impl LaborContract {
    pub fn active_at(&self, step: u64) -> bool {
        step >= self.start_step && step <= self.end_step
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub item: ItemContainer,
    pub currency_amount: Cents,
    pub request_id: String,
}

impl TradeRequest {
    pub fn new(buyer_id: impl Into<AgentId>, seller_id: impl Into<AgentId>, item: ItemContainer, currency_amount: Cents) -> Self {
        let buyer_id = buyer_id.into();
        let seller_id = seller_id.into();
        let request_id = format!(
            "trade_{}_{}_{}_{}_{}",
            buyer_id,
            seller_id,
            item.item_id,
            item.quantity,
            crate::fresh_salt(),
        );
        Self { buyer_id, seller_id, item, currency_amount, request_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandTradeRequest {
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub allocation: String,
    pub hectares: f64,
    pub currency_amount: Cents,
    pub request_id: String,
}

impl LandTradeRequest {
    pub fn new(
        buyer_id: impl Into<AgentId>,
        seller_id: impl Into<AgentId>,
        allocation: impl Into<String>,
        hectares: f64,
        currency_amount: Cents,
    ) -> Self {
        let buyer_id = buyer_id.into();
        let seller_id = seller_id.into();
        let allocation = allocation.into();
        let request_id = format!(
            "landtrade_{}_{}_{}_{}_{}",
            buyer_id,
            seller_id,
            allocation,
            hectares,
            crate::fresh_salt(),
        );
        Self { buyer_id, seller_id, allocation, hectares, currency_amount, request_id }
    }
}

/// A remote state query answered over INFO_REQ / INFO_RESP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoRequest {
    pub requester_id: AgentId,
    pub agent_id: AgentId,
    pub info_key: String,
    pub info: Option<serde_json::Value>,
}

impl InfoRequest {
    pub fn new(requester_id: impl Into<AgentId>, agent_id: impl Into<AgentId>, info_key: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            agent_id: agent_id.into(),
            info_key: info_key.into(),
            info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_compose() {
        let mut a = ItemContainer::new("apple", 2.5);
        a += &ItemContainer::new("apple", 1.5);
        assert_eq!(a.quantity, 4.0);
        a -= &ItemContainer::new("apple", 4.0);
        assert_eq!(a.quantity, 0.0);
    }

    #[test]
    fn test_contract_generation() {
        let listing = LaborListing {
            employer_id: "farm.Employer.0".into(),
            listing_tag: "harvest".into(),
            skill_level: 0.3,
            wage_per_tick: 12,
            ticks_per_step: 8,
            contract_length: 5,
            applicants_considered: 3,
            last_updated: 0,
        };
        let contract = listing.generate_contract("w.Worker.1", 0.4, 10);
        assert_eq!(contract.start_step, 10);
        assert_eq!(contract.end_step, 14);
        assert!(contract.active_at(14));
        assert!(!contract.active_at(15));
        assert_eq!(contract.wage_per_tick, 12);
    }

    #[test]
    fn test_request_ids_unique() {
        let a = TradeRequest::new("b", "s", ItemContainer::new("apple", 1.0), 5);
        let b = TradeRequest::new("b", "s", ItemContainer::new("apple", 1.0), 5);
        assert_ne!(a.request_id, b.request_id);
    }
}
