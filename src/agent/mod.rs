//! The generic agent runtime.
//!
//! An `Agent` owns its economic state (balance, inventory, land, labor
//! contracts, counters) and exposes the packet-driven surface every
//! participant uses: transactional transfers, trades, labor, production,
//! marketplace calls and checkpointing. Decision making lives in the
//! attached `Controller`; the runtime only guarantees bookkeeping
//! consistency.
//!
//! One reader thread drains the network link and dispatches. Multi-packet
//! protocols are labeled with a transaction id and park on a single-use
//! rendezvous; the reader completes the rendezvous when the matching ack
//! arrives. Handlers that themselves run nested protocols (trade requests,
//! labor applications, tick grants) are handed off to short-lived threads so
//! the reader never blocks.
//!
//! Lock order, where two families must be held together:
//! production -> inventory -> land -> labor. Everything else takes one
//! family lock at a time.

pub mod accounting;
pub mod nutrition;
pub mod production;
pub mod utility;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::controllers::Controller;
use crate::error::{Result, SimError};
use crate::link::{rendezvous, Link};
use crate::markets::{ITEM_MARKET_ID, LABOR_MARKET_ID, LAND_MARKET_ID};
use crate::network::NETWORK_ID;
use crate::packets::{AgentId, Cents, Packet, PacketType, Payload};
use crate::trade::{
    ItemContainer, ItemListing, LaborContract, LaborListing, LandListing, LandTradeRequest,
    TradeRequest,
};

use accounting::{FlowKind, Ledger, DEFAULT_EMA_ALPHA};
use nutrition::{NutritionSettings, NutritionTracker};
use production::{ItemDef, LaborPool, ProductionFunction, ProductionView, RecipeProduction};
use utility::UtilityFunction;

/// Hectares of one allocation, split by whether they are committed to
/// production. Only the unallocated part is transferrable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandHolding {
    pub allocated: f64,
    pub unallocated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDistribution {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for SkillDistribution {
    fn default() -> Self {
        Self { alpha: 2.0, beta: 5.0 }
    }
}

/// Per-spawn settings, parsed from the `settings` block of an AgentSpawns
/// entry. Unknown keys are preserved for the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub initial_balance: Cents,
    pub initial_inventory: HashMap<String, f64>,
    /// allocation -> unallocated hectares.
    pub initial_land: HashMap<String, f64>,
    pub skill_distribution: Option<SkillDistribution>,
    pub nutrition: Option<NutritionSettings>,
    pub transaction_timeout_ms: Option<u64>,
    /// Accounting EMA smoothing factor override.
    pub ema_alpha: Option<f64>,
    #[serde(flatten)]
    pub controller: serde_json::Map<String, serde_json::Value>,
}

/// Plain-data description from which an agent is instantiated in its host
/// process. Thread primitives never cross the process boundary; blueprints
/// do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBlueprint {
    pub agent_id: AgentId,
    pub controller_type: String,
    pub ticks_per_step: u32,
    pub manager_id: AgentId,
    pub settings: AgentSettings,
}

struct BalanceState {
    balance: Cents,
    ledger: Ledger,
}

struct TimeState {
    ticks_remaining: u32,
    ticks_per_step: u32,
    tick_blocked: bool,
    step: u64,
    committed_ticks: u32,
    committed_next_step: u32,
}

#[derive(Default)]
struct LaborState {
    as_employer: HashMap<String, LaborContract>,
    as_worker: HashMap<String, LaborContract>,
    pool: LaborPool,
}

struct Inner {
    id: AgentId,
    controller_type: String,
    manager_id: AgentId,
    outbound: Sender<Packet>,

    pending: Mutex<HashMap<String, Sender<Packet>>>,

    balance: Mutex<BalanceState>,
    inventory: Mutex<HashMap<String, f64>>,
    land: Mutex<HashMap<String, LandHolding>>,
    labor: Mutex<LaborState>,
    time: Mutex<TimeState>,
    nutrition: Option<Mutex<NutritionTracker>>,

    /// The agent's own active listings, kept for re-validation of incoming
    /// trade requests against the advertised terms.
    my_item_listings: Mutex<HashMap<String, ItemListing>>,
    my_land_listings: Mutex<HashMap<String, LandListing>>,

    utility: HashMap<String, UtilityFunction>,
    production: Mutex<HashMap<String, RecipeProduction>>,
    items: Arc<HashMap<String, ItemDef>>,

    controller: Mutex<Box<dyn Controller>>,
    controller_started: AtomicBool,
    shutting_down: AtomicBool,

    skill_level: f64,
    txn_timeout: Duration,
    ema_alpha: f64,

    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap cloneable handle to a running agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    /// Instantiate an agent from its blueprint and attach the reader thread
    /// to the given network link.
    pub fn spawn(
        blueprint: AgentBlueprint,
        link: Link,
        items: Arc<HashMap<String, ItemDef>>,
        controller: Box<dyn Controller>,
    ) -> Agent {
        let mut rng = rand::thread_rng();
        let skill_dist = blueprint.settings.skill_distribution.clone().unwrap_or_default();
        let skill_level = Beta::new(skill_dist.alpha, skill_dist.beta)
            .map(|beta| beta.sample(&mut rng))
            .unwrap_or(0.0);

        let mut utility = HashMap::new();
        for (item_id, def) in items.iter() {
            if let Some(params) = &def.utility {
                utility.insert(
                    item_id.clone(),
                    UtilityFunction::sample(&params.base_utility, &params.diminishing_factor, &mut rng),
                );
            }
        }

        let settings = &blueprint.settings;
        let inventory: HashMap<String, f64> = settings
            .initial_inventory
            .iter()
            .filter(|(_, q)| **q > 0.0)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let land: HashMap<String, LandHolding> = settings
            .initial_land
            .iter()
            .map(|(allocation, hectares)| {
                (allocation.clone(), LandHolding { allocated: 0.0, unallocated: *hectares })
            })
            .collect();

        let inner = Arc::new(Inner {
            id: blueprint.agent_id.clone(),
            controller_type: blueprint.controller_type.clone(),
            manager_id: blueprint.manager_id.clone(),
            outbound: link.sender(),
            pending: Mutex::new(HashMap::new()),
            balance: Mutex::new(BalanceState {
                balance: settings.initial_balance,
                ledger: Ledger::default(),
            }),
            inventory: Mutex::new(inventory),
            land: Mutex::new(land),
            labor: Mutex::new(LaborState::default()),
            time: Mutex::new(TimeState {
                ticks_remaining: 0,
                ticks_per_step: blueprint.ticks_per_step,
                tick_blocked: false,
                step: 0,
                committed_ticks: 0,
                committed_next_step: 0,
            }),
            nutrition: settings
                .nutrition
                .clone()
                .map(|settings| Mutex::new(NutritionTracker::new(settings))),
            my_item_listings: Mutex::new(HashMap::new()),
            my_land_listings: Mutex::new(HashMap::new()),
            utility,
            production: Mutex::new(HashMap::new()),
            items,
            controller: Mutex::new(controller),
            controller_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            skill_level,
            txn_timeout: Duration::from_millis(settings.transaction_timeout_ms.unwrap_or(2_000)),
            ema_alpha: settings.ema_alpha.unwrap_or(DEFAULT_EMA_ALPHA),
            reader: Mutex::new(None),
        });

        let agent = Agent { inner };
        info!(target: "agent", id = %agent.id(), "agent instantiated");

        let reader_agent = agent.clone();
        let receiver = link.receiver();
        let handle = thread::Builder::new()
            .name(format!("agent-{}", agent.id()))
            .spawn(move || reader_loop(reader_agent, receiver))
            .expect("failed to spawn agent reader");
        *agent.inner.reader.lock().expect("reader lock poisoned") = Some(handle);
        agent
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn skill_level(&self) -> f64 {
        self.inner.skill_level
    }

    pub fn current_step(&self) -> u64 {
        self.inner.time.lock().expect("time lock poisoned").step
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Block until the reader thread exits (after a kill packet).
    pub fn join(&self) {
        let handle = self.inner.reader.lock().expect("reader lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Introspection (used by controllers and tests)
    // ------------------------------------------------------------------

    pub fn balance(&self) -> Cents {
        self.inner.balance.lock().expect("balance lock poisoned").balance
    }

    pub fn ledger(&self) -> Ledger {
        self.inner.balance.lock().expect("balance lock poisoned").ledger.clone()
    }

    pub fn inventory_quantity(&self, item_id: &str) -> f64 {
        self.inner
            .inventory
            .lock()
            .expect("inventory lock poisoned")
            .get(item_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn land_holding(&self, allocation: &str) -> LandHolding {
        self.inner
            .land
            .lock()
            .expect("land lock poisoned")
            .get(allocation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn ticks_remaining(&self) -> u32 {
        self.inner.time.lock().expect("time lock poisoned").ticks_remaining
    }

    pub fn worker_contracts(&self) -> Vec<LaborContract> {
        self.inner.labor.lock().expect("labor lock poisoned").as_worker.values().cloned().collect()
    }

    pub fn employer_contracts(&self) -> Vec<LaborContract> {
        self.inner
            .labor
            .lock()
            .expect("labor lock poisoned")
            .as_employer
            .values()
            .cloned()
            .collect()
    }

    pub fn is_hungry(&self) -> bool {
        self.inner
            .nutrition
            .as_ref()
            .map(|n| n.lock().expect("nutrition lock poisoned").hungry)
            .unwrap_or(false)
    }

    pub fn marginal_utility(&self, item_id: &str) -> f64 {
        let quantity = self.inventory_quantity(item_id);
        self.inner
            .utility
            .get(item_id)
            .map(|f| f.marginal_utility(quantity))
            .unwrap_or(0.0)
    }

    // ------------------------------------------------------------------
    // Mint primitives (setup only; exempt from conservation)
    // ------------------------------------------------------------------

    pub fn mint_currency(&self, cents: Cents) {
        self.inner.balance.lock().expect("balance lock poisoned").balance += cents;
    }

    pub fn mint_item(&self, container: ItemContainer) {
        *self
            .inner
            .inventory
            .lock()
            .expect("inventory lock poisoned")
            .entry(container.item_id)
            .or_insert(0.0) += container.quantity;
    }

    pub fn mint_land(&self, allocation: &str, hectares: f64) {
        self.inner
            .land
            .lock()
            .expect("land lock poisoned")
            .entry(allocation.to_string())
            .or_default()
            .unallocated += hectares;
    }

    // ------------------------------------------------------------------
    // Packet plumbing
    // ------------------------------------------------------------------

    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        debug!(target: "agent", id = %self.id(), %packet, "OUTBOUND");
        self.inner.outbound.send(packet).map_err(|_| SimError::LinkClosed)
    }

    fn register_wait(&self, transaction_id: &str) -> Receiver<Packet> {
        let (tx, rx) = rendezvous();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(transaction_id.to_string(), tx);
        rx
    }

    fn cancel_wait(&self, transaction_id: &str) {
        self.inner.pending.lock().expect("pending lock poisoned").remove(transaction_id);
    }

    /// Post a packet to the rendezvous registered under its transaction id,
    /// retiring the entry. Returns false if nobody was waiting.
    fn complete_wait(&self, packet: &Packet) -> bool {
        let Some(transaction_id) = packet.transaction_id.as_deref() else {
            return false;
        };
        let waiter = self
            .inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(transaction_id);
        match waiter {
            Some(tx) => tx.send(packet.clone()).is_ok(),
            None => false,
        }
    }

    /// Wait for the ack matching `transaction_id`, bounded by the
    /// transaction deadline.
    fn await_ack(&self, transaction_id: &str, rx: Receiver<Packet>) -> Result<Packet> {
        match rx.recv_timeout(self.inner.txn_timeout) {
            Ok(packet) => {
                if packet.packet_type == PacketType::Error {
                    Err(SimError::TransactionFailure(transaction_id.to_string()))
                } else {
                    Ok(packet)
                }
            }
            Err(_) => {
                self.cancel_wait(transaction_id);
                if self.is_shutting_down() {
                    Err(SimError::ShuttingDown)
                } else {
                    Err(SimError::TransactionFailure(transaction_id.to_string()))
                }
            }
        }
    }

    /// Fail every outstanding transactional wait (shutdown path).
    fn cancel_all_waits(&self) {
        self.inner.pending.lock().expect("pending lock poisoned").clear();
    }

    // ------------------------------------------------------------------
    // Currency transfer (spec: debit atomically before the packet is
    // emitted; credit only on the recipient's atomic accept)
    // ------------------------------------------------------------------

    pub fn send_currency(&self, cents: Cents, recipient_id: &str) -> bool {
        let payment_id = format!("pay_{}_{}_{}", self.id(), recipient_id, crate::fresh_salt());
        self.send_currency_tagged(cents, recipient_id, &payment_id, FlowKind::Plain)
    }

    fn send_currency_tagged(
        &self,
        cents: Cents,
        recipient_id: &str,
        payment_id: &str,
        kind: FlowKind,
    ) -> bool {
        if cents == 0 {
            return true;
        }
        if cents < 0 || recipient_id == self.id() {
            return false;
        }

        {
            let mut state = self.inner.balance.lock().expect("balance lock poisoned");
            if state.balance < cents {
                warn!(target: "agent", id = %self.id(), balance = state.balance, cents, "balance too small");
                return false;
            }
            state.balance -= cents;
            state.ledger.record_outflow(cents, kind);
        }

        let rx = self.register_wait(payment_id);
        let packet = Packet::new(
            self.id(),
            recipient_id,
            PacketType::CurrencyTransfer,
            Payload::CurrencyTransfer { payment_id: payment_id.to_string(), cents },
        )
        .with_transaction(payment_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(payment_id, rx));
        let success = matches!(
            outcome,
            Ok(Packet { payload: Payload::CurrencyTransferAck { transfer_success: true, .. }, .. })
        );
        if !success {
            let mut state = self.inner.balance.lock().expect("balance lock poisoned");
            state.balance += cents;
            state.ledger.reverse_outflow(cents, kind);
            warn!(target: "agent", id = %self.id(), payment_id, "currency transfer failed, balance restored");
        }
        success
    }

    fn receive_currency(&self, packet: &Packet) {
        let Payload::CurrencyTransfer { payment_id, cents } = &packet.payload else {
            self.protocol_error(packet, "malformed CURRENCY_TRANSFER payload");
            return;
        };
        let accepted = *cents >= 0 && !self.is_shutting_down();
        if accepted {
            let mut state = self.inner.balance.lock().expect("balance lock poisoned");
            state.balance += cents;
            state.ledger.record_inflow(*cents, FlowKind::from_payment_id(payment_id));
        }

        let mut ack = Packet::new(
            self.id(),
            packet.sender.clone(),
            PacketType::CurrencyTransferAck,
            Payload::CurrencyTransferAck { payment_id: payment_id.clone(), transfer_success: accepted },
        );
        ack.transaction_id = packet.transaction_id.clone();
        let _ = self.send_packet(ack);

        if accepted {
            // A protocol thread (trade seller leg) may be parked on this
            // payment.
            self.complete_wait(packet);
        }
    }

    // ------------------------------------------------------------------
    // Item transfer
    // ------------------------------------------------------------------

    pub fn send_item(&self, container: ItemContainer, recipient_id: &str) -> bool {
        let transfer_id = format!(
            "item_{}_{}_{}_{}",
            self.id(),
            recipient_id,
            container.item_id,
            crate::fresh_salt()
        );
        if container.quantity == 0.0 {
            return true;
        }
        if container.quantity < 0.0 || recipient_id == self.id() {
            return false;
        }

        {
            let mut inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
            let stock = inventory.get(&container.item_id).copied().unwrap_or(0.0);
            if stock < container.quantity {
                warn!(target: "agent", id = %self.id(), item = %container.item_id, stock, "stock insufficient to send");
                return false;
            }
            subtract_item(&mut inventory, &container);
        }

        if self.emit_item_transfer(&container, recipient_id, &transfer_id) {
            true
        } else {
            self.restore_item(&container);
            false
        }
    }

    /// Emit an ITEM_TRANSFER whose quantity has already been debited (either
    /// just now or as a trade reservation) and wait for the ack.
    fn emit_item_transfer(&self, container: &ItemContainer, recipient_id: &str, transfer_id: &str) -> bool {
        let rx = self.register_wait(transfer_id);
        let packet = Packet::new(
            self.id(),
            recipient_id,
            PacketType::ItemTransfer,
            Payload::ItemTransfer { transfer_id: transfer_id.to_string(), item: container.clone() },
        )
        .with_transaction(transfer_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(transfer_id, rx));
        matches!(
            outcome,
            Ok(Packet { payload: Payload::ItemTransferAck { transfer_success: true, .. }, .. })
        )
    }

    fn restore_item(&self, container: &ItemContainer) {
        let mut inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
        *inventory.entry(container.item_id.clone()).or_insert(0.0) += container.quantity;
    }

    fn receive_item(&self, packet: &Packet) {
        let Payload::ItemTransfer { transfer_id, item } = &packet.payload else {
            self.protocol_error(packet, "malformed ITEM_TRANSFER payload");
            return;
        };
        let accepted = item.quantity >= 0.0 && !self.is_shutting_down();
        if accepted {
            self.restore_item(item);
        }

        let mut ack = Packet::new(
            self.id(),
            packet.sender.clone(),
            PacketType::ItemTransferAck,
            Payload::ItemTransferAck { transfer_id: transfer_id.clone(), transfer_success: accepted },
        );
        ack.transaction_id = packet.transaction_id.clone();
        let _ = self.send_packet(ack);

        if accepted {
            self.complete_wait(packet);
        }
    }

    pub fn consume_item(&self, container: &ItemContainer) -> bool {
        if container.quantity < 0.0 {
            return false;
        }
        {
            let mut inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
            let stock = inventory.get(&container.item_id).copied().unwrap_or(0.0);
            if stock < container.quantity {
                warn!(target: "agent", id = %self.id(), item = %container.item_id, "cannot consume more than held");
                return false;
            }
            subtract_item(&mut inventory, container);
        }
        if let Some(nutrition) = &self.inner.nutrition {
            if let Some(def) = self.inner.items.get(&container.item_id) {
                nutrition
                    .lock()
                    .expect("nutrition lock poisoned")
                    .consume(container, &def.nutrients);
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Trade (two-leg atomicity, spec 4.3.3)
    // ------------------------------------------------------------------

    /// Buyer side. Returns true only when both legs acknowledged.
    pub fn send_trade_request(&self, request: &TradeRequest) -> bool {
        if request.buyer_id != self.id() {
            return false;
        }
        let request_id = request.request_id.clone();
        let rx = self.register_wait(&request_id);
        let packet = Packet::new(
            self.id(),
            request.seller_id.clone(),
            PacketType::TradeReq,
            Payload::TradeRequest(request.clone()),
        )
        .with_transaction(&request_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(&request_id, rx));
        let accepted = matches!(
            outcome,
            Ok(Packet { payload: Payload::TradeRequestAck { accepted: true, .. }, .. })
        );
        if !accepted {
            debug!(target: "agent", id = %self.id(), request_id, "trade request rejected");
            return false;
        }

        // Register interest in the item leg before paying, then pay.
        let item_leg = format!("{request_id}_ITEM");
        let item_rx = self.register_wait(&item_leg);
        let payment_id = format!("{request_id}_CURRENCY");
        if !self.send_currency_tagged(
            request.currency_amount,
            &request.seller_id,
            &payment_id,
            FlowKind::Trade,
        ) {
            self.cancel_wait(&item_leg);
            return false;
        }

        // The seller emits the reserved item once the payment lands; the
        // inbound ITEM_TRANSFER credits inventory and completes this wait.
        self.await_ack(&item_leg, item_rx).is_ok()
    }

    /// Seller side, run on a handler thread.
    fn receive_trade_request(&self, request: TradeRequest, sender: AgentId, transaction_id: Option<String>) {
        let request_id = request.request_id.clone();

        let mut accepted = sender == request.buyer_id && request.seller_id == self.id();

        // Re-validate against the currently advertised listing; a stale
        // sampled price is the buyer's risk.
        if accepted {
            let listings = self.inner.my_item_listings.lock().expect("listings lock poisoned");
            if let Some(listing) = listings.get(&request.item.item_id) {
                let fair_price = (listing.unit_price as f64 * request.item.quantity).ceil() as Cents;
                if request.item.quantity > listing.max_quantity || request.currency_amount < fair_price {
                    debug!(target: "agent", id = %self.id(), request_id, "trade request fails listing validation");
                    accepted = false;
                }
            }
        }

        if accepted {
            let mut controller = self.inner.controller.lock().expect("controller lock poisoned");
            accepted = controller.eval_trade_request(self, &request);
        }

        // Reserve before promising: debit the item so it cannot be sold
        // twice while the currency leg is in flight.
        if accepted {
            let mut inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
            let stock = inventory.get(&request.item.item_id).copied().unwrap_or(0.0);
            if stock < request.item.quantity {
                accepted = false;
            } else {
                subtract_item(&mut inventory, &request.item);
            }
        }

        let payment_id = format!("{request_id}_CURRENCY");
        let payment_rx = accepted.then(|| self.register_wait(&payment_id));

        let mut ack = Packet::new(
            self.id(),
            sender,
            PacketType::TradeReqAck,
            Payload::TradeRequestAck { request: request.clone(), accepted },
        );
        ack.transaction_id = transaction_id;
        let _ = self.send_packet(ack);

        let Some(payment_rx) = payment_rx else {
            return;
        };

        if self.await_ack(&payment_id, payment_rx).is_ok() {
            let item_leg = format!("{request_id}_ITEM");
            if !self.emit_item_transfer(&request.item, &request.buyer_id, &item_leg) {
                self.restore_item(&request.item);
                warn!(target: "agent", id = %self.id(), request_id, "item leg failed after payment, reservation restored");
            }
        } else {
            // Currency leg failed: un-reserve.
            self.restore_item(&request.item);
            debug!(target: "agent", id = %self.id(), request_id, "currency leg missed deadline, reservation released");
        }
    }

    // ------------------------------------------------------------------
    // Land
    // ------------------------------------------------------------------

    pub fn allocate_land(&self, allocation: &str, hectares: f64) -> bool {
        if hectares < 0.0 {
            return false;
        }
        let mut land = self.inner.land.lock().expect("land lock poisoned");
        let Some(holding) = land.get_mut(allocation) else {
            return false;
        };
        if holding.unallocated < hectares {
            return false;
        }
        holding.unallocated -= hectares;
        holding.allocated += hectares;
        true
    }

    pub fn deallocate_land(&self, allocation: &str, hectares: f64) -> bool {
        if hectares < 0.0 {
            return false;
        }
        let mut land = self.inner.land.lock().expect("land lock poisoned");
        let Some(holding) = land.get_mut(allocation) else {
            return false;
        };
        if holding.allocated < hectares {
            return false;
        }
        holding.allocated -= hectares;
        holding.unallocated += hectares;
        true
    }

    pub fn send_land(&self, allocation: &str, hectares: f64, recipient_id: &str) -> bool {
        let transfer_id =
            format!("land_{}_{}_{}_{}", self.id(), recipient_id, allocation, crate::fresh_salt());
        if hectares == 0.0 {
            return true;
        }
        if hectares < 0.0 || recipient_id == self.id() {
            return false;
        }

        {
            let mut land = self.inner.land.lock().expect("land lock poisoned");
            let Some(holding) = land.get_mut(allocation) else {
                return false;
            };
            if holding.unallocated < hectares {
                warn!(target: "agent", id = %self.id(), allocation, "unallocated land insufficient to send");
                return false;
            }
            holding.unallocated -= hectares;
        }

        if self.emit_land_transfer(allocation, hectares, recipient_id, &transfer_id) {
            true
        } else {
            self.restore_land(allocation, hectares);
            false
        }
    }

    fn emit_land_transfer(&self, allocation: &str, hectares: f64, recipient_id: &str, transfer_id: &str) -> bool {
        let rx = self.register_wait(transfer_id);
        let packet = Packet::new(
            self.id(),
            recipient_id,
            PacketType::LandTransfer,
            Payload::LandTransfer {
                transfer_id: transfer_id.to_string(),
                allocation: allocation.to_string(),
                hectares,
            },
        )
        .with_transaction(transfer_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(transfer_id, rx));
        matches!(
            outcome,
            Ok(Packet { payload: Payload::LandTransferAck { transfer_success: true, .. }, .. })
        )
    }

    fn restore_land(&self, allocation: &str, hectares: f64) {
        self.inner
            .land
            .lock()
            .expect("land lock poisoned")
            .entry(allocation.to_string())
            .or_default()
            .unallocated += hectares;
    }

    fn receive_land(&self, packet: &Packet) {
        let Payload::LandTransfer { transfer_id, allocation, hectares } = &packet.payload else {
            self.protocol_error(packet, "malformed LAND_TRANSFER payload");
            return;
        };
        let accepted = *hectares >= 0.0 && !self.is_shutting_down();
        if accepted {
            self.restore_land(allocation, *hectares);
        }

        let mut ack = Packet::new(
            self.id(),
            packet.sender.clone(),
            PacketType::LandTransferAck,
            Payload::LandTransferAck { transfer_id: transfer_id.clone(), transfer_success: accepted },
        );
        ack.transaction_id = packet.transaction_id.clone();
        let _ = self.send_packet(ack);

        if accepted {
            self.complete_wait(packet);
        }
    }

    pub fn send_land_trade_request(&self, request: &LandTradeRequest) -> bool {
        if request.buyer_id != self.id() {
            return false;
        }
        let request_id = request.request_id.clone();
        let rx = self.register_wait(&request_id);
        let packet = Packet::new(
            self.id(),
            request.seller_id.clone(),
            PacketType::LandTradeReq,
            Payload::LandTradeRequest(request.clone()),
        )
        .with_transaction(&request_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(&request_id, rx));
        let accepted = matches!(
            outcome,
            Ok(Packet { payload: Payload::LandTradeRequestAck { accepted: true, .. }, .. })
        );
        if !accepted {
            return false;
        }

        let land_leg = format!("{request_id}_LAND");
        let land_rx = self.register_wait(&land_leg);
        let payment_id = format!("{request_id}_CURRENCY");
        if !self.send_currency_tagged(
            request.currency_amount,
            &request.seller_id,
            &payment_id,
            FlowKind::Land,
        ) {
            self.cancel_wait(&land_leg);
            return false;
        }
        self.await_ack(&land_leg, land_rx).is_ok()
    }

    fn receive_land_trade_request(
        &self,
        request: LandTradeRequest,
        sender: AgentId,
        transaction_id: Option<String>,
    ) {
        let request_id = request.request_id.clone();
        let mut accepted = sender == request.buyer_id && request.seller_id == self.id();

        if accepted {
            let listings = self.inner.my_land_listings.lock().expect("listings lock poisoned");
            if let Some(listing) = listings.get(&request.allocation) {
                let fair_price = (listing.price_per_hectare as f64 * request.hectares).ceil() as Cents;
                if request.hectares > listing.hectares || request.currency_amount < fair_price {
                    accepted = false;
                }
            }
        }

        if accepted {
            let mut controller = self.inner.controller.lock().expect("controller lock poisoned");
            accepted = controller.eval_land_trade_request(self, &request);
        }

        if accepted {
            let mut land = self.inner.land.lock().expect("land lock poisoned");
            match land.get_mut(&request.allocation) {
                Some(holding) if holding.unallocated >= request.hectares => {
                    holding.unallocated -= request.hectares;
                }
                _ => accepted = false,
            }
        }

        let payment_id = format!("{request_id}_CURRENCY");
        let payment_rx = accepted.then(|| self.register_wait(&payment_id));

        let mut ack = Packet::new(
            self.id(),
            sender,
            PacketType::LandTradeReqAck,
            Payload::LandTradeRequestAck { request: request.clone(), accepted },
        );
        ack.transaction_id = transaction_id;
        let _ = self.send_packet(ack);

        let Some(payment_rx) = payment_rx else {
            return;
        };

        if self.await_ack(&payment_id, payment_rx).is_ok() {
            let land_leg = format!("{request_id}_LAND");
            if !self.emit_land_transfer(&request.allocation, request.hectares, &request.buyer_id, &land_leg) {
                self.restore_land(&request.allocation, request.hectares);
            }
        } else {
            self.restore_land(&request.allocation, request.hectares);
        }
    }

    // ------------------------------------------------------------------
    // Labor
    // ------------------------------------------------------------------

    pub fn send_job_application(&self, listing: &LaborListing) -> bool {
        if self.inner.skill_level < listing.skill_level {
            return false;
        }
        let start_step = {
            let time = self.inner.time.lock().expect("time lock poisoned");
            let free = time
                .ticks_per_step
                .saturating_sub(time.committed_ticks + time.committed_next_step);
            if listing.ticks_per_step > free {
                warn!(target: "agent", id = %self.id(), "not enough uncommitted ticks for job");
                return false;
            }
            time.step + 1
        };

        let contract = listing.generate_contract(self.id(), self.inner.skill_level, start_step);
        {
            let labor = self.inner.labor.lock().expect("labor lock poisoned");
            let duplicate = labor.as_worker.values().any(|c| {
                c.employer_id == contract.employer_id
                    && (c.skill_level - contract.skill_level).abs() < 1e-9
                    && c.active_at(start_step)
            });
            if duplicate {
                return false;
            }
        }

        let application_id = format!("laborapp_{}", contract.contract_id);
        let rx = self.register_wait(&application_id);
        let packet = Packet::new(
            self.id(),
            listing.employer_id.clone(),
            PacketType::LaborApplication,
            Payload::LaborApplication { contract: contract.clone(), application_id: application_id.clone() },
        )
        .with_transaction(&application_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(&application_id, rx));
        let accepted = matches!(
            outcome,
            Ok(Packet { payload: Payload::LaborApplicationAck { accepted: true, .. }, .. })
        );
        if accepted {
            self.inner
                .labor
                .lock()
                .expect("labor lock poisoned")
                .as_worker
                .insert(contract.contract_id.clone(), contract.clone());
            self.inner.time.lock().expect("time lock poisoned").committed_next_step +=
                contract.ticks_per_step;
            info!(target: "agent", id = %self.id(), contract = %contract.contract_id, "labor contract accepted");
        }
        accepted
    }

    fn receive_job_application(
        &self,
        contract: LaborContract,
        application_id: String,
        sender: AgentId,
        transaction_id: Option<String>,
    ) {
        let mut accepted = contract.employer_id == self.id() && sender == contract.worker_id;

        if accepted {
            let labor = self.inner.labor.lock().expect("labor lock poisoned");
            let duplicate = labor.as_employer.values().any(|c| {
                c.worker_id == contract.worker_id
                    && (c.skill_level - contract.skill_level).abs() < 1e-9
                    && c.active_at(contract.start_step)
            });
            if duplicate {
                accepted = false;
            }
        }

        if accepted {
            let mut controller = self.inner.controller.lock().expect("controller lock poisoned");
            accepted = controller.eval_job_application(self, &contract);
        }

        // Record before acking so labor time arriving right after the
        // accept always finds its contract.
        if accepted {
            self.inner
                .labor
                .lock()
                .expect("labor lock poisoned")
                .as_employer
                .insert(contract.contract_id.clone(), contract.clone());
        }

        let mut ack = Packet::new(
            self.id(),
            sender,
            PacketType::LaborApplicationAck,
            Payload::LaborApplicationAck { contract, accepted },
        );
        ack.transaction_id = transaction_id.or(Some(application_id));
        let _ = self.send_packet(ack);
    }

    /// Either party may cancel; both sides erase the contract.
    pub fn cancel_labor_contract(&self, contract: &LaborContract) -> bool {
        let counterpart = if contract.worker_id == self.id() {
            contract.employer_id.clone()
        } else if contract.employer_id == self.id() {
            contract.worker_id.clone()
        } else {
            return false;
        };

        let cancel_id = format!("laborcancel_{}", contract.contract_id);
        let rx = self.register_wait(&cancel_id);
        let packet = Packet::new(
            self.id(),
            counterpart,
            PacketType::LaborContractCancel,
            Payload::LaborContractCancel { contract: contract.clone() },
        )
        .with_transaction(&cancel_id);

        let outcome = self.send_packet(packet).and_then(|_| self.await_ack(&cancel_id, rx));
        if outcome.is_ok() {
            self.erase_labor_contract(contract);
            true
        } else {
            false
        }
    }

    fn erase_labor_contract(&self, contract: &LaborContract) {
        let was_worker = {
            let mut labor = self.inner.labor.lock().expect("labor lock poisoned");
            labor.as_employer.remove(&contract.contract_id);
            labor.as_worker.remove(&contract.contract_id).is_some()
        };
        if was_worker {
            let mut time = self.inner.time.lock().expect("time lock poisoned");
            time.committed_ticks = time.committed_ticks.saturating_sub(contract.ticks_per_step);
        }
    }

    fn receive_labor_cancel(&self, packet: &Packet) {
        let Payload::LaborContractCancel { contract } = &packet.payload else {
            self.protocol_error(packet, "malformed LABOR_CONTRACT_CANCEL payload");
            return;
        };
        if packet.sender != contract.worker_id && packet.sender != contract.employer_id {
            self.protocol_error(packet, "cancel from a non-party");
            return;
        }
        self.erase_labor_contract(contract);

        let mut ack = Packet::new(
            self.id(),
            packet.sender.clone(),
            PacketType::LaborContractCancelAck,
            Payload::LaborContractCancelAck { contract_id: contract.contract_id.clone() },
        );
        ack.transaction_id = packet.transaction_id.clone();
        let _ = self.send_packet(ack);
    }

    /// Worker side of per-step fulfillment: spend ticks, deliver labor.
    fn fulfill_labor_contracts(&self, step: u64) {
        let contracts: Vec<LaborContract> = {
            let labor = self.inner.labor.lock().expect("labor lock poisoned");
            labor.as_worker.values().filter(|c| c.active_at(step)).cloned().collect()
        };
        for contract in contracts {
            if !self.use_time_ticks(contract.ticks_per_step) {
                error!(target: "agent", id = %self.id(), contract = %contract.contract_id, "not enough ticks to fulfill contract");
                continue;
            }
            let labor_id = format!("labortime_{}_{}", contract.contract_id, step);
            let packet = Packet::new(
                self.id(),
                contract.employer_id.clone(),
                PacketType::LaborTimeSend,
                Payload::LaborTimeSend {
                    ticks: contract.ticks_per_step,
                    skill_level: contract.skill_level,
                    contract_id: contract.contract_id.clone(),
                },
            )
            .with_transaction(&labor_id);
            let _ = self.send_packet(packet);
        }
    }

    /// Employer side: book delivered labor, then pay ticks x wage. The wage
    /// payment is always initiated here, on receipt of time.
    fn receive_labor_time(&self, packet: &Packet) {
        let Payload::LaborTimeSend { ticks, skill_level, contract_id } = &packet.payload else {
            self.protocol_error(packet, "malformed LABOR_TIME_SEND payload");
            return;
        };
        let contract = {
            let mut labor = self.inner.labor.lock().expect("labor lock poisoned");
            labor.pool.credit(*skill_level, *ticks as f64);
            labor.as_employer.get(contract_id).cloned()
        };
        match contract {
            Some(contract) if contract.worker_id == packet.sender => {
                let wage = *ticks as Cents * contract.wage_per_tick;
                let step = self.current_step();
                let payment_id = format!("wage_{contract_id}_{step}");
                if !self.send_currency_tagged(wage, &contract.worker_id, &payment_id, FlowKind::Labor) {
                    error!(target: "agent", id = %self.id(), contract = %contract_id, "wage payment failed");
                }
            }
            _ => {
                warn!(target: "agent", id = %self.id(), contract = %contract_id, "labor time for unknown contract");
            }
        }
    }

    /// Drop contracts that ended before `step` and release the worker-side
    /// tick commitment.
    fn reap_expired_contracts(&self, step: u64) {
        let released: u32 = {
            let mut labor = self.inner.labor.lock().expect("labor lock poisoned");
            labor.as_employer.retain(|_, c| c.end_step >= step);
            let mut released = 0;
            labor.as_worker.retain(|_, c| {
                if c.end_step < step {
                    released += c.ticks_per_step;
                    false
                } else {
                    true
                }
            });
            released
        };
        if released > 0 {
            let mut time = self.inner.time.lock().expect("time lock poisoned");
            time.committed_ticks = time.committed_ticks.saturating_sub(released);
        }
    }

    // ------------------------------------------------------------------
    // Production
    // ------------------------------------------------------------------

    pub fn max_production(&self, item_id: &str) -> f64 {
        if !self.ensure_production_function(item_id) {
            return 0.0;
        }
        let production = self.inner.production.lock().expect("production lock poisoned");
        let function = &production[item_id];

        let inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
        let land = self.inner.land.lock().expect("land lock poisoned");
        let labor = self.inner.labor.lock().expect("labor lock poisoned");
        let view = ProductionView { inventory: &inventory, land: &land, labor: &labor.pool };
        function.max_production(&view)
    }

    /// Produce up to `container.quantity`, scaling down uniformly to the
    /// maximum feasible fraction. Returns the container actually produced.
    pub fn produce_item(&self, container: &ItemContainer) -> Option<ItemContainer> {
        if container.quantity <= 0.0 || !self.ensure_production_function(&container.item_id) {
            return None;
        }

        let mut production = self.inner.production.lock().expect("production lock poisoned");
        let function = production.get_mut(&container.item_id).expect("ensured above");

        let produced = {
            let mut inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
            let land = self.inner.land.lock().expect("land lock poisoned");
            let mut labor = self.inner.labor.lock().expect("labor lock poisoned");

            let feasible = {
                let view =
                    ProductionView { inventory: &inventory, land: &land, labor: &labor.pool };
                function.max_production(&view).min(container.quantity)
            };
            if feasible <= 0.0 {
                return None;
            }

            let inputs = function.inputs_for(feasible);
            for (item_id, quantity) in &inputs.items {
                let stock = inventory.entry(item_id.clone()).or_insert(0.0);
                *stock = (*stock - quantity).max(0.0);
            }
            inventory.retain(|_, q| *q > 1e-12);
            labor.pool.consume(&inputs.labor, 1.0);

            *inventory.entry(container.item_id.clone()).or_insert(0.0) += feasible;
            feasible
        };

        function.record_produced(produced);
        drop(production);

        let step = self.current_step();
        let produced_container = ItemContainer::new(container.item_id.clone(), produced);
        let notification = Packet::new(
            self.id(),
            NETWORK_ID,
            PacketType::ProductionNotification,
            Payload::ProductionNotification {
                producer_id: self.id().to_string(),
                item: produced_container.clone(),
                step,
            },
        );
        let _ = self.send_packet(notification);

        Some(produced_container)
    }

    fn ensure_production_function(&self, item_id: &str) -> bool {
        let mut production = self.inner.production.lock().expect("production lock poisoned");
        if production.contains_key(item_id) {
            return true;
        }
        match self.inner.items.get(item_id).and_then(RecipeProduction::new) {
            Some(function) => {
                production.insert(item_id.to_string(), function);
                true
            }
            None => {
                warn!(target: "agent", id = %self.id(), item = item_id, "no production recipe");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Marketplace surface
    // ------------------------------------------------------------------

    pub fn update_item_listing(&self, listing: ItemListing) -> bool {
        if listing.seller_id != self.id() {
            error!(target: "agent", id = %self.id(), "cannot update another seller's listing");
            return false;
        }
        self.inner
            .my_item_listings
            .lock()
            .expect("listings lock poisoned")
            .insert(listing.item_id.clone(), listing.clone());
        self.send_packet(Packet::new(
            self.id(),
            ITEM_MARKET_ID,
            PacketType::ItemMarketUpdate,
            Payload::ItemListing(listing),
        ))
        .is_ok()
    }

    pub fn remove_item_listing(&self, listing: &ItemListing) -> bool {
        if listing.seller_id != self.id() {
            return false;
        }
        self.inner
            .my_item_listings
            .lock()
            .expect("listings lock poisoned")
            .remove(&listing.item_id);
        self.send_packet(Packet::new(
            self.id(),
            ITEM_MARKET_ID,
            PacketType::ItemMarketRemove,
            Payload::ItemListing(listing.clone()),
        ))
        .is_ok()
    }

    pub fn sample_item_listings(&self, item_id: &str, sample_size: usize) -> Vec<ItemListing> {
        let transaction_id = format!("itemsample_{}_{}", self.id(), crate::fresh_salt());
        let rx = self.register_wait(&transaction_id);
        let packet = Packet::new(
            self.id(),
            ITEM_MARKET_ID,
            PacketType::ItemMarketSample,
            Payload::ItemSample { item_id: item_id.to_string(), sample_size },
        )
        .with_transaction(&transaction_id);

        match self.send_packet(packet).and_then(|_| self.await_ack(&transaction_id, rx)) {
            Ok(Packet { payload: Payload::ItemSampleAck(listings), .. }) => listings,
            _ => Vec::new(),
        }
    }

    pub fn update_labor_listing(&self, listing: LaborListing) -> bool {
        if listing.employer_id != self.id() {
            return false;
        }
        self.send_packet(Packet::new(
            self.id(),
            LABOR_MARKET_ID,
            PacketType::LaborMarketUpdate,
            Payload::LaborListing(listing),
        ))
        .is_ok()
    }

    pub fn remove_labor_listing(&self, listing: &LaborListing) -> bool {
        if listing.employer_id != self.id() {
            return false;
        }
        self.send_packet(Packet::new(
            self.id(),
            LABOR_MARKET_ID,
            PacketType::LaborMarketRemove,
            Payload::LaborListing(listing.clone()),
        ))
        .is_ok()
    }

    /// Listings this agent qualifies for, best-paying skill bands first.
    pub fn sample_labor_listings(&self, sample_size: usize) -> Vec<LaborListing> {
        let transaction_id = format!("laborsample_{}_{}", self.id(), crate::fresh_salt());
        let rx = self.register_wait(&transaction_id);
        let packet = Packet::new(
            self.id(),
            LABOR_MARKET_ID,
            PacketType::LaborMarketSample,
            Payload::LaborSample {
                min_skill_level: 0.0,
                max_skill_level: self.inner.skill_level,
                sample_size,
            },
        )
        .with_transaction(&transaction_id);

        match self.send_packet(packet).and_then(|_| self.await_ack(&transaction_id, rx)) {
            Ok(Packet { payload: Payload::LaborSampleAck(listings), .. }) => listings,
            _ => Vec::new(),
        }
    }

    pub fn update_land_listing(&self, listing: LandListing) -> bool {
        if listing.seller_id != self.id() {
            return false;
        }
        self.inner
            .my_land_listings
            .lock()
            .expect("listings lock poisoned")
            .insert(listing.allocation.clone(), listing.clone());
        self.send_packet(Packet::new(
            self.id(),
            LAND_MARKET_ID,
            PacketType::LandMarketUpdate,
            Payload::LandListing(listing),
        ))
        .is_ok()
    }

    pub fn remove_land_listing(&self, listing: &LandListing) -> bool {
        if listing.seller_id != self.id() {
            return false;
        }
        self.inner
            .my_land_listings
            .lock()
            .expect("listings lock poisoned")
            .remove(&listing.allocation);
        self.send_packet(Packet::new(
            self.id(),
            LAND_MARKET_ID,
            PacketType::LandMarketRemove,
            Payload::LandListing(listing.clone()),
        ))
        .is_ok()
    }

    pub fn sample_land_listings(&self, allocation: &str, hectares: f64, sample_size: usize) -> Vec<LandListing> {
        let transaction_id = format!("landsample_{}_{}", self.id(), crate::fresh_salt());
        let rx = self.register_wait(&transaction_id);
        let packet = Packet::new(
            self.id(),
            LAND_MARKET_ID,
            PacketType::LandMarketSample,
            Payload::LandSample { allocation: allocation.to_string(), hectares, sample_size },
        )
        .with_transaction(&transaction_id);

        match self.send_packet(packet).and_then(|_| self.await_ack(&transaction_id, rx)) {
            Ok(Packet { payload: Payload::LandSampleAck(listings), .. }) => listings,
            _ => Vec::new(),
        }
    }

    /// Sample the item market and buy greedily, cheapest listings first,
    /// until the requested quantity is met or the sample is exhausted.
    pub fn acquire_item(&self, container: &ItemContainer, sample_size: usize) -> ItemContainer {
        let mut acquired = ItemContainer::new(container.item_id.clone(), 0.0);
        let mut listings = self.sample_item_listings(&container.item_id, sample_size);
        listings.sort_by_key(|listing| listing.unit_price);

        let mut remaining = container.quantity;
        for listing in listings {
            if remaining <= 1e-12 {
                break;
            }
            if listing.seller_id == self.id() {
                continue;
            }
            let quantity = remaining.min(listing.max_quantity);
            if quantity <= 0.0 {
                continue;
            }
            let amount = (listing.unit_price as f64 * quantity).ceil() as Cents;
            let request = TradeRequest::new(
                self.id(),
                listing.seller_id.clone(),
                ItemContainer::new(container.item_id.clone(), quantity),
                amount,
            );
            if self.send_trade_request(&request) {
                remaining -= quantity;
                acquired.quantity += quantity;
            }
        }
        acquired
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    pub fn subscribe_tick_blocking(&self) {
        let packet = Packet::new(
            self.id(),
            self.inner.manager_id.clone(),
            PacketType::TickBlockSubscribe,
            Payload::Empty,
        );
        let _ = self.send_packet(packet);
    }

    /// Consume ticks from the current step. Hitting zero declares this agent
    /// tick-blocked to the manager.
    pub fn use_time_ticks(&self, amount: u32) -> bool {
        let blocked_now = {
            let mut time = self.inner.time.lock().expect("time lock poisoned");
            if time.ticks_remaining < amount {
                warn!(target: "agent", id = %self.id(), remaining = time.ticks_remaining, amount, "not enough time ticks");
                return false;
            }
            time.ticks_remaining -= amount;
            if time.ticks_remaining == 0 && !time.tick_blocked {
                time.tick_blocked = true;
                true
            } else {
                false
            }
        };
        if blocked_now {
            debug!(target: "agent", id = %self.id(), "tick blocked");
            let packet = Packet::new(
                self.id(),
                self.inner.manager_id.clone(),
                PacketType::TickBlocked,
                Payload::Empty,
            );
            let _ = self.send_packet(packet);
        }
        true
    }

    /// Give up the rest of this step's uncommitted ticks.
    pub fn relinquish_time_ticks(&self) -> bool {
        let spend = {
            let time = self.inner.time.lock().expect("time lock poisoned");
            time.ticks_remaining
                .min(time.ticks_per_step.saturating_sub(time.committed_ticks))
        };
        self.use_time_ticks(spend)
    }

    fn handle_tick_grant(&self, ticks: u32, step: u64) {
        {
            let mut time = self.inner.time.lock().expect("time lock poisoned");
            time.ticks_remaining = ticks;
            time.tick_blocked = false;
            time.step = step;
            time.committed_ticks += time.committed_next_step;
            time.committed_next_step = 0;
        }
        {
            let mut balance = self.inner.balance.lock().expect("balance lock poisoned");
            let alpha = self.inner.ema_alpha;
            balance.ledger.roll_step(alpha);
        }
        {
            // Labor delivered last step was spent or lost.
            let mut labor = self.inner.labor.lock().expect("labor lock poisoned");
            labor.pool.clear();
        }
        self.reap_expired_contracts(step);

        let agent = self.clone();
        thread::spawn(move || {
            agent.fulfill_labor_contracts(step);
            agent.nutrition_step();
            let ctrl_agent = agent.clone();
            let mut controller = agent.inner.controller.lock().expect("controller lock poisoned");
            controller.on_tick_grant(&ctrl_agent, ticks, step);
        });
    }

    fn nutrition_step(&self) {
        let Some(nutrition) = &self.inner.nutrition else {
            return;
        };
        let (auto_eat, requirement) = {
            let tracker = nutrition.lock().expect("nutrition lock poisoned");
            (tracker.settings.auto_eat, tracker.requirement())
        };
        if auto_eat {
            for needed in requirement {
                let held = self.inventory_quantity(&needed.item_id);
                if held < needed.quantity {
                    let missing = ItemContainer::new(needed.item_id.clone(), needed.quantity - held);
                    self.acquire_item(&missing, 5);
                }
                let available = self.inventory_quantity(&needed.item_id).min(needed.quantity);
                if available > 0.0 {
                    self.consume_item(&ItemContainer::new(needed.item_id.clone(), available));
                }
            }
        }
        nutrition.lock().expect("nutrition lock poisoned").step_decay();
    }

    // ------------------------------------------------------------------
    // Info requests
    // ------------------------------------------------------------------

    fn handle_info_request(&self, packet: &Packet) {
        let Payload::InfoRequest(request) = &packet.payload else {
            self.protocol_error(packet, "malformed INFO_REQ payload");
            return;
        };
        let broadcast = packet.packet_type == PacketType::InfoReqBroadcast;
        if !broadcast && request.agent_id != self.id() {
            warn!(target: "agent", id = %self.id(), "info request addressed to another agent");
            return;
        }

        let mut answered = request.clone();
        answered.agent_id = self.id().to_string();
        answered.info = match request.info_key.as_str() {
            "currencyBalance" => Some(serde_json::json!(self.balance())),
            "inventory" => {
                let inventory = self.inner.inventory.lock().expect("inventory lock poisoned");
                serde_json::to_value(&*inventory).ok()
            }
            "landHoldings" => {
                let land = self.inner.land.lock().expect("land lock poisoned");
                serde_json::to_value(&*land).ok()
            }
            "ledger" => serde_json::to_value(self.ledger()).ok(),
            _ => None,
        };

        let mut response = Packet::new(
            self.id(),
            request.requester_id.clone(),
            PacketType::InfoResp,
            Payload::InfoRequest(answered),
        );
        response.transaction_id = packet.transaction_id.clone();
        let _ = self.send_packet(response);
    }

    fn protocol_error(&self, packet: &Packet, message: &str) {
        warn!(target: "agent", id = %self.id(), %packet, message);
        let mut err = Packet::new(
            self.id(),
            packet.sender.clone(),
            PacketType::Error,
            Payload::Text(message.to_string()),
        );
        err.transaction_id = packet.transaction_id.clone();
        let _ = self.send_packet(err);
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    pub fn save_checkpoint(&self, directory: &std::path::Path) -> Result<()> {
        let snapshot = self.snapshot();
        crate::checkpoint::save_agent(directory, &snapshot)
    }

    pub fn load_checkpoint(&self, directory: &std::path::Path) -> Result<()> {
        let snapshot = crate::checkpoint::load_agent(directory, self.id())?;
        self.restore(snapshot);
        Ok(())
    }

    /// One field-family lock at a time, never nested: checkpoints are only
    /// broadcast at a step boundary when all tick-blocking agents are
    /// quiescent, so the sequential reads still form a coherent snapshot.
    fn snapshot(&self) -> crate::checkpoint::AgentCheckpoint {
        let (balance, ledger) = {
            let state = self.inner.balance.lock().expect("balance lock poisoned");
            (state.balance, state.ledger.clone())
        };
        let inventory = self.inner.inventory.lock().expect("inventory lock poisoned").clone();
        let land = self.inner.land.lock().expect("land lock poisoned").clone();
        let (contracts_as_employer, contracts_as_worker, labor_pool) = {
            let labor = self.inner.labor.lock().expect("labor lock poisoned");
            (
                labor.as_employer.values().cloned().collect(),
                labor.as_worker.values().cloned().collect(),
                labor.pool.clone(),
            )
        };
        let (ticks_remaining, committed_ticks, committed_next_step, step) = {
            let time = self.inner.time.lock().expect("time lock poisoned");
            (time.ticks_remaining, time.committed_ticks, time.committed_next_step, time.step)
        };

        crate::checkpoint::AgentCheckpoint {
            version: crate::checkpoint::CHECKPOINT_VERSION,
            agent_id: self.id().to_string(),
            controller_type: self.inner.controller_type.clone(),
            skill_level: self.inner.skill_level,
            balance,
            ledger,
            inventory,
            land,
            contracts_as_employer,
            contracts_as_worker,
            labor_pool,
            ticks_remaining,
            committed_ticks,
            committed_next_step,
            step,
            nutrition: self
                .inner
                .nutrition
                .as_ref()
                .map(|n| n.lock().expect("nutrition lock poisoned").clone()),
            production: self.inner.production.lock().expect("production lock poisoned").clone(),
            my_item_listings: self
                .inner
                .my_item_listings
                .lock()
                .expect("listings lock poisoned")
                .clone(),
            my_land_listings: self
                .inner
                .my_land_listings
                .lock()
                .expect("listings lock poisoned")
                .clone(),
            controller_state: self
                .inner
                .controller
                .lock()
                .expect("controller lock poisoned")
                .save_state(),
        }
    }

    fn restore(&self, snapshot: crate::checkpoint::AgentCheckpoint) {
        {
            let mut balance = self.inner.balance.lock().expect("balance lock poisoned");
            balance.balance = snapshot.balance;
            balance.ledger = snapshot.ledger;
        }
        *self.inner.inventory.lock().expect("inventory lock poisoned") = snapshot.inventory;
        *self.inner.land.lock().expect("land lock poisoned") = snapshot.land;
        {
            let mut labor = self.inner.labor.lock().expect("labor lock poisoned");
            labor.as_employer = snapshot
                .contracts_as_employer
                .into_iter()
                .map(|c| (c.contract_id.clone(), c))
                .collect();
            labor.as_worker = snapshot
                .contracts_as_worker
                .into_iter()
                .map(|c| (c.contract_id.clone(), c))
                .collect();
            labor.pool = snapshot.labor_pool;
        }
        {
            let mut time = self.inner.time.lock().expect("time lock poisoned");
            time.ticks_remaining = snapshot.ticks_remaining;
            time.committed_ticks = snapshot.committed_ticks;
            time.committed_next_step = snapshot.committed_next_step;
            time.step = snapshot.step;
        }
        if let (Some(slot), Some(tracker)) = (&self.inner.nutrition, snapshot.nutrition) {
            *slot.lock().expect("nutrition lock poisoned") = tracker;
        }
        *self.inner.production.lock().expect("production lock poisoned") = snapshot.production;
        *self.inner.my_item_listings.lock().expect("listings lock poisoned") =
            snapshot.my_item_listings;
        *self.inner.my_land_listings.lock().expect("listings lock poisoned") =
            snapshot.my_land_listings;
        self.inner
            .controller
            .lock()
            .expect("controller lock poisoned")
            .load_state(&snapshot.controller_state);
        info!(target: "agent", id = %self.id(), "checkpoint restored");
    }

    fn handle_checkpoint_save(&self, packet: &Packet) {
        let Payload::Checkpoint { path, .. } = &packet.payload else {
            self.protocol_error(packet, "malformed SAVE_CHECKPOINT payload");
            return;
        };
        match self.save_checkpoint(std::path::Path::new(path)) {
            Ok(()) => {
                let mut ack = Packet::new(
                    self.id(),
                    packet.sender.clone(),
                    PacketType::SaveCheckpointAck,
                    Payload::Empty,
                );
                ack.transaction_id = packet.transaction_id.clone();
                let _ = self.send_packet(ack);
            }
            Err(e) => {
                error!(target: "agent", id = %self.id(), error = %e, "checkpoint save failed");
                self.protocol_error(packet, "checkpoint save failed");
            }
        }
    }

    fn handle_checkpoint_load(&self, packet: &Packet) {
        let Payload::Checkpoint { path, .. } = &packet.payload else {
            self.protocol_error(packet, "malformed LOAD_CHECKPOINT payload");
            return;
        };
        if let Err(e) = self.load_checkpoint(std::path::Path::new(path)) {
            error!(target: "agent", id = %self.id(), error = %e, "checkpoint load failed");
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.cancel_all_waits();
        let kill = Packet::new(self.id(), self.id(), PacketType::KillPipeNetwork, Payload::Empty);
        let _ = self.send_packet(kill);
        info!(target: "agent", id = %self.id(), "shutting down");
    }
}

fn subtract_item(inventory: &mut HashMap<String, f64>, container: &ItemContainer) {
    if let Some(stock) = inventory.get_mut(&container.item_id) {
        *stock -= container.quantity;
        if *stock <= 1e-12 {
            inventory.remove(&container.item_id);
        }
    }
}

fn reader_loop(agent: Agent, receiver: Receiver<Packet>) {
    while let Ok(packet) = receiver.recv() {
        debug!(target: "agent", id = %agent.id(), %packet, "INBOUND");
        match packet.packet_type {
            PacketType::KillPipeAgent | PacketType::KillAllBroadcast => {
                agent.begin_shutdown();
                break;
            }

            t if t.is_ack() => {
                if !agent.complete_wait(&packet) && t != PacketType::TickBlockedAck {
                    debug!(target: "agent", id = %agent.id(), %packet, "ack with no outstanding wait");
                }
            }

            PacketType::Error => {
                if !agent.complete_wait(&packet) {
                    error!(target: "agent", id = %agent.id(), %packet, "network error");
                }
            }

            PacketType::ControllerStart | PacketType::ControllerStartBroadcast => {
                if !agent.inner.controller_started.swap(true, Ordering::SeqCst) {
                    let handle = agent.clone();
                    thread::spawn(move || {
                        let ctrl_agent = handle.clone();
                        let mut controller =
                            handle.inner.controller.lock().expect("controller lock poisoned");
                        controller.on_start(&ctrl_agent);
                    });
                }
            }

            PacketType::ControllerMsg
            | PacketType::ControllerMsgBroadcast
            | PacketType::Snoop
            | PacketType::InfoResp
            | PacketType::StopTrading
            | PacketType::ProductionNotification => {
                let handle = agent.clone();
                thread::spawn(move || {
                    let ctrl_agent = handle.clone();
                    let mut controller =
                        handle.inner.controller.lock().expect("controller lock poisoned");
                    controller.on_packet(&ctrl_agent, &packet);
                });
            }

            PacketType::CurrencyTransfer => agent.receive_currency(&packet),
            PacketType::ItemTransfer => agent.receive_item(&packet),
            PacketType::LandTransfer => agent.receive_land(&packet),

            PacketType::TradeReq => {
                if let Payload::TradeRequest(request) = packet.payload.clone() {
                    let handle = agent.clone();
                    let sender = packet.sender.clone();
                    let transaction_id = packet.transaction_id.clone();
                    thread::spawn(move || handle.receive_trade_request(request, sender, transaction_id));
                } else {
                    agent.protocol_error(&packet, "malformed TRADE_REQ payload");
                }
            }

            PacketType::LandTradeReq => {
                if let Payload::LandTradeRequest(request) = packet.payload.clone() {
                    let handle = agent.clone();
                    let sender = packet.sender.clone();
                    let transaction_id = packet.transaction_id.clone();
                    thread::spawn(move || {
                        handle.receive_land_trade_request(request, sender, transaction_id)
                    });
                } else {
                    agent.protocol_error(&packet, "malformed LAND_TRADE_REQ payload");
                }
            }

            PacketType::LaborApplication => {
                if let Payload::LaborApplication { contract, application_id } = packet.payload.clone()
                {
                    let handle = agent.clone();
                    let sender = packet.sender.clone();
                    let transaction_id = packet.transaction_id.clone();
                    thread::spawn(move || {
                        handle.receive_job_application(contract, application_id, sender, transaction_id)
                    });
                } else {
                    agent.protocol_error(&packet, "malformed LABOR_APPLICATION payload");
                }
            }

            PacketType::LaborTimeSend => {
                let handle = agent.clone();
                thread::spawn(move || handle.receive_labor_time(&packet));
            }

            PacketType::LaborContractCancel => agent.receive_labor_cancel(&packet),

            PacketType::InfoReq | PacketType::InfoReqBroadcast => agent.handle_info_request(&packet),

            PacketType::TickGrant | PacketType::TickGrantBroadcast => {
                if let Payload::TickGrant { ticks, step } = packet.payload {
                    agent.handle_tick_grant(ticks, step);
                } else {
                    agent.protocol_error(&packet, "malformed TICK_GRANT payload");
                }
            }

            PacketType::SaveCheckpoint | PacketType::SaveCheckpointBroadcast => {
                agent.handle_checkpoint_save(&packet)
            }
            PacketType::LoadCheckpoint | PacketType::LoadCheckpointBroadcast => {
                agent.handle_checkpoint_load(&packet)
            }

            _ => {
                warn!(target: "agent", id = %agent.id(), %packet, "unhandled packet type");
            }
        }
    }
    debug!(target: "agent", id = %agent.id(), "reader exiting");
}
