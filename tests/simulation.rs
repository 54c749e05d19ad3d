//! End-to-end scenarios over a live in-process network: transfers, trades,
//! labor, the step barrier, snooping and checkpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use econ_sim::agent::production::{ItemDef, LandRequirement, Recipe};
use econ_sim::agent::{Agent, AgentBlueprint, AgentSettings};
use econ_sim::controllers::{build_controller, IdleController};
use econ_sim::link::Link;
use econ_sim::manager::{ManagerSettings, SimulationManager, MANAGER_ID};
use econ_sim::markets::{spawn_item_marketplace, ITEM_MARKET_ID};
use econ_sim::network::{ConnectionNetwork, NETWORK_ID};
use econ_sim::packets::{Packet, PacketType, Payload};
use econ_sim::stats::STATS_ID;
use econ_sim::trade::{ItemContainer, ItemListing, LaborListing, TradeRequest};

fn blueprint(agent_id: &str, settings: AgentSettings) -> AgentBlueprint {
    AgentBlueprint {
        agent_id: agent_id.to_string(),
        controller_type: "Pushover".to_string(),
        ticks_per_step: 8,
        manager_id: MANAGER_ID.to_string(),
        settings,
    }
}

fn with_balance(cents: i64) -> AgentSettings {
    AgentSettings { initial_balance: cents, ..AgentSettings::default() }
}

fn spawn(network: &mut ConnectionNetwork, agent_id: &str, settings: AgentSettings) -> Agent {
    spawn_with_items(network, agent_id, settings, Arc::new(HashMap::new()))
}

fn spawn_with_items(
    network: &mut ConnectionNetwork,
    agent_id: &str,
    settings: AgentSettings,
    items: Arc<HashMap<String, ItemDef>>,
) -> Agent {
    let link = network.register(agent_id);
    let controller = build_controller("Pushover", agent_id);
    Agent::spawn(blueprint(agent_id, settings), link, items, controller)
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Scenario: currency transfer happy path, with counters.
#[test]
fn currency_transfer_happy_path() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", with_balance(1000));
    let b = spawn(&mut network, "b", with_balance(0));
    network.start();

    assert!(a.send_currency(250, "b"));
    assert_eq!(a.balance(), 750);
    assert_eq!(b.balance(), 250);
    assert_eq!(a.ledger().currency_outflow.total, 250);
    assert_eq!(b.ledger().currency_inflow.total, 250);
}

/// Scenario: insufficient balance leaves everything untouched.
#[test]
fn currency_transfer_insufficient_balance() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", with_balance(100));
    let b = spawn(&mut network, "b", with_balance(0));
    network.start();

    assert!(!a.send_currency(200, "b"));
    assert_eq!(a.balance(), 100);
    assert_eq!(b.balance(), 0);
    assert_eq!(a.ledger().currency_outflow.total, 0);
    assert_eq!(b.ledger().currency_inflow.total, 0);
}

/// Round-trip law: sending the same amount back restores both balances.
#[test]
fn currency_round_trip_restores_balances() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", with_balance(500));
    let b = spawn(&mut network, "b", with_balance(500));
    network.start();

    assert!(a.send_currency(123, "b"));
    assert!(b.send_currency(123, "a"));
    assert_eq!(a.balance(), 500);
    assert_eq!(b.balance(), 500);
}

/// Boundary behaviors: zero transfers, self transfers, missing destination.
#[test]
fn transfer_boundaries() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", with_balance(100));
    network.start();

    // Zero-quantity transfers are no-ops returning success.
    assert!(a.send_currency(0, "b"));
    assert!(a.send_item(ItemContainer::new("apple", 0.0), "b"));
    // Self-transfers are rejected.
    assert!(!a.send_currency(10, "a"));
    // Unknown destination: the network answers with ERROR and the debit is
    // reversed.
    assert!(!a.send_currency(10, "ghost"));
    assert_eq!(a.balance(), 100);
}

/// Scenario: full trade round through the item marketplace.
#[test]
fn trade_round_through_marketplace() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    spawn_item_marketplace(network.register(ITEM_MARKET_ID), MANAGER_ID);
    let seller = spawn(&mut network, "seller", with_balance(0));
    let buyer = spawn(&mut network, "buyer", with_balance(50));
    network.start();

    seller.mint_item(ItemContainer::new("apple", 10.0));
    assert!(seller.update_item_listing(ItemListing::new("seller", "apple", 5, 10.0)));
    // The listing update is fire-and-forget; let the marketplace ingest it.
    assert!(wait_until(Duration::from_secs(1), || {
        !buyer.sample_item_listings("apple", 3).is_empty()
    }));

    let acquired = buyer.acquire_item(&ItemContainer::new("apple", 4.0), 5);
    assert_eq!(acquired.quantity, 4.0);

    assert_eq!(seller.balance(), 20);
    assert_eq!(seller.inventory_quantity("apple"), 6.0);
    assert_eq!(buyer.balance(), 30);
    assert_eq!(buyer.inventory_quantity("apple"), 4.0);

    // Flow accounting landed on the trade counters.
    assert_eq!(buyer.ledger().trade_expense.total, 20);
    assert_eq!(seller.ledger().trade_revenue.total, 20);
}

/// A request for more than the listing's maxQuantity is rejected even though
/// the controller would accept.
#[test]
fn trade_exceeding_listing_quantity_rejected() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let seller = spawn(&mut network, "seller", with_balance(0));
    let buyer = spawn(&mut network, "buyer", with_balance(1000));
    network.start();

    seller.mint_item(ItemContainer::new("apple", 100.0));
    seller.update_item_listing(ItemListing::new("seller", "apple", 5, 3.0));

    let request =
        TradeRequest::new("buyer", "seller", ItemContainer::new("apple", 4.0), 20);
    assert!(!buyer.send_trade_request(&request));
    assert_eq!(buyer.balance(), 1000);
    assert_eq!(seller.inventory_quantity("apple"), 100.0);
}

/// Underpaying against the advertised price is the buyer's problem.
#[test]
fn trade_underpaying_listing_price_rejected() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let seller = spawn(&mut network, "seller", with_balance(0));
    let buyer = spawn(&mut network, "buyer", with_balance(1000));
    network.start();

    seller.mint_item(ItemContainer::new("apple", 10.0));
    seller.update_item_listing(ItemListing::new("seller", "apple", 5, 10.0));

    let request = TradeRequest::new("buyer", "seller", ItemContainer::new("apple", 4.0), 19);
    assert!(!buyer.send_trade_request(&request));
    assert_eq!(seller.inventory_quantity("apple"), 10.0);
}

/// Round-trip law: allocate then deallocate restores land holdings, and only
/// unallocated land can be sent.
#[test]
fn land_allocation_round_trip_and_transfer() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", AgentSettings::default());
    let b = spawn(&mut network, "b", AgentSettings::default());
    network.start();

    a.mint_land("orchard", 5.0);
    assert!(a.allocate_land("orchard", 3.0));
    let holding = a.land_holding("orchard");
    assert_eq!(holding.allocated, 3.0);
    assert_eq!(holding.unallocated, 2.0);

    // Allocated land is not transferrable.
    assert!(!a.send_land("orchard", 3.0, "b"));

    assert!(a.deallocate_land("orchard", 3.0));
    let holding = a.land_holding("orchard");
    assert_eq!(holding.allocated, 0.0);
    assert_eq!(holding.unallocated, 5.0);

    assert!(a.send_land("orchard", 4.0, "b"));
    assert_eq!(a.land_holding("orchard").unallocated, 1.0);
    assert_eq!(b.land_holding("orchard").unallocated, 4.0);
}

/// Labor application, per-step fulfillment and the wage invariant: the
/// employer pays ticks x wagePerTick upon receipt of labor time.
#[test]
fn labor_contract_and_wage_payment() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let manager_link = network.register(MANAGER_ID);
    let employer = spawn(&mut network, "employer", with_balance(10_000));
    let worker = spawn(&mut network, "worker", with_balance(0));
    network.start();

    let listing = LaborListing {
        employer_id: "employer".into(),
        listing_tag: "field-hand".into(),
        skill_level: 0.0,
        wage_per_tick: 12,
        ticks_per_step: 4,
        contract_length: 3,
        applicants_considered: 1,
        last_updated: 0,
    };
    assert!(worker.send_job_application(&listing));
    assert_eq!(worker.worker_contracts().len(), 1);
    assert_eq!(employer.employer_contracts().len(), 1);

    // Duplicate application for the same (employer, worker, skill) is
    // rejected locally.
    assert!(!worker.send_job_application(&listing));

    // Grant step 1 (the contract starts one step after application).
    let grant = Packet::new(
        MANAGER_ID,
        "worker",
        PacketType::TickGrant,
        Payload::TickGrant { ticks: 8, step: 1 },
    );
    manager_link.send(grant).unwrap();

    assert!(wait_until(Duration::from_secs(2), || worker.balance() == 48));
    assert_eq!(employer.balance(), 10_000 - 48);
    assert_eq!(worker.ledger().labor_income.total, 48);
    assert_eq!(employer.ledger().labor_expense.total, 48);
    // The worker spent the contracted ticks.
    assert_eq!(worker.ticks_remaining(), 4);

    // Cancellation erases the contract on both sides.
    let contract = worker.worker_contracts().pop().unwrap();
    assert!(worker.cancel_labor_contract(&contract));
    assert!(wait_until(Duration::from_secs(1), || employer.employer_contracts().is_empty()));
    assert!(worker.worker_contracts().is_empty());
}

/// Scenario: the step barrier advances exactly once per step.
#[test]
fn step_barrier_advances_once_per_step() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let manager_link = network.register(MANAGER_ID);

    let items: Arc<HashMap<String, ItemDef>> = Arc::new(HashMap::new());
    let mut agents = Vec::new();
    for id in ["blocker.Idle.0", "blocker.Idle.1"] {
        let link = network.register(id);
        let mut bp = blueprint(id, AgentSettings::default());
        bp.controller_type = "Idle".into();
        bp.ticks_per_step = 2;
        agents.push(Agent::spawn(bp, link, Arc::clone(&items), Box::new(IdleController::new(id))));
    }
    network.start();

    let settings = ManagerSettings {
        simulation_steps: 4,
        ticks_per_step: 2,
        stall_budget: Duration::from_secs(5),
        settle_delay: Duration::from_millis(150),
        ..ManagerSettings::default()
    };
    let mut manager = SimulationManager::new(manager_link, settings);
    let completed = manager.run().unwrap();
    assert_eq!(completed, 4);

    for agent in &agents {
        agent.join();
    }
}

/// Scenario: sampling is uniform. 10 listings, sampleSize 3, 100k trials:
/// every listing appears with frequency 0.3 +/- 0.01.
#[test]
fn marketplace_sampling_is_uniform() {
    let (market_end, test_end) = econ_sim::link::link_pair();
    spawn_item_marketplace(market_end, MANAGER_ID);

    for i in 0..10 {
        let seller = format!("seller{i}");
        let listing = ItemListing::new(seller.clone(), "apple", 5 + i, 10.0);
        test_end
            .send(Packet::new(
                seller,
                ITEM_MARKET_ID,
                PacketType::ItemMarketUpdate,
                Payload::ItemListing(listing),
            ))
            .unwrap();
    }

    const TRIALS: usize = 100_000;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for trial in 0..TRIALS {
        let request = Packet::new(
            "buyer",
            ITEM_MARKET_ID,
            PacketType::ItemMarketSample,
            Payload::ItemSample { item_id: "apple".into(), sample_size: 3 },
        )
        .with_transaction(format!("t{trial}"));
        test_end.send(request).unwrap();
        match test_end.recv().unwrap().payload {
            Payload::ItemSampleAck(listings) => {
                assert_eq!(listings.len(), 3);
                for listing in listings {
                    *counts.entry(listing.seller_id).or_insert(0) += 1;
                }
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    for i in 0..10 {
        let frequency =
            counts.get(&format!("seller{i}")).copied().unwrap_or(0) as f64 / TRIALS as f64;
        assert!(
            (frequency - 0.3).abs() < 0.01,
            "seller{i} frequency {frequency} outside 0.3 +/- 0.01"
        );
    }
}

/// Scenario: a snooping observer sees exactly one copy of a trade ack, and
/// packets it sends itself are never looped back.
#[test]
fn snoop_observes_trade_ack_without_loopback() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, Some(STATS_ID.to_string()));
    let observer: Link = network.register(STATS_ID);
    let seller = spawn(&mut network, "seller", with_balance(0));
    let buyer = spawn(&mut network, "buyer", with_balance(100));
    network.start();

    observer
        .send(Packet::new(
            STATS_ID,
            NETWORK_ID,
            PacketType::SnoopStart,
            Payload::SnoopStart(vec![PacketType::TradeReqAck]),
        ))
        .unwrap();
    thread::sleep(Duration::from_millis(30));

    seller.mint_item(ItemContainer::new("apple", 5.0));
    let request = TradeRequest::new("buyer", "seller", ItemContainer::new("apple", 2.0), 10);
    assert!(buyer.send_trade_request(&request));

    let snooped = observer.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(snooped.packet_type, PacketType::Snoop);
    match snooped.payload {
        Payload::Wrapped(inner) => {
            assert_eq!(inner.packet_type, PacketType::TradeReqAck);
            assert!(!inner.incoming);
            match inner.payload {
                Payload::TradeRequestAck { accepted, request } => {
                    assert!(accepted);
                    assert_eq!(request.item.quantity, 2.0);
                }
                other => panic!("unexpected inner payload {other:?}"),
            }
        }
        other => panic!("unexpected payload {other:?}"),
    }
    // Exactly one copy.
    assert!(observer.recv_timeout(Duration::from_millis(100)).is_err());
}

/// Production consumes recipe inputs and scales down to the feasible
/// fraction; consumption debits inventory.
#[test]
fn production_scales_to_feasible_fraction() {
    let apple = ItemDef {
        id: "apple".into(),
        unit: "kg".into(),
        category: "food".into(),
        production: Some(Recipe {
            land: Some(LandRequirement { max_yield_per_hectare: 10.0, min_hectares: 1.0 }),
            variable_items: HashMap::from([("water".into(), 2.0)]),
            ..Recipe::default()
        }),
        utility: None,
        nutrients: HashMap::new(),
    };
    let items = Arc::new(HashMap::from([("apple".to_string(), apple)]));

    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let producer = spawn_with_items(&mut network, "producer", AgentSettings::default(), items);
    network.start();

    producer.mint_land("apple", 2.0);
    assert!(producer.allocate_land("apple", 2.0));
    producer.mint_item(ItemContainer::new("water", 8.0));

    // Water limits production to 4 despite the request for 10.
    let produced = producer.produce_item(&ItemContainer::new("apple", 10.0)).unwrap();
    assert!((produced.quantity - 4.0).abs() < 1e-6);
    assert_eq!(producer.inventory_quantity("water"), 0.0);
    assert!((producer.inventory_quantity("apple") - 4.0).abs() < 1e-6);

    // Consume part of the output.
    assert!(producer.consume_item(&ItemContainer::new("apple", 1.5)));
    assert!((producer.inventory_quantity("apple") - 2.5).abs() < 1e-6);
    assert!(!producer.consume_item(&ItemContainer::new("apple", 100.0)));
}

/// Round-trip law: saveCheckpoint then loadCheckpoint is the identity on
/// observable state.
#[test]
fn checkpoint_round_trip_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", with_balance(777));
    let b = spawn(&mut network, "b", with_balance(0));
    network.start();

    a.mint_item(ItemContainer::new("apple", 3.5));
    a.mint_land("orchard", 2.0);
    a.allocate_land("orchard", 1.0);
    assert!(a.send_currency(77, "b"));

    a.save_checkpoint(dir.path()).unwrap();

    // Disturb the state, then restore.
    a.mint_currency(1_000);
    a.mint_item(ItemContainer::new("apple", 10.0));
    a.load_checkpoint(dir.path()).unwrap();

    assert_eq!(a.balance(), 700);
    assert_eq!(a.inventory_quantity("apple"), 3.5);
    assert_eq!(a.land_holding("orchard").allocated, 1.0);
    assert_eq!(a.land_holding("orchard").unallocated, 1.0);
    assert_eq!(a.ledger().currency_outflow.total, 77);
}

/// Kill packets end an agent cleanly: pending waits fail, the reader exits
/// and the network drops the route.
#[test]
fn kill_packet_shuts_agent_down() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let manager_link = network.register(MANAGER_ID);
    let a = spawn(&mut network, "a", with_balance(100));
    network.start();

    manager_link
        .send(Packet::new(MANAGER_ID, "a", PacketType::KillPipeAgent, Payload::Empty))
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.is_shutting_down()));
    a.join();
}

/// Conservation: concurrent transfers between three agents never create or
/// destroy money.
#[test]
fn concurrent_transfers_conserve_currency() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let a = spawn(&mut network, "a", with_balance(1_000));
    let b = spawn(&mut network, "b", with_balance(1_000));
    let c = spawn(&mut network, "c", with_balance(1_000));
    network.start();

    let mut handles = Vec::new();
    for (from, to) in [(a.clone(), "b"), (b.clone(), "c"), (c.clone(), "a")] {
        handles.push(thread::spawn(move || {
            for i in 0i64..50 {
                from.send_currency(1 + (i % 7), to);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(a.balance() + b.balance() + c.balance(), 3_000);
    assert!(a.balance() >= 0 && b.balance() >= 0 && c.balance() >= 0);
}

/// Pushover employers accept applications through the real packet path.
#[test]
fn job_application_rejected_when_overcommitted() {
    let mut network = ConnectionNetwork::new(MANAGER_ID, None);
    let _employer = spawn(&mut network, "employer", with_balance(1_000));
    let worker = spawn(&mut network, "worker", with_balance(0));
    network.start();

    // ticks_per_step is 8; a 9-tick job cannot be taken.
    let listing = LaborListing {
        employer_id: "employer".into(),
        listing_tag: "overtime".into(),
        skill_level: 0.0,
        wage_per_tick: 1,
        ticks_per_step: 9,
        contract_length: 2,
        applicants_considered: 1,
        last_updated: 0,
    };
    assert!(!worker.send_job_application(&listing));
    assert!(worker.worker_contracts().is_empty());
}
