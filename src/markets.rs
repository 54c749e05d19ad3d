//! The three marketplace billboards: Item, Labor and Land.
//!
//! Marketplaces are ordinary agents with well-known ids, living in the
//! network's host process for locality. Sellers post listings; buyers sample
//! them. Marketplaces never handle transactions and sampling never
//! reserves.
//!
//! Each store sits behind a single lock. Sampling takes a snapshot under
//! the lock and releases it before serializing the reply. Only the owner of
//! a listing may update or remove it; updates replace atomically; removes
//! are idempotent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::link::Link;
use crate::packets::{AgentId, Packet, PacketType, Payload};
use crate::trade::{ItemListing, LaborListing, LandListing};

pub const ITEM_MARKET_ID: &str = "ItemMarketplace";
pub const LABOR_MARKET_ID: &str = "LaborMarketplace";
pub const LAND_MARKET_ID: &str = "LandMarketplace";

/// A marketplace declares itself tick-blocked once its inbound traffic has
/// been quiet this long within a step.
const STALL_QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Behavior that differs between the three marketplaces: which packets they
/// answer and how their store checkpoints.
trait MarketStore: Send + 'static {
    fn market_id(&self) -> &'static str;

    /// Returns true when the packet type belongs to this marketplace.
    fn handle(&mut self, ctx: &MarketContext, packet: &Packet) -> bool;

    fn save(&self, directory: &Path) -> crate::error::Result<()>;
    fn load(&mut self, directory: &Path) -> crate::error::Result<()>;
}

struct MarketContext {
    outbound: crossbeam_channel::Sender<Packet>,
    manager_id: AgentId,
    step: AtomicU64,
}

impl MarketContext {
    fn send(&self, market_id: &str, packet: Packet) {
        debug!(target: "market", market = market_id, %packet, "OUTBOUND");
        if self.outbound.send(packet).is_err() {
            warn!(target: "market", market = market_id, "network link closed");
        }
    }

    fn reply(&self, market_id: &str, incoming: &Packet, packet_type: PacketType, payload: Payload) {
        let mut packet = Packet::new(market_id, incoming.sender.clone(), packet_type, payload);
        packet.transaction_id = incoming.transaction_id.clone();
        self.send(market_id, packet);
    }

    fn unauthorized(&self, market_id: &str, incoming: &Packet, what: &str) {
        warn!(target: "market", market = market_id, sender = %incoming.sender, what, "unauthorized mutation");
        self.reply(
            market_id,
            incoming,
            PacketType::Error,
            Payload::Text(format!("only the owner may modify {what}")),
        );
    }
}

/// Shared agent skeleton: reader loop, tick blocking by quiescence,
/// checkpoint handling.
fn market_loop<S: MarketStore>(mut store: S, link: Link, manager_id: AgentId) {
    let market_id = store.market_id();
    let ctx = Arc::new(MarketContext {
        outbound: link.sender(),
        manager_id,
        step: AtomicU64::new(0),
    });
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    info!(target: "market", market = market_id, "marketplace up");
    while let Ok(packet) = link.recv() {
        debug!(target: "market", market = market_id, %packet, "INBOUND");
        *last_activity.lock().expect("activity lock poisoned") = Instant::now();

        match packet.packet_type {
            PacketType::KillPipeAgent | PacketType::KillAllBroadcast => {
                let kill =
                    Packet::new(market_id, market_id, PacketType::KillPipeNetwork, Payload::Empty);
                ctx.send(market_id, kill);
                break;
            }

            PacketType::ControllerStartBroadcast | PacketType::ControllerStart => {
                let subscribe = Packet::new(
                    market_id,
                    ctx.manager_id.clone(),
                    PacketType::TickBlockSubscribe,
                    Payload::Empty,
                );
                ctx.send(market_id, subscribe);
            }

            PacketType::TickGrant | PacketType::TickGrantBroadcast => {
                if let Payload::TickGrant { step, .. } = packet.payload {
                    ctx.step.store(step, Ordering::SeqCst);
                }
                // A marketplace has no work of its own: it is "done" with a
                // step once nobody has talked to it for a quiet period.
                let ctx = Arc::clone(&ctx);
                let last_activity = Arc::clone(&last_activity);
                thread::spawn(move || {
                    loop {
                        thread::sleep(STALL_QUIET_PERIOD / 4);
                        let idle = last_activity
                            .lock()
                            .expect("activity lock poisoned")
                            .elapsed();
                        if idle >= STALL_QUIET_PERIOD {
                            break;
                        }
                    }
                    let blocked = Packet::new(
                        market_id,
                        ctx.manager_id.clone(),
                        PacketType::TickBlocked,
                        Payload::Empty,
                    );
                    ctx.send(market_id, blocked);
                });
            }

            PacketType::SaveCheckpoint | PacketType::SaveCheckpointBroadcast => {
                if let Payload::Checkpoint { path, .. } = &packet.payload {
                    match store.save(Path::new(path)) {
                        Ok(()) => ctx.reply(market_id, &packet, PacketType::SaveCheckpointAck, Payload::Empty),
                        Err(e) => {
                            warn!(target: "market", market = market_id, error = %e, "checkpoint save failed")
                        }
                    }
                }
            }
            PacketType::LoadCheckpoint | PacketType::LoadCheckpointBroadcast => {
                if let Payload::Checkpoint { path, .. } = &packet.payload {
                    if let Err(e) = store.load(Path::new(path)) {
                        warn!(target: "market", market = market_id, error = %e, "checkpoint load failed");
                    }
                }
            }

            PacketType::Error => {
                warn!(target: "market", market = market_id, %packet, "error packet received");
            }
            PacketType::TickBlockedAck => {}

            _ => {
                if !store.handle(&ctx, &packet) {
                    debug!(target: "market", market = market_id, %packet, "ignoring packet");
                }
            }
        }
    }
    info!(target: "market", market = market_id, "marketplace down");
}

/// Uniform k-subset of a snapshot; everything when fewer than k match.
fn sample_uniform<T: Clone>(snapshot: Vec<T>, sample_size: usize) -> Vec<T> {
    if snapshot.len() <= sample_size {
        return snapshot;
    }
    let mut rng = rand::thread_rng();
    snapshot.choose_multiple(&mut rng, sample_size).cloned().collect()
}

// ----------------------------------------------------------------------
// Item marketplace
// ----------------------------------------------------------------------

#[derive(Default)]
struct ItemStore {
    // (seller, item) -> listing
    listings: HashMap<(AgentId, String), ItemListing>,
}

impl MarketStore for ItemStore {
    fn market_id(&self) -> &'static str {
        ITEM_MARKET_ID
    }

    fn handle(&mut self, ctx: &MarketContext, packet: &Packet) -> bool {
        match (&packet.packet_type, &packet.payload) {
            (PacketType::ItemMarketUpdate, Payload::ItemListing(listing)) => {
                if listing.seller_id != packet.sender {
                    ctx.unauthorized(ITEM_MARKET_ID, packet, "an item listing");
                    return true;
                }
                let mut listing = listing.clone();
                listing.last_updated = ctx.step.load(Ordering::SeqCst);
                self.listings
                    .insert((listing.seller_id.clone(), listing.item_id.clone()), listing);
                true
            }
            (PacketType::ItemMarketRemove, Payload::ItemListing(listing)) => {
                if listing.seller_id != packet.sender {
                    ctx.unauthorized(ITEM_MARKET_ID, packet, "an item listing");
                    return true;
                }
                self.listings.remove(&(listing.seller_id.clone(), listing.item_id.clone()));
                true
            }
            (PacketType::ItemMarketSample, Payload::ItemSample { item_id, sample_size }) => {
                let snapshot: Vec<ItemListing> = self
                    .listings
                    .values()
                    .filter(|l| &l.item_id == item_id)
                    .cloned()
                    .collect();
                let sampled = sample_uniform(snapshot, *sample_size);
                ctx.reply(ITEM_MARKET_ID, packet, PacketType::ItemMarketSampleAck, Payload::ItemSampleAck(sampled));
                true
            }
            (PacketType::InfoReq | PacketType::InfoReqBroadcast, Payload::InfoRequest(request)) => {
                let mut answered = request.clone();
                answered.agent_id = ITEM_MARKET_ID.to_string();
                answered.info = (request.info_key == "itemMarket")
                    .then(|| serde_json::to_value(self.listings.values().collect::<Vec<_>>()).ok())
                    .flatten();
                ctx.reply(ITEM_MARKET_ID, packet, PacketType::InfoResp, Payload::InfoRequest(answered));
                true
            }
            _ => false,
        }
    }

    fn save(&self, directory: &Path) -> crate::error::Result<()> {
        let listings: Vec<ItemListing> = self.listings.values().cloned().collect();
        crate::checkpoint::save_store(directory, ITEM_MARKET_ID, &listings)
    }

    fn load(&mut self, directory: &Path) -> crate::error::Result<()> {
        let listings: Vec<ItemListing> = crate::checkpoint::load_store(directory, ITEM_MARKET_ID)?;
        self.listings = listings
            .into_iter()
            .map(|l| ((l.seller_id.clone(), l.item_id.clone()), l))
            .collect();
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Labor marketplace
// ----------------------------------------------------------------------

#[derive(Default)]
struct LaborStore {
    // (employer, tag) -> listing
    listings: HashMap<(AgentId, String), LaborListing>,
}

impl LaborStore {
    /// Listings within the skill band, best (highest) skill bands first,
    /// randomized within a band, at most `sample_size`.
    fn sample(&self, min_skill: f64, max_skill: f64, sample_size: usize) -> Vec<LaborListing> {
        let mut filtered: Vec<LaborListing> = self
            .listings
            .values()
            .filter(|l| l.skill_level >= min_skill && l.skill_level <= max_skill)
            .cloned()
            .collect();

        let mut rng = rand::thread_rng();
        filtered.shuffle(&mut rng);
        filtered.sort_by(|a, b| {
            b.skill_level.partial_cmp(&a.skill_level).expect("skill is not NaN")
        });
        filtered.truncate(sample_size);
        filtered
    }
}

impl MarketStore for LaborStore {
    fn market_id(&self) -> &'static str {
        LABOR_MARKET_ID
    }

    fn handle(&mut self, ctx: &MarketContext, packet: &Packet) -> bool {
        match (&packet.packet_type, &packet.payload) {
            (PacketType::LaborMarketUpdate, Payload::LaborListing(listing)) => {
                if listing.employer_id != packet.sender {
                    ctx.unauthorized(LABOR_MARKET_ID, packet, "a labor listing");
                    return true;
                }
                let mut listing = listing.clone();
                listing.last_updated = ctx.step.load(Ordering::SeqCst);
                self.listings
                    .insert((listing.employer_id.clone(), listing.listing_tag.clone()), listing);
                true
            }
            (PacketType::LaborMarketRemove, Payload::LaborListing(listing)) => {
                if listing.employer_id != packet.sender {
                    ctx.unauthorized(LABOR_MARKET_ID, packet, "a labor listing");
                    return true;
                }
                self.listings
                    .remove(&(listing.employer_id.clone(), listing.listing_tag.clone()));
                true
            }
            (
                PacketType::LaborMarketSample,
                Payload::LaborSample { min_skill_level, max_skill_level, sample_size },
            ) => {
                let sampled = self.sample(*min_skill_level, *max_skill_level, *sample_size);
                ctx.reply(LABOR_MARKET_ID, packet, PacketType::LaborMarketSampleAck, Payload::LaborSampleAck(sampled));
                true
            }
            (PacketType::InfoReq | PacketType::InfoReqBroadcast, Payload::InfoRequest(request)) => {
                let mut answered = request.clone();
                answered.agent_id = LABOR_MARKET_ID.to_string();
                answered.info = (request.info_key == "laborMarket")
                    .then(|| serde_json::to_value(self.listings.values().collect::<Vec<_>>()).ok())
                    .flatten();
                ctx.reply(LABOR_MARKET_ID, packet, PacketType::InfoResp, Payload::InfoRequest(answered));
                true
            }
            _ => false,
        }
    }

    fn save(&self, directory: &Path) -> crate::error::Result<()> {
        let listings: Vec<LaborListing> = self.listings.values().cloned().collect();
        crate::checkpoint::save_store(directory, LABOR_MARKET_ID, &listings)
    }

    fn load(&mut self, directory: &Path) -> crate::error::Result<()> {
        let listings: Vec<LaborListing> = crate::checkpoint::load_store(directory, LABOR_MARKET_ID)?;
        self.listings = listings
            .into_iter()
            .map(|l| ((l.employer_id.clone(), l.listing_tag.clone()), l))
            .collect();
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Land marketplace
// ----------------------------------------------------------------------

#[derive(Default)]
struct LandStore {
    // (seller, allocation) -> listing
    listings: HashMap<(AgentId, String), LandListing>,
}

impl MarketStore for LandStore {
    fn market_id(&self) -> &'static str {
        LAND_MARKET_ID
    }

    fn handle(&mut self, ctx: &MarketContext, packet: &Packet) -> bool {
        match (&packet.packet_type, &packet.payload) {
            (PacketType::LandMarketUpdate, Payload::LandListing(listing)) => {
                if listing.seller_id != packet.sender {
                    ctx.unauthorized(LAND_MARKET_ID, packet, "a land listing");
                    return true;
                }
                self.listings
                    .insert((listing.seller_id.clone(), listing.allocation.clone()), listing.clone());
                true
            }
            (PacketType::LandMarketRemove, Payload::LandListing(listing)) => {
                if listing.seller_id != packet.sender {
                    ctx.unauthorized(LAND_MARKET_ID, packet, "a land listing");
                    return true;
                }
                self.listings.remove(&(listing.seller_id.clone(), listing.allocation.clone()));
                true
            }
            (PacketType::LandMarketSample, Payload::LandSample { allocation, hectares, sample_size }) => {
                let snapshot: Vec<LandListing> = self
                    .listings
                    .values()
                    .filter(|l| &l.allocation == allocation && l.hectares >= *hectares)
                    .cloned()
                    .collect();
                let sampled = sample_uniform(snapshot, *sample_size);
                ctx.reply(LAND_MARKET_ID, packet, PacketType::LandMarketSampleAck, Payload::LandSampleAck(sampled));
                true
            }
            (PacketType::InfoReq | PacketType::InfoReqBroadcast, Payload::InfoRequest(request)) => {
                let mut answered = request.clone();
                answered.agent_id = LAND_MARKET_ID.to_string();
                answered.info = (request.info_key == "landMarket")
                    .then(|| serde_json::to_value(self.listings.values().collect::<Vec<_>>()).ok())
                    .flatten();
                ctx.reply(LAND_MARKET_ID, packet, PacketType::InfoResp, Payload::InfoRequest(answered));
                true
            }
            _ => false,
        }
    }

    fn save(&self, directory: &Path) -> crate::error::Result<()> {
        let listings: Vec<LandListing> = self.listings.values().cloned().collect();
        crate::checkpoint::save_store(directory, LAND_MARKET_ID, &listings)
    }

    fn load(&mut self, directory: &Path) -> crate::error::Result<()> {
        let listings: Vec<LandListing> = crate::checkpoint::load_store(directory, LAND_MARKET_ID)?;
        self.listings = listings
            .into_iter()
            .map(|l| ((l.seller_id.clone(), l.allocation.clone()), l))
            .collect();
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Spawners
// ----------------------------------------------------------------------

pub fn spawn_item_marketplace(link: Link, manager_id: impl Into<AgentId>) -> JoinHandle<()> {
    let manager_id = manager_id.into();
    thread::Builder::new()
        .name("item-market".into())
        .spawn(move || market_loop(ItemStore::default(), link, manager_id))
        .expect("failed to spawn item marketplace")
}

pub fn spawn_labor_marketplace(link: Link, manager_id: impl Into<AgentId>) -> JoinHandle<()> {
    let manager_id = manager_id.into();
    thread::Builder::new()
        .name("labor-market".into())
        .spawn(move || market_loop(LaborStore::default(), link, manager_id))
        .expect("failed to spawn labor marketplace")
}

pub fn spawn_land_marketplace(link: Link, manager_id: impl Into<AgentId>) -> JoinHandle<()> {
    let manager_id = manager_id.into();
    thread::Builder::new()
        .name("land-market".into())
        .spawn(move || market_loop(LandStore::default(), link, manager_id))
        .expect("failed to spawn land marketplace")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_pair;

    fn update(sender: &str, listing: ItemListing) -> Packet {
        Packet::new(sender, ITEM_MARKET_ID, PacketType::ItemMarketUpdate, Payload::ItemListing(listing))
    }

    fn sample_request(sender: &str, item_id: &str, k: usize, txn: &str) -> Packet {
        Packet::new(
            sender,
            ITEM_MARKET_ID,
            PacketType::ItemMarketSample,
            Payload::ItemSample { item_id: item_id.into(), sample_size: k },
        )
        .with_transaction(txn)
    }

    #[test]
    fn test_update_replaces_and_remove_is_idempotent() {
        let (market_end, test_end) = link_pair();
        spawn_item_marketplace(market_end, "manager");

        test_end.send(update("s1", ItemListing::new("s1", "apple", 5, 10.0))).unwrap();
        test_end.send(update("s1", ItemListing::new("s1", "apple", 7, 4.0))).unwrap();
        test_end.send(sample_request("b", "apple", 5, "t1")).unwrap();

        let reply = test_end.recv().unwrap();
        match reply.payload {
            Payload::ItemSampleAck(listings) => {
                assert_eq!(listings.len(), 1);
                assert_eq!(listings[0].unit_price, 7);
                assert_eq!(listings[0].max_quantity, 4.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let removal = Packet::new(
            "s1",
            ITEM_MARKET_ID,
            PacketType::ItemMarketRemove,
            Payload::ItemListing(ItemListing::new("s1", "apple", 7, 4.0)),
        );
        test_end.send(removal.clone()).unwrap();
        test_end.send(removal).unwrap(); // second remove is a no-op
        test_end.send(sample_request("b", "apple", 5, "t2")).unwrap();
        match test_end.recv().unwrap().payload {
            Payload::ItemSampleAck(listings) => assert!(listings.is_empty()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_only_owner_may_mutate() {
        let (market_end, test_end) = link_pair();
        spawn_item_marketplace(market_end, "manager");

        test_end.send(update("imposter", ItemListing::new("s1", "apple", 5, 10.0))).unwrap();
        assert_eq!(test_end.recv().unwrap().packet_type, PacketType::Error);

        test_end.send(sample_request("b", "apple", 5, "t1")).unwrap();
        match test_end.recv().unwrap().payload {
            Payload::ItemSampleAck(listings) => assert!(listings.is_empty()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_sample_size_zero_returns_empty() {
        let (market_end, test_end) = link_pair();
        spawn_item_marketplace(market_end, "manager");

        test_end.send(update("s1", ItemListing::new("s1", "apple", 5, 10.0))).unwrap();
        test_end.send(sample_request("b", "apple", 0, "t1")).unwrap();
        match test_end.recv().unwrap().payload {
            Payload::ItemSampleAck(listings) => assert!(listings.is_empty()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_labor_sampling_prefers_high_skill_bands() {
        let (market_end, test_end) = link_pair();
        spawn_labor_marketplace(market_end, "manager");

        for (tag, skill) in [("low", 0.1), ("mid", 0.5), ("high", 0.9)] {
            let listing = LaborListing {
                employer_id: "e1".into(),
                listing_tag: tag.into(),
                skill_level: skill,
                wage_per_tick: 10,
                ticks_per_step: 4,
                contract_length: 3,
                applicants_considered: 1,
                last_updated: 0,
            };
            test_end
                .send(Packet::new(
                    "e1",
                    LABOR_MARKET_ID,
                    PacketType::LaborMarketUpdate,
                    Payload::LaborListing(listing),
                ))
                .unwrap();
        }

        let request = Packet::new(
            "w",
            LABOR_MARKET_ID,
            PacketType::LaborMarketSample,
            Payload::LaborSample { min_skill_level: 0.0, max_skill_level: 0.6, sample_size: 1 },
        )
        .with_transaction("t1");
        test_end.send(request).unwrap();

        match test_end.recv().unwrap().payload {
            Payload::LaborSampleAck(listings) => {
                assert_eq!(listings.len(), 1);
                // 0.9 is over the worker's skill; the best in-band listing wins.
                assert_eq!(listings[0].listing_tag, "mid");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_land_sampling_filters_allocation_and_size() {
        let (market_end, test_end) = link_pair();
        spawn_land_marketplace(market_end, "manager");

        for (seller, allocation, hectares) in
            [("s1", "apple", 5.0), ("s2", "apple", 1.0), ("s3", "wheat", 10.0)]
        {
            let listing = LandListing {
                seller_id: seller.into(),
                allocation: allocation.into(),
                hectares,
                price_per_hectare: 100,
            };
            test_end
                .send(Packet::new(
                    seller,
                    LAND_MARKET_ID,
                    PacketType::LandMarketUpdate,
                    Payload::LandListing(listing),
                ))
                .unwrap();
        }

        let request = Packet::new(
            "b",
            LAND_MARKET_ID,
            PacketType::LandMarketSample,
            Payload::LandSample { allocation: "apple".into(), hectares: 2.0, sample_size: 5 },
        )
        .with_transaction("t1");
        test_end.send(request).unwrap();

        match test_end.recv().unwrap().payload {
            Payload::LandSampleAck(listings) => {
                assert_eq!(listings.len(), 1);
                assert_eq!(listings[0].seller_id, "s1");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
