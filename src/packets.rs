use std::fmt;

use serde::{Deserialize, Serialize};

use crate::trade::{
    InfoRequest, ItemContainer, ItemListing, LaborContract, LaborListing, LandListing,
    LandTradeRequest, TradeRequest,
};

/// Agents are addressed by an opaque unique string id.
pub type AgentId = String;

/// Integer monetary unit. All currency arithmetic is exact.
pub type Cents = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    // Lifecycle
    KillPipeAgent,
    KillAllBroadcast,
    KillPipeNetwork,
    SnoopStart,
    Snoop,
    Error,

    // Trade
    CurrencyTransfer,
    CurrencyTransferAck,
    ItemTransfer,
    ItemTransferAck,
    TradeReq,
    TradeReqAck,
    LandTransfer,
    LandTransferAck,
    LandTradeReq,
    LandTradeReqAck,

    // Labor
    LaborApplication,
    LaborApplicationAck,
    LaborTimeSend,
    LaborContractCancel,
    LaborContractCancelAck,

    // Marketplaces
    ItemMarketUpdate,
    ItemMarketRemove,
    ItemMarketSample,
    ItemMarketSampleAck,
    LaborMarketUpdate,
    LaborMarketRemove,
    LaborMarketSample,
    LaborMarketSampleAck,
    LandMarketUpdate,
    LandMarketRemove,
    LandMarketSample,
    LandMarketSampleAck,

    // Observation
    ProductionNotification,
    InfoReq,
    InfoReqBroadcast,
    InfoResp,

    // Controller plumbing
    ControllerStart,
    ControllerStartBroadcast,
    ControllerMsg,
    ControllerMsgBroadcast,
    ErrorControllerStart,
    StopTrading,

    // Simulation management
    TickBlockSubscribe,
    TickBlocked,
    TickBlockedAck,
    TickGrant,
    TickGrantBroadcast,
    AdvanceStep,
    TerminateSimulation,
    ProcReady,
    ProcError,
    ProcStop,
    SaveCheckpoint,
    SaveCheckpointBroadcast,
    SaveCheckpointAck,
    LoadCheckpoint,
    LoadCheckpointBroadcast,
}

impl PacketType {
    /// Broadcast types are delivered to every registered agent except the sender.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            PacketType::KillAllBroadcast
                | PacketType::InfoReqBroadcast
                | PacketType::ControllerStartBroadcast
                | PacketType::ControllerMsgBroadcast
                | PacketType::TickGrantBroadcast
                | PacketType::SaveCheckpointBroadcast
                | PacketType::LoadCheckpointBroadcast
        )
    }

    /// Acks complete an outstanding transaction keyed by `transaction_id`.
    pub fn is_ack(self) -> bool {
        matches!(
            self,
            PacketType::CurrencyTransferAck
                | PacketType::ItemTransferAck
                | PacketType::TradeReqAck
                | PacketType::LandTransferAck
                | PacketType::LandTradeReqAck
                | PacketType::LaborApplicationAck
                | PacketType::LaborContractCancelAck
                | PacketType::ItemMarketSampleAck
                | PacketType::LaborMarketSampleAck
                | PacketType::LandMarketSampleAck
                | PacketType::TickBlockedAck
                | PacketType::SaveCheckpointAck
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Wire spelling, e.g. TICK_GRANT_BROADCAST.
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Text(String),

    CurrencyTransfer { payment_id: String, cents: Cents },
    CurrencyTransferAck { payment_id: String, transfer_success: bool },
    ItemTransfer { transfer_id: String, item: ItemContainer },
    ItemTransferAck { transfer_id: String, transfer_success: bool },
    LandTransfer { transfer_id: String, allocation: String, hectares: f64 },
    LandTransferAck { transfer_id: String, transfer_success: bool },

    TradeRequest(TradeRequest),
    TradeRequestAck { request: TradeRequest, accepted: bool },
    LandTradeRequest(LandTradeRequest),
    LandTradeRequestAck { request: LandTradeRequest, accepted: bool },

    LaborApplication { contract: LaborContract, application_id: String },
    LaborApplicationAck { contract: LaborContract, accepted: bool },
    LaborTimeSend { ticks: u32, skill_level: f64, contract_id: String },
    LaborContractCancel { contract: LaborContract },
    LaborContractCancelAck { contract_id: String },

    ItemListing(ItemListing),
    LaborListing(LaborListing),
    LandListing(LandListing),
    ItemSample { item_id: String, sample_size: usize },
    ItemSampleAck(Vec<ItemListing>),
    LaborSample { min_skill_level: f64, max_skill_level: f64, sample_size: usize },
    LaborSampleAck(Vec<LaborListing>),
    LandSample { allocation: String, hectares: f64, sample_size: usize },
    LandSampleAck(Vec<LandListing>),

    ProductionNotification { producer_id: AgentId, item: ItemContainer, step: u64 },
    InfoRequest(InfoRequest),

    /// Nested packet, used by CONTROLLER_MSG[_BROADCAST] and SNOOP.
    Wrapped(Box<Packet>),
    /// Packet types an observer wants forwarded to it.
    SnoopStart(Vec<PacketType>),

    TickGrant { ticks: u32, step: u64 },
    AdvanceStep { step: u64 },
    Checkpoint { path: String, step: u64 },
    ProcStatus { proc_name: String, error: Option<String> },
}

/// The envelope routed by the ConnectionNetwork.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sender: AgentId,
    pub destination: Option<AgentId>,
    pub payload: Payload,
    pub transaction_id: Option<String>,
    /// True for packets as originally sent by an agent; snoop copies are
    /// flagged false so observers cannot create a forwarding loop.
    #[serde(default = "default_incoming")]
    pub incoming: bool,
}

fn default_incoming() -> bool {
    true
}

impl Packet {
    pub fn new(
        sender: impl Into<AgentId>,
        destination: impl Into<AgentId>,
        packet_type: PacketType,
        payload: Payload,
    ) -> Self {
        Self {
            packet_type,
            sender: sender.into(),
            destination: Some(destination.into()),
            payload,
            transaction_id: None,
            incoming: true,
        }
    }

    /// A broadcast packet has no single destination.
    pub fn broadcast(sender: impl Into<AgentId>, packet_type: PacketType, payload: Payload) -> Self {
        Self {
            packet_type,
            sender: sender.into(),
            destination: None,
            payload,
            transaction_id: None,
            incoming: true,
        }
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {} -> {}, txn={})",
            self.packet_type,
            self.sender,
            self.destination.as_deref().unwrap_or("*"),
            self.transaction_id.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_classification() {
        assert!(PacketType::TickGrantBroadcast.is_broadcast());
        assert!(PacketType::KillAllBroadcast.is_broadcast());
        assert!(!PacketType::TickGrant.is_broadcast());
        assert!(!PacketType::CurrencyTransfer.is_broadcast());
    }

    #[test]
    fn test_ack_classification() {
        assert!(PacketType::CurrencyTransferAck.is_ack());
        assert!(PacketType::ItemMarketSampleAck.is_ack());
        assert!(!PacketType::CurrencyTransfer.is_ack());
    }

    #[test]
    fn test_wire_spelling() {
        assert_eq!(PacketType::TickGrantBroadcast.to_string(), "TICK_GRANT_BROADCAST");
        assert_eq!(PacketType::TradeReqAck.to_string(), "TRADE_REQ_ACK");
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet::new(
            "a",
            "b",
            PacketType::CurrencyTransfer,
            Payload::CurrencyTransfer { payment_id: "p1".into(), cents: 250 },
        )
        .with_transaction("p1");

        let encoded = serde_json::to_string(&packet).unwrap();
        let decoded: Packet = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.packet_type, PacketType::CurrencyTransfer);
        assert_eq!(decoded.transaction_id.as_deref(), Some("p1"));
        assert!(decoded.incoming);
    }
}
