//! Gossip message model
//!
//! A [`GossipMessage`] is an immutable envelope around one typed [`Payload`].
//! The only mutation a message ever sees is the hop/TTL step performed by
//! [`GossipMessage::relayed`], which returns a new value.

use mesh_core::{NodeId, StorageCapabilities, StorageFeature};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::packed::MeshInfo;

/// Closed set of control-plane message types (wire tag in parentheses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    NodeState,
    Service,
    ComputeTask,
    I2pTunnel,
    Storage,
    Quorum,
    Heartbeat,
    Emergency,
}

impl MessageType {
    pub fn tag(&self) -> u8 {
        match self {
            MessageType::NodeState => 1,
            MessageType::Service => 2,
            MessageType::ComputeTask => 3,
            MessageType::I2pTunnel => 4,
            MessageType::Storage => 5,
            MessageType::Quorum => 6,
            MessageType::Heartbeat => 7,
            MessageType::Emergency => 8,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            1 => MessageType::NodeState,
            2 => MessageType::Service,
            3 => MessageType::ComputeTask,
            4 => MessageType::I2pTunnel,
            5 => MessageType::Storage,
            6 => MessageType::Quorum,
            7 => MessageType::Heartbeat,
            8 => MessageType::Emergency,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// Dissemination priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Emergency,
    High,
    Normal,
    Low,
    Background,
}

impl MessagePriority {
    pub fn tag(&self) -> u8 {
        match self {
            MessagePriority::Emergency => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
            MessagePriority::Background => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => MessagePriority::Emergency,
            1 => MessagePriority::High,
            2 => MessagePriority::Normal,
            3 => MessagePriority::Low,
            4 => MessagePriority::Background,
            other => return Err(CodecError::UnknownPriority(other)),
        })
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────

/// Role bits advertised in node-state messages.
pub mod roles {
    pub const RELAY: u16 = 1 << 0;
    pub const STORAGE: u16 = 1 << 1;
    pub const COMPUTE: u16 = 1 << 2;
    pub const GATEWAY: u16 = 1 << 3;
    pub const I2P_ROUTER: u16 = 1 << 4;
    pub const COORDINATOR: u16 = 1 << 5;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatePayload {
    /// Monotonic per-originator sequence; stale states are ignored
    pub sequence: u32,
    pub mesh_info: MeshInfo,
    pub roles: u16,
    pub uptime_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePayload {
    pub name: String,
    pub port: u16,
    pub protocol: ServiceProtocol,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTaskPayload {
    pub task_id: String,
    /// Requested CPU share, 0-100
    pub cpu_percent: u8,
    pub memory_mb: u32,
    /// Unix ms after which the result is useless
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2pTunnelPayload {
    pub tunnel_id: u32,
    pub destination: String,
    pub direction: TunnelDirection,
    pub hop_length: u8,
    pub bandwidth_kbps: u32,
}

/// Storage advertisement derived from [`StorageCapabilities`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePayload {
    pub offered_bytes: u64,
    pub used_bytes: u64,
    pub replication_factor: u8,
    pub file_count: u32,
    /// Replication health in percent
    pub health_percent: u8,
    /// Bit set of [`StorageFeature`]
    pub features: u8,
    pub accepting_replicas: bool,
}

impl StoragePayload {
    pub fn free_bytes(&self) -> u64 {
        self.offered_bytes.saturating_sub(self.used_bytes)
    }

    pub fn feature_list(&self) -> Vec<StorageFeature> {
        ALL_FEATURES
            .iter()
            .copied()
            .filter(|f| self.features & feature_bit(*f) != 0)
            .collect()
    }
}

const ALL_FEATURES: [StorageFeature; 4] = [
    StorageFeature::Encryption,
    StorageFeature::Replication,
    StorageFeature::OfflineStaging,
    StorageFeature::ConflictDetection,
];

fn feature_bit(feature: StorageFeature) -> u8 {
    match feature {
        StorageFeature::Encryption => 1 << 0,
        StorageFeature::Replication => 1 << 1,
        StorageFeature::OfflineStaging => 1 << 2,
        StorageFeature::ConflictDetection => 1 << 3,
    }
}

impl From<&StorageCapabilities> for StoragePayload {
    fn from(caps: &StorageCapabilities) -> Self {
        Self {
            offered_bytes: caps.offered_bytes,
            used_bytes: caps.used_bytes,
            replication_factor: caps.replication_factor,
            file_count: u32::try_from(caps.file_count).unwrap_or(u32::MAX),
            health_percent: (caps.replication_health.clamp(0.0, 1.0) * 100.0).round() as u8,
            features: caps.features.iter().fold(0, |acc, f| acc | feature_bit(*f)),
            accepting_replicas: caps.participation_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumVote {
    Propose,
    Accept,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPayload {
    pub proposal_id: String,
    pub round: u32,
    pub vote: QuorumVote,
    pub participants: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub sequence: u32,
    pub uptime_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    NodeFailure,
    PartitionDetected,
    LowPower,
    SecurityAlert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyPayload {
    pub kind: EmergencyKind,
    /// 0 (informational) to 10 (critical)
    pub severity: u8,
    pub description: String,
}

/// Typed body of a gossip message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    NodeState(NodeStatePayload),
    Service(ServicePayload),
    ComputeTask(ComputeTaskPayload),
    I2pTunnel(I2pTunnelPayload),
    Storage(StoragePayload),
    Quorum(QuorumPayload),
    Heartbeat(HeartbeatPayload),
    Emergency(EmergencyPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::NodeState(_) => MessageType::NodeState,
            Payload::Service(_) => MessageType::Service,
            Payload::ComputeTask(_) => MessageType::ComputeTask,
            Payload::I2pTunnel(_) => MessageType::I2pTunnel,
            Payload::Storage(_) => MessageType::Storage,
            Payload::Quorum(_) => MessageType::Quorum,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
            Payload::Emergency(_) => MessageType::Emergency,
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub id: Uuid,
    /// Node that last transmitted this copy
    pub source: NodeId,
    /// Node that created the message
    pub originator: NodeId,
    pub priority: MessagePriority,
    /// Remaining hop budget
    pub ttl: u8,
    pub hop_count: u8,
    /// Unix ms at creation
    pub timestamp: u64,
    pub payload: Payload,
}

impl GossipMessage {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// The copy a relay forwards: one more hop, one less TTL, sent by `via`.
    /// `None` when the remaining budget does not allow another hop.
    pub fn relayed(&self, via: &str) -> Option<GossipMessage> {
        if self.ttl <= 1 {
            return None;
        }
        Some(GossipMessage {
            source: via.to_string(),
            ttl: self.ttl - 1,
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        })
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}
