//! Builds well-formed gossip messages with per-type priority and TTL defaults.

use mesh_core::{unix_millis, NodeId, StorageCapabilities};
use uuid::Uuid;

use crate::message::*;
use crate::packed::MeshInfo;

/// Priority and TTL a freshly originated message of `kind` carries.
pub fn defaults_for(kind: MessageType) -> (MessagePriority, u8) {
    match kind {
        MessageType::Emergency => (MessagePriority::Emergency, 16),
        MessageType::Quorum => (MessagePriority::High, 8),
        MessageType::ComputeTask => (MessagePriority::High, 6),
        MessageType::NodeState => (MessagePriority::Normal, 5),
        MessageType::Service => (MessagePriority::Normal, 5),
        MessageType::I2pTunnel => (MessagePriority::Normal, 7),
        MessageType::Storage => (MessagePriority::Low, 5),
        MessageType::Heartbeat => (MessagePriority::Background, 1),
    }
}

/// Originates messages on behalf of one node.
#[derive(Debug, Clone)]
pub struct MessageFactory {
    node_id: NodeId,
}

impl MessageFactory {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Wrap an arbitrary payload with the defaults for its type.
    pub fn build(&self, payload: Payload) -> GossipMessage {
        let (priority, ttl) = defaults_for(payload.message_type());
        GossipMessage {
            id: Uuid::new_v4(),
            source: self.node_id.clone(),
            originator: self.node_id.clone(),
            priority,
            ttl,
            hop_count: 0,
            timestamp: unix_millis(),
            payload,
        }
    }

    pub fn node_state(
        &self,
        sequence: u32,
        mesh_info: MeshInfo,
        roles: u16,
        uptime_secs: u32,
    ) -> GossipMessage {
        self.build(Payload::NodeState(NodeStatePayload {
            sequence,
            mesh_info,
            roles,
            uptime_secs,
        }))
    }

    pub fn service(
        &self,
        name: impl Into<String>,
        port: u16,
        protocol: ServiceProtocol,
        available: bool,
    ) -> GossipMessage {
        self.build(Payload::Service(ServicePayload {
            name: name.into(),
            port,
            protocol,
            available,
        }))
    }

    pub fn compute_task(
        &self,
        task_id: impl Into<String>,
        cpu_percent: u8,
        memory_mb: u32,
        deadline_ms: u64,
    ) -> GossipMessage {
        self.build(Payload::ComputeTask(ComputeTaskPayload {
            task_id: task_id.into(),
            cpu_percent: cpu_percent.min(100),
            memory_mb,
            deadline_ms,
        }))
    }

    pub fn i2p_tunnel(
        &self,
        tunnel_id: u32,
        destination: impl Into<String>,
        direction: TunnelDirection,
        hop_length: u8,
        bandwidth_kbps: u32,
    ) -> GossipMessage {
        self.build(Payload::I2pTunnel(I2pTunnelPayload {
            tunnel_id,
            destination: destination.into(),
            direction,
            hop_length,
            bandwidth_kbps,
        }))
    }

    /// Storage advertisement for the local node's capabilities.
    pub fn storage(&self, caps: &StorageCapabilities) -> GossipMessage {
        self.build(Payload::Storage(StoragePayload::from(caps)))
    }

    pub fn quorum(
        &self,
        proposal_id: impl Into<String>,
        round: u32,
        vote: QuorumVote,
        participants: u16,
    ) -> GossipMessage {
        self.build(Payload::Quorum(QuorumPayload {
            proposal_id: proposal_id.into(),
            round,
            vote,
            participants,
        }))
    }

    pub fn heartbeat(&self, sequence: u32, uptime_secs: u32) -> GossipMessage {
        self.build(Payload::Heartbeat(HeartbeatPayload {
            sequence,
            uptime_secs,
        }))
    }

    pub fn emergency(
        &self,
        kind: EmergencyKind,
        severity: u8,
        description: impl Into<String>,
    ) -> GossipMessage {
        self.build(Payload::Emergency(EmergencyPayload {
            kind,
            severity: severity.min(10),
            description: description.into(),
        }))
    }
}
