//! Inbound gossip processing and the per-node state it maintains.

use std::collections::{BTreeMap, HashMap, HashSet};

use mesh_core::config::GossipConfig;
use mesh_core::{unix_millis, NodeId};
use tracing::{debug, trace, Span};
use uuid::Uuid;

use crate::message::*;
use crate::packed::MeshInfo;

/// What the receive pipeline should do with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipOutcome {
    /// New message, state updated. `forward` is the copy to relay, if any.
    Accepted { forward: Option<GossipMessage> },
    Duplicate,
    Dropped(String),
}

/// Everything known about one remote node, fed to role assignment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeRecord {
    pub node_id: NodeId,
    /// Local clock, unix ms
    pub last_seen: u64,
    pub sequence: u32,
    pub mesh_info: Option<MeshInfo>,
    pub roles: u16,
    pub uptime_secs: u32,
    pub storage: Option<StoragePayload>,
    pub services: BTreeMap<String, ServicePayload>,
    pub last_heartbeat: Option<u64>,
    pub emergency: Option<EmergencyPayload>,
}

impl NodeRecord {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    fn link_quality(&self) -> u8 {
        self.mesh_info.map(|m| m.link_quality).unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct MeshView {
    node_id: NodeId,
    config: GossipConfig,
    seen: HashSet<Uuid>,
    nodes: HashMap<NodeId, NodeRecord>,
    span: Span,
}

impl MeshView {
    pub fn new(node_id: impl Into<NodeId>, config: GossipConfig, span: Span) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            seen: HashSet::new(),
            nodes: HashMap::new(),
            span,
        }
    }

    pub fn process(&mut self, message: GossipMessage) -> GossipOutcome {
        self.process_at(message, unix_millis())
    }

    /// Process `message` as if received at `now_ms`.
    pub fn process_at(&mut self, message: GossipMessage, now_ms: u64) -> GossipOutcome {
        let _entered = self.span.clone().entered();

        if message.originator == self.node_id || message.source == self.node_id {
            return GossipOutcome::Dropped("own message".into());
        }
        let age = message.age_ms(now_ms);
        if age > self.config.max_message_age_ms {
            debug!(id = %message.id, age_ms = age, "dropping stale gossip");
            return GossipOutcome::Dropped(format!("message too old ({age} ms)"));
        }
        if message.ttl == 0 {
            return GossipOutcome::Dropped("ttl exhausted".into());
        }
        if self.seen.contains(&message.id) {
            trace!(id = %message.id, "duplicate gossip");
            return GossipOutcome::Duplicate;
        }

        if self.seen.len() >= self.config.max_seen_messages {
            debug!(entries = self.seen.len(), "clearing gossip seen-set");
            self.seen.clear();
        }
        self.seen.insert(message.id);

        self.apply(&message, now_ms);

        GossipOutcome::Accepted {
            forward: message.relayed(&self.node_id),
        }
    }

    fn apply(&mut self, message: &GossipMessage, now_ms: u64) {
        let record = self
            .nodes
            .entry(message.originator.clone())
            .or_insert_with(|| NodeRecord::new(&message.originator));
        record.last_seen = now_ms;

        match &message.payload {
            Payload::NodeState(p) => {
                if p.sequence < record.sequence {
                    trace!(node = %record.node_id, seq = p.sequence, "ignoring stale node state");
                    return;
                }
                record.sequence = p.sequence;
                record.mesh_info = Some(p.mesh_info);
                record.roles = p.roles;
                record.uptime_secs = p.uptime_secs;
            }
            Payload::Service(p) => {
                record.services.insert(p.name.clone(), p.clone());
            }
            Payload::Storage(p) => {
                record.storage = Some(p.clone());
            }
            Payload::Heartbeat(p) => {
                record.last_heartbeat = Some(now_ms);
                record.uptime_secs = p.uptime_secs;
            }
            Payload::Emergency(p) => {
                debug!(node = %record.node_id, kind = ?p.kind, severity = p.severity, "emergency from peer");
                record.emergency = Some(p.clone());
            }
            Payload::ComputeTask(_) | Payload::I2pTunnel(_) | Payload::Quorum(_) => {}
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Nodes advertising free capacity and accepting replicas, most free
    /// bytes first, then best link quality.
    pub fn storage_nodes(&self) -> Vec<NodeId> {
        let mut candidates: Vec<(&NodeRecord, u64)> = self
            .nodes
            .values()
            .filter_map(|r| {
                r.storage
                    .as_ref()
                    .filter(|s| s.accepting_replicas && s.free_bytes() > 0)
                    .map(|s| (r, s.free_bytes()))
            })
            .collect();

        candidates.sort_by(|(a, a_free), (b, b_free)| {
            b_free
                .cmp(a_free)
                .then_with(|| b.link_quality().cmp(&a.link_quality()))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates
            .into_iter()
            .map(|(r, _)| r.node_id.clone())
            .collect()
    }
}
