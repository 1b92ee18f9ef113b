//! Gossip wire codec
//!
//! Frame layout (all integers big-endian):
//! ```text
//! [1: version=1][1: type][1: priority][1: ttl][1: hop_count]
//! [16: message id][8: timestamp ms]
//! [1: len][source utf-8][1: len][originator utf-8]
//! [4: payload_len][payload]
//! ```
//!
//! Strings inside payloads carry a 2-byte length prefix. A frame may start
//! at any offset of the buffer it is handed, and bytes after the frame are
//! left alone for the surrounding transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::CodecError;
use crate::message::*;
use crate::packed::MeshInfo;

pub const WIRE_VERSION: u8 = 1;

/// Fixed header bytes before the two variable-length node ids.
const FIXED_HEADER: usize = 1 + 1 + 1 + 1 + 1 + 16 + 8;

/// Encode `message` into a fresh buffer.
pub fn encode(message: &GossipMessage) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(FIXED_HEADER + 64);
    encode_into(message, &mut out)?;
    Ok(out.freeze())
}

/// Append the encoded frame to `out`, after whatever the caller already wrote.
pub fn encode_into(message: &GossipMessage, out: &mut BytesMut) -> Result<(), CodecError> {
    let mut payload = BytesMut::new();
    encode_payload(&message.payload, &mut payload)?;
    let payload_len = u32::try_from(payload.len()).map_err(|_| CodecError::FieldOutOfRange {
        field: "payload_len",
        value: payload.len() as u64,
    })?;

    out.put_u8(WIRE_VERSION);
    out.put_u8(message.message_type().tag());
    out.put_u8(message.priority.tag());
    out.put_u8(message.ttl);
    out.put_u8(message.hop_count);
    out.put_slice(message.id.as_bytes());
    out.put_u64(message.timestamp);
    put_short_str(out, "source", &message.source)?;
    put_short_str(out, "originator", &message.originator)?;
    out.put_u32(payload_len);
    out.put_slice(&payload);
    Ok(())
}

/// Decode the frame starting at `offset`.
pub fn decode(buf: &[u8], offset: usize) -> Result<GossipMessage, CodecError> {
    decode_frame(buf, offset).map(|(message, _)| message)
}

/// Decode the frame starting at `offset`, returning it with its length in bytes.
pub fn decode_frame(buf: &[u8], offset: usize) -> Result<(GossipMessage, usize), CodecError> {
    if offset > buf.len() {
        return Err(CodecError::Truncated {
            needed: offset,
            available: buf.len(),
        });
    }
    let start = &buf[offset..];
    let mut cur = start;

    need(cur, FIXED_HEADER)?;
    let version = cur.get_u8();
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let message_type = MessageType::from_tag(cur.get_u8())?;
    let priority = MessagePriority::from_tag(cur.get_u8())?;
    let ttl = cur.get_u8();
    let hop_count = cur.get_u8();
    let mut id = [0u8; 16];
    cur.copy_to_slice(&mut id);
    let timestamp = cur.get_u64();
    let source = get_short_str(&mut cur, "source")?;
    let originator = get_short_str(&mut cur, "originator")?;

    need(cur, 4)?;
    let declared = cur.get_u32() as usize;
    need(cur, declared)?;
    let mut body = &cur[..declared];
    let payload = decode_payload(message_type, &mut body)?;
    if body.has_remaining() {
        return Err(CodecError::PayloadMismatch {
            declared,
            consumed: declared - body.remaining(),
        });
    }
    cur.advance(declared);

    let consumed = start.len() - cur.remaining();
    Ok((
        GossipMessage {
            id: Uuid::from_bytes(id),
            source,
            originator,
            priority,
            ttl,
            hop_count,
            timestamp,
            payload,
        },
        consumed,
    ))
}

// ── Payload bodies ───────────────────────────────────────────────────────

fn encode_payload(payload: &Payload, out: &mut BytesMut) -> Result<(), CodecError> {
    match payload {
        Payload::NodeState(p) => {
            out.put_u32(p.sequence);
            out.put_u64(p.mesh_info.pack()?);
            out.put_u16(p.roles);
            out.put_u32(p.uptime_secs);
        }
        Payload::Service(p) => {
            put_str(out, "service.name", &p.name)?;
            out.put_u16(p.port);
            out.put_u8(match p.protocol {
                ServiceProtocol::Tcp => 0,
                ServiceProtocol::Udp => 1,
            });
            out.put_u8(u8::from(p.available));
        }
        Payload::ComputeTask(p) => {
            put_str(out, "compute.task_id", &p.task_id)?;
            out.put_u8(at_most(p.cpu_percent, 100, "compute.cpu_percent")?);
            out.put_u32(p.memory_mb);
            out.put_u64(p.deadline_ms);
        }
        Payload::I2pTunnel(p) => {
            out.put_u32(p.tunnel_id);
            put_str(out, "i2p.destination", &p.destination)?;
            out.put_u8(match p.direction {
                TunnelDirection::Inbound => 0,
                TunnelDirection::Outbound => 1,
            });
            out.put_u8(p.hop_length);
            out.put_u32(p.bandwidth_kbps);
        }
        Payload::Storage(p) => {
            out.put_u64(p.offered_bytes);
            out.put_u64(p.used_bytes);
            out.put_u8(p.replication_factor);
            out.put_u32(p.file_count);
            out.put_u8(at_most(p.health_percent, 100, "storage.health_percent")?);
            out.put_u8(p.features);
            out.put_u8(u8::from(p.accepting_replicas));
        }
        Payload::Quorum(p) => {
            put_str(out, "quorum.proposal_id", &p.proposal_id)?;
            out.put_u32(p.round);
            out.put_u8(match p.vote {
                QuorumVote::Propose => 0,
                QuorumVote::Accept => 1,
                QuorumVote::Reject => 2,
                QuorumVote::Abstain => 3,
            });
            out.put_u16(p.participants);
        }
        Payload::Heartbeat(p) => {
            out.put_u32(p.sequence);
            out.put_u32(p.uptime_secs);
        }
        Payload::Emergency(p) => {
            out.put_u8(match p.kind {
                EmergencyKind::NodeFailure => 0,
                EmergencyKind::PartitionDetected => 1,
                EmergencyKind::LowPower => 2,
                EmergencyKind::SecurityAlert => 3,
            });
            out.put_u8(at_most(p.severity, 10, "emergency.severity")?);
            put_str(out, "emergency.description", &p.description)?;
        }
    }
    Ok(())
}

fn decode_payload(kind: MessageType, cur: &mut &[u8]) -> Result<Payload, CodecError> {
    Ok(match kind {
        MessageType::NodeState => {
            need(cur, 4 + 8 + 2 + 4)?;
            Payload::NodeState(NodeStatePayload {
                sequence: cur.get_u32(),
                mesh_info: MeshInfo::unpack(cur.get_u64())?,
                roles: cur.get_u16(),
                uptime_secs: cur.get_u32(),
            })
        }
        MessageType::Service => {
            let name = get_str(cur, "service.name")?;
            need(cur, 2 + 1 + 1)?;
            let port = cur.get_u16();
            let protocol = match cur.get_u8() {
                0 => ServiceProtocol::Tcp,
                1 => ServiceProtocol::Udp,
                other => return Err(out_of_range("service.protocol", other)),
            };
            Payload::Service(ServicePayload {
                name,
                port,
                protocol,
                available: get_bool(cur, "service.available")?,
            })
        }
        MessageType::ComputeTask => {
            let task_id = get_str(cur, "compute.task_id")?;
            need(cur, 1 + 4 + 8)?;
            let cpu_percent = at_most(cur.get_u8(), 100, "compute.cpu_percent")?;
            Payload::ComputeTask(ComputeTaskPayload {
                task_id,
                cpu_percent,
                memory_mb: cur.get_u32(),
                deadline_ms: cur.get_u64(),
            })
        }
        MessageType::I2pTunnel => {
            need(cur, 4)?;
            let tunnel_id = cur.get_u32();
            let destination = get_str(cur, "i2p.destination")?;
            need(cur, 1 + 1 + 4)?;
            let direction = match cur.get_u8() {
                0 => TunnelDirection::Inbound,
                1 => TunnelDirection::Outbound,
                other => return Err(out_of_range("i2p.direction", other)),
            };
            Payload::I2pTunnel(I2pTunnelPayload {
                tunnel_id,
                destination,
                direction,
                hop_length: cur.get_u8(),
                bandwidth_kbps: cur.get_u32(),
            })
        }
        MessageType::Storage => {
            need(cur, 8 + 8 + 1 + 4 + 1 + 1)?;
            let offered_bytes = cur.get_u64();
            let used_bytes = cur.get_u64();
            let replication_factor = cur.get_u8();
            let file_count = cur.get_u32();
            let health_percent = at_most(cur.get_u8(), 100, "storage.health_percent")?;
            Payload::Storage(StoragePayload {
                offered_bytes,
                used_bytes,
                replication_factor,
                file_count,
                health_percent,
                features: cur.get_u8(),
                accepting_replicas: get_bool(cur, "storage.accepting_replicas")?,
            })
        }
        MessageType::Quorum => {
            let proposal_id = get_str(cur, "quorum.proposal_id")?;
            need(cur, 4 + 1 + 2)?;
            let round = cur.get_u32();
            let vote = match cur.get_u8() {
                0 => QuorumVote::Propose,
                1 => QuorumVote::Accept,
                2 => QuorumVote::Reject,
                3 => QuorumVote::Abstain,
                other => return Err(out_of_range("quorum.vote", other)),
            };
            Payload::Quorum(QuorumPayload {
                proposal_id,
                round,
                vote,
                participants: cur.get_u16(),
            })
        }
        MessageType::Heartbeat => {
            need(cur, 8)?;
            Payload::Heartbeat(HeartbeatPayload {
                sequence: cur.get_u32(),
                uptime_secs: cur.get_u32(),
            })
        }
        MessageType::Emergency => {
            need(cur, 2)?;
            let kind = match cur.get_u8() {
                0 => EmergencyKind::NodeFailure,
                1 => EmergencyKind::PartitionDetected,
                2 => EmergencyKind::LowPower,
                3 => EmergencyKind::SecurityAlert,
                other => return Err(out_of_range("emergency.kind", other)),
            };
            let severity = at_most(cur.get_u8(), 10, "emergency.severity")?;
            Payload::Emergency(EmergencyPayload {
                kind,
                severity,
                description: get_str(cur, "emergency.description")?,
            })
        }
    })
}

// ── Primitives ───────────────────────────────────────────────────────────

fn need(cur: &[u8], n: usize) -> Result<(), CodecError> {
    if cur.len() < n {
        return Err(CodecError::Truncated {
            needed: n,
            available: cur.len(),
        });
    }
    Ok(())
}

fn out_of_range(field: &'static str, value: u8) -> CodecError {
    CodecError::FieldOutOfRange {
        field,
        value: u64::from(value),
    }
}

/// Bounded fields are checked the same way in both directions.
fn at_most(value: u8, max: u8, field: &'static str) -> Result<u8, CodecError> {
    if value > max {
        return Err(out_of_range(field, value));
    }
    Ok(value)
}

fn get_bool(cur: &mut &[u8], field: &'static str) -> Result<bool, CodecError> {
    need(cur, 1)?;
    match cur.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(out_of_range(field, other)),
    }
}

fn put_short_str(out: &mut BytesMut, field: &'static str, s: &str) -> Result<(), CodecError> {
    let len = u8::try_from(s.len()).map_err(|_| CodecError::FieldOutOfRange {
        field,
        value: s.len() as u64,
    })?;
    out.put_u8(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn put_str(out: &mut BytesMut, field: &'static str, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::FieldOutOfRange {
        field,
        value: s.len() as u64,
    })?;
    out.put_u16(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn get_short_str(cur: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    need(cur, 1)?;
    let len = cur.get_u8() as usize;
    take_str(cur, len, field)
}

fn get_str(cur: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    need(cur, 2)?;
    let len = cur.get_u16() as usize;
    take_str(cur, len, field)
}

fn take_str(cur: &mut &[u8], len: usize, field: &'static str) -> Result<String, CodecError> {
    need(cur, len)?;
    let s = std::str::from_utf8(&cur[..len])
        .map_err(|_| CodecError::InvalidUtf8(field))?
        .to_string();
    cur.advance(len);
    Ok(s)
}
