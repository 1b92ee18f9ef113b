//! Codec round trips across every message type, embedded in larger buffers.

use bytes::{BufMut, BytesMut};
use mesh_core::{StorageCapabilities, StorageFeature};
use mesh_gossip::message::*;
use mesh_gossip::{decode, decode_frame, encode, encode_into, MeshInfo, MessageFactory};
use proptest::prelude::*;
use uuid::Uuid;

fn all_types(f: &MessageFactory) -> Vec<GossipMessage> {
    let caps = StorageCapabilities {
        node_id: f.node_id().to_string(),
        offered_bytes: 1 << 30,
        used_bytes: 12_345,
        replication_factor: 3,
        file_count: 7,
        replication_health: 1.0,
        participation_enabled: true,
        features: vec![StorageFeature::Encryption, StorageFeature::Replication],
        access_patterns: vec![],
    };
    vec![
        f.node_state(9, MeshInfo::new(31, 1.0, -128, 100, true, true, 255), roles::STORAGE, 3600),
        f.service("http", 8080, ServiceProtocol::Tcp, true),
        f.compute_task("job-1", 100, 2048, u64::MAX),
        f.i2p_tunnel(u32::MAX, "abcd.b32.i2p", TunnelDirection::Inbound, 3, 1024),
        f.storage(&caps),
        f.quorum("prop-7", 3, QuorumVote::Reject, 11),
        f.heartbeat(0, 0),
        f.emergency(EmergencyKind::PartitionDetected, 7, "lost uplink ✈"),
    ]
}

#[test]
fn every_type_roundtrips() {
    let f = MessageFactory::new("node-a");
    for msg in all_types(&f) {
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes, 0).unwrap(), msg, "{:?}", msg.message_type());
    }
}

#[test]
fn back_to_back_frames_decode_in_sequence() {
    let f = MessageFactory::new("node-a");
    let msgs = all_types(&f);

    let mut buf = BytesMut::new();
    buf.put_slice(b"HDR");
    for m in &msgs {
        encode_into(m, &mut buf).unwrap();
    }

    let mut offset = 3;
    for expected in &msgs {
        let (msg, used) = decode_frame(&buf, offset).unwrap();
        assert_eq!(&msg, expected);
        offset += used;
    }
    assert_eq!(offset, buf.len());
}

#[test]
fn relayed_copy_survives_wire() {
    let f = MessageFactory::new("origin");
    let relayed = f.emergency(EmergencyKind::NodeFailure, 9, "down").relayed("relay").unwrap();
    let decoded = decode(&encode(&relayed).unwrap(), 0).unwrap();
    assert_eq!(decoded.hop_count, 1);
    assert_eq!(decoded.ttl, 15);
    assert_eq!(decoded.source, "relay");
    assert_eq!(decoded.originator, "origin");
}

fn arb_priority() -> impl Strategy<Value = MessagePriority> {
    prop_oneof![
        Just(MessagePriority::Emergency),
        Just(MessagePriority::High),
        Just(MessagePriority::Normal),
        Just(MessagePriority::Low),
        Just(MessagePriority::Background),
    ]
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    prop_oneof![
        (any::<u32>(), 0u8..=31, 0.0f32..=1.0, -128i8..=0, 0u8..=100, any::<bool>(), any::<u8>(), any::<u16>())
            .prop_map(|(seq, n, c, s, b, conn, lq, roles)| {
                Payload::NodeState(NodeStatePayload {
                    sequence: seq,
                    mesh_info: MeshInfo::new(n, c, s, b, conn, !conn, lq),
                    roles,
                    uptime_secs: seq / 2,
                })
            }),
        ("[a-z0-9-]{0,40}", any::<u16>(), any::<bool>()).prop_map(|(name, port, available)| {
            Payload::Service(ServicePayload {
                name,
                port,
                protocol: ServiceProtocol::Udp,
                available,
            })
        }),
        ("\\PC{0,20}", 0u8..=100, any::<u32>(), any::<u64>()).prop_map(|(id, cpu, mem, dl)| {
            Payload::ComputeTask(ComputeTaskPayload {
                task_id: id,
                cpu_percent: cpu,
                memory_mb: mem,
                deadline_ms: dl,
            })
        }),
        (any::<u64>(), any::<u64>(), any::<u8>(), any::<u32>(), 0u8..=100, 0u8..=15, any::<bool>())
            .prop_map(|(offered, used, rf, files, health, features, accepting)| {
                Payload::Storage(StoragePayload {
                    offered_bytes: offered,
                    used_bytes: used,
                    replication_factor: rf,
                    file_count: files,
                    health_percent: health,
                    features,
                    accepting_replicas: accepting,
                })
            }),
        (any::<u32>(), any::<u32>()).prop_map(|(sequence, uptime_secs)| {
            Payload::Heartbeat(HeartbeatPayload {
                sequence,
                uptime_secs,
            })
        }),
        (0u8..=10, "\\PC{0,64}").prop_map(|(severity, description)| {
            Payload::Emergency(EmergencyPayload {
                kind: EmergencyKind::SecurityAlert,
                severity,
                description,
            })
        }),
    ]
}

proptest! {
    #[test]
    fn roundtrip_at_any_offset(
        prefix in proptest::collection::vec(any::<u8>(), 0..64),
        suffix in proptest::collection::vec(any::<u8>(), 0..16),
        payload in arb_payload(),
        priority in arb_priority(),
        ttl in any::<u8>(),
        hop_count in any::<u8>(),
        timestamp in any::<u64>(),
        source in "[a-z0-9]{0,32}",
        originator in "[a-z0-9]{0,32}",
    ) {
        let msg = GossipMessage {
            id: Uuid::new_v4(),
            source,
            originator,
            priority,
            ttl,
            hop_count,
            timestamp,
            payload,
        };

        let mut buf = BytesMut::new();
        buf.put_slice(&prefix);
        encode_into(&msg, &mut buf).unwrap();
        let frame_len = buf.len() - prefix.len();
        buf.put_slice(&suffix);

        let (decoded, used) = decode_frame(&buf, prefix.len()).unwrap();
        prop_assert_eq!(decoded, msg);
        prop_assert_eq!(used, frame_len);
    }

    #[test]
    fn garbage_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256), offset in 0usize..300) {
        let _ = decode(&data, offset);
    }
}
