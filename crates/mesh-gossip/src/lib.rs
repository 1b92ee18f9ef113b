//! mesh-gossip: control-plane messages disseminated between mesh nodes
//!
//! - `message`: typed envelope and payloads
//! - `factory`: originates messages with per-type priority/TTL defaults
//! - `codec`: fixed-layout wire encoding, embeddable at any buffer offset
//! - `packed`: the 64-bit mesh-info word carried by node-state messages
//! - `view`: inbound processing (dedup, TTL, age) and per-node records

pub mod codec;
pub mod error;
pub mod factory;
pub mod message;
pub mod packed;
pub mod view;

pub use codec::{decode, decode_frame, encode, encode_into};
pub use error::CodecError;
pub use factory::{defaults_for, MessageFactory};
pub use message::{GossipMessage, MessagePriority, MessageType, Payload};
pub use packed::MeshInfo;
pub use view::{GossipOutcome, MeshView, NodeRecord};
