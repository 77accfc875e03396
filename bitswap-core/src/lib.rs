//! Content-addressed block exchange: a bitswap-style protocol for
//! discovering and retrieving blocks from a swarm of peers by [`cid::Cid`].

#[allow(clippy::all)]
pub(crate) mod bitswap_pb {
    include!(concat!(env!("OUT_DIR"), "/bitswap.pb.rs"));
}

/// Multicodec code for raw binary blocks (no further structure implied).
pub const RAW_CODEC: u64 = 0x55;

mod bitswap;
mod block;
mod config;
mod connection_manager;
mod decision;
mod engine;
mod ledger;
mod message;
mod network;
mod peer;
mod peer_manager;
mod prefix;
mod protocol;
mod session;
mod task;
mod wantlist;

pub use crate::bitswap::{Bitswap, GetOptions};
pub use block::Block;
pub use config::Config;
pub use ledger::Ledger;
pub use message::{BitswapMessage, DecodeError, MessageEntry, PresenceType, Priority};
pub use network::{BlockStore, MemoryBlockStore, MemoryNetwork, MemoryNetworkHandle, Network, Transport};
pub use peer::{Peer, PeerId};
pub use peer_manager::PeerManager;
pub use prefix::{Prefix, PrefixError};
pub use protocol::{ProtocolConfig, ProtocolId, DEFAULT_PROTOCOLS};
pub use session::{Session, SessionId, SessionManager};
pub use wantlist::{Entry, WantList, WantType};
