use std::collections::HashMap;

use bytes::Bytes;
use cid::Cid;
use multihash::{Code, MultihashDigest};
use thiserror::Error;

use crate::bitswap_pb;
use crate::block::Block;
use crate::prefix::{Prefix, PrefixError};
use crate::protocol::ProtocolId;
use crate::wantlist::WantType;

pub type Priority = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Have,
    DontHave,
}

/// A single wantlist line as it appears on the wire (or in a peer's
/// outbound ledger message before it is sent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub cid: Cid,
    pub priority: Priority,
    pub cancel: bool,
    pub want_type: WantType,
    pub send_dont_have: bool,
}

/// In-memory representation of one bitswap protocol message. Downgrades
/// are rejected by `want_block`/`want_have_block` using the same rule as
/// [`crate::wantlist::WantList::add`].
#[derive(Debug, Clone, Default)]
pub struct BitswapMessage {
    full: bool,
    want_list: HashMap<Cid, MessageEntry>,
    payload: HashMap<Cid, Block>,
    block_presences: HashMap<Cid, PresenceType>,
}

impl BitswapMessage {
    pub fn new() -> Self {
        BitswapMessage::default()
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    pub fn is_empty(&self) -> bool {
        self.want_list.is_empty() && self.payload.is_empty() && self.block_presences.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &MessageEntry> {
        self.want_list.values()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.payload.values()
    }

    pub fn pop_block(&mut self) -> Option<Block> {
        let cid = *self.payload.keys().next()?;
        self.payload.remove(&cid)
    }

    pub fn block_presences(&self) -> impl Iterator<Item = (&Cid, &PresenceType)> {
        self.block_presences.iter()
    }

    /// Inserts or upgrades a `Block`-want line. Returns `false` if this
    /// would downgrade an existing `Block` want to `Have`.
    pub fn want_block(&mut self, cid: &Cid, priority: Priority, send_dont_have: bool) -> bool {
        self.want(cid, priority, WantType::Block, send_dont_have)
    }

    pub fn want_have_block(&mut self, cid: &Cid, priority: Priority, send_dont_have: bool) -> bool {
        self.want(cid, priority, WantType::Have, send_dont_have)
    }

    fn want(
        &mut self,
        cid: &Cid,
        priority: Priority,
        want_type: WantType,
        send_dont_have: bool,
    ) -> bool {
        if let Some(existing) = self.want_list.get(cid) {
            if matches!(
                (existing.want_type, want_type),
                (WantType::Block, WantType::Have)
            ) {
                return false;
            }
        }
        self.want_list.insert(
            *cid,
            MessageEntry {
                cid: *cid,
                priority,
                cancel: false,
                want_type,
                send_dont_have,
            },
        );
        true
    }

    /// Removes the want line for `cid` from this builder (used before the
    /// message is sent; distinct from emitting a `cancel: true` entry).
    pub fn remove_want(&mut self, cid: &Cid) {
        self.want_list.remove(cid);
    }

    /// Replaces any want line for `cid` with an explicit cancel entry.
    pub fn cancel_block(&mut self, cid: &Cid) {
        self.want_list.insert(
            *cid,
            MessageEntry {
                cid: *cid,
                priority: 0,
                cancel: true,
                want_type: WantType::Block,
                send_dont_have: false,
            },
        );
    }

    pub fn add_block(&mut self, block: Block) {
        self.payload.insert(block.cid, block);
    }

    pub fn add_block_presence(&mut self, cid: Cid, presence: PresenceType) {
        self.block_presences.insert(cid, presence);
    }

    /// Serializes for `protocol`. 1.0.0/Legacy emit raw `blocks`; 1.1.0
    /// emits `payload` (prefix + data) and carries block-presence hints.
    pub fn to_bytes(&self, protocol: ProtocolId) -> Vec<u8> {
        let wantlist = bitswap_pb::message::Wantlist {
            entries: self
                .want_list
                .values()
                .map(|e| bitswap_pb::message::wantlist::Entry {
                    block: e.cid.to_bytes(),
                    priority: e.priority,
                    cancel: e.cancel,
                    want_type: match e.want_type {
                        WantType::Block => 0,
                        WantType::Have => 1,
                    },
                    send_dont_have: e.send_dont_have,
                })
                .collect(),
            full: self.full,
        };

        let (blocks, payload) = if protocol.supports_payload() {
            let payload = self
                .payload
                .values()
                .map(|b| bitswap_pb::message::Block {
                    prefix: Prefix::from(&b.cid).to_bytes(),
                    data: b.data.to_vec(),
                })
                .collect();
            (Vec::new(), payload)
        } else {
            let blocks = self.payload.values().map(|b| b.data.to_vec()).collect();
            (blocks, Vec::new())
        };

        let block_presences = if protocol.supports_presence() {
            self.block_presences
                .iter()
                .map(|(cid, p)| bitswap_pb::message::BlockPresence {
                    cid: cid.to_bytes(),
                    r#type: match p {
                        PresenceType::Have => 0,
                        PresenceType::DontHave => 1,
                    },
                })
                .collect()
        } else {
            Vec::new()
        };

        let msg = bitswap_pb::Message {
            wantlist: Some(wantlist),
            blocks,
            payload,
            block_presences,
            pending_bytes: 0,
        };

        prost::Message::encode_to_vec(&msg)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let msg: bitswap_pb::Message = prost::Message::decode(data)?;
        let mut out = BitswapMessage::new();

        if let Some(wl) = msg.wantlist {
            out.full = wl.full;
            for e in wl.entries {
                let cid = Cid::try_from(e.block.as_slice())?;
                let want_type = if e.want_type == 1 {
                    WantType::Have
                } else {
                    WantType::Block
                };
                out.want_list.insert(
                    cid,
                    MessageEntry {
                        cid,
                        priority: e.priority,
                        cancel: e.cancel,
                        want_type,
                        send_dont_have: e.send_dont_have,
                    },
                );
            }
        }

        // Legacy 1.0.0 payload: raw bytes, CIDv0 over sha2-256 implied.
        for data in msg.blocks {
            let hash = Code::Sha2_256.digest(&data);
            let cid = Cid::new_v0(hash).map_err(|_| DecodeError::InvalidCid)?;
            out.payload.insert(cid, Block::new(cid, data));
        }

        // 1.1.0+ payload: explicit prefix, arbitrary declared hash function.
        for entry in msg.payload {
            let prefix = Prefix::from_bytes(&entry.prefix)?;
            let cid = prefix.to_cid(&entry.data)?;
            out.payload.insert(cid, Block::new(cid, entry.data));
        }

        for bp in msg.block_presences {
            let cid = Cid::try_from(bp.cid.as_slice())?;
            let presence = if bp.r#type == 1 {
                PresenceType::DontHave
            } else {
                PresenceType::Have
            };
            out.block_presences.insert(cid, presence);
        }

        Ok(out)
    }
}

impl From<Bytes> for BitswapMessage {
    fn from(_: Bytes) -> Self {
        BitswapMessage::new()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decode protobuf message: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid cid in message")]
    InvalidCid,
    #[error("invalid cid prefix: {0}")]
    Prefix(#[from] PrefixError),
}

impl From<cid::Error> for DecodeError {
    fn from(_: cid::Error) -> Self {
        DecodeError::InvalidCid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cid(seed: &[u8]) -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(seed))
    }

    #[test]
    fn roundtrip_wantlist_payload_and_presence_110() {
        let mut msg = BitswapMessage::new();
        let cid = test_cid(b"hello");
        msg.want_block(&cid, 7, true);
        msg.add_block(Block::new(cid, b"hello".to_vec()));
        msg.add_block_presence(cid, PresenceType::Have);

        let bytes = msg.to_bytes(ProtocolId::Bitswap110);
        let decoded = BitswapMessage::from_bytes(&bytes).unwrap();

        let entry = decoded.wantlist().next().unwrap();
        assert_eq!(entry.cid, cid);
        assert_eq!(entry.priority, 7);
        assert!(entry.send_dont_have);

        let block = decoded.blocks().next().unwrap();
        assert_eq!(block.cid, cid);
        assert_eq!(&block.data[..], b"hello");

        assert_eq!(decoded.block_presences().next(), Some((&cid, &PresenceType::Have)));
    }

    #[test]
    fn presence_survives_110_roundtrip() {
        let mut msg = BitswapMessage::new();
        let cid = test_cid(b"presence");
        msg.add_block_presence(cid, PresenceType::DontHave);
        let bytes = msg.to_bytes(ProtocolId::Bitswap110);
        let decoded = BitswapMessage::from_bytes(&bytes).unwrap();
        assert_eq!(
            decoded.block_presences().next(),
            Some((&cid, &PresenceType::DontHave))
        );
    }

    #[test]
    fn presence_is_dropped_on_legacy_protocol() {
        let mut msg = BitswapMessage::new();
        let cid = test_cid(b"legacy-presence");
        msg.add_block_presence(cid, PresenceType::Have);
        let bytes = msg.to_bytes(ProtocolId::Bitswap100);
        let decoded = BitswapMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.block_presences().count(), 0);
    }

    #[test]
    fn legacy_payload_decodes_as_cidv0() {
        let mut msg = BitswapMessage::new();
        let v0_cid = Cid::new_v0(Code::Sha2_256.digest(b"legacy")).unwrap();
        msg.add_block(Block::new(v0_cid, b"legacy".to_vec()));
        let bytes = msg.to_bytes(ProtocolId::Bitswap100);
        let decoded = BitswapMessage::from_bytes(&bytes).unwrap();
        let block = decoded.blocks().next().unwrap();
        assert_eq!(block.cid, v0_cid);
    }

    #[test]
    fn want_block_rejects_downgrade_to_have() {
        let mut msg = BitswapMessage::new();
        let cid = test_cid(b"downgrade");
        assert!(msg.want_block(&cid, 1, false));
        assert!(!msg.want_have_block(&cid, 9, false));
        assert_eq!(msg.wantlist().next().unwrap().want_type, WantType::Block);
    }
}
