use std::sync::Arc;

use cid::Cid;

/// An immutable content-addressed payload.
///
/// Equality, hashing and ordering are all by `cid` alone: two blocks with
/// the same CID are the same block, regardless of how their bytes are
/// stored.
#[derive(Debug, Clone)]
pub struct Block {
    pub cid: Cid,
    pub data: Arc<[u8]>,
}

impl Block {
    pub fn new(cid: Cid, data: impl Into<Arc<[u8]>>) -> Self {
        Block {
            cid,
            data: data.into(),
        }
    }

    /// Approximate in-memory footprint, used by queue/backpressure accounting.
    pub fn rough_size(&self) -> usize {
        self.data.len() + 64
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.cid == other.cid
    }
}

impl Eq for Block {}

impl std::hash::Hash for Block {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.cid.hash(state);
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cid.cmp(&other.cid)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use multihash::{Code, MultihashDigest};

    pub fn create_block_v1(data: &[u8]) -> Block {
        let hash = Code::Sha2_256.digest(data);
        let cid = Cid::new_v1(crate::RAW_CODEC, hash);
        Block::new(cid, data.to_vec())
    }

    pub fn create_block_v0(data: &[u8]) -> Block {
        let hash = Code::Sha2_256.digest(data);
        let cid = Cid::new_v0(hash).expect("sha2-256 digest is valid for cidv0");
        Block::new(cid, data.to_vec())
    }

    #[test]
    fn block_equality_is_by_cid() {
        let a = create_block_v1(b"hello world");
        let b = create_block_v1(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn v0_and_v1_cids_differ_for_same_bytes() {
        let v0 = create_block_v0(b"hello world");
        let v1 = create_block_v1(b"hello world");
        assert_ne!(v0.cid, v1.cid);
    }
}
