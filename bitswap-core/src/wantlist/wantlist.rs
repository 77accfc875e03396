use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use tokio::sync::RwLock;

use super::entry::{Entry, WantType};

/// Mapping CID -> Entry for one direction (local wants, or what a single
/// peer wants from us). Shared behind an `Arc` by callers that need to
/// observe entries outside the lock (callers hold `Arc<Entry>`, not a
/// reference tied to the map's read guard).
#[derive(Debug, Default)]
pub struct WantList {
    entries: RwLock<HashMap<Cid, Arc<Entry>>>,
}

impl WantList {
    pub fn new() -> Self {
        WantList::default()
    }

    /// Inserts or updates an entry for `cid`. Returns `true` if the entry
    /// was created, or updated in place; `false` if this would have been a
    /// downgrade and was refused.
    pub async fn add(&self, cid: Cid, priority: i32, want_type: WantType) -> bool {
        let existing = self.entries.read().await.get(&cid).cloned();
        if let Some(entry) = existing {
            entry.upgrade(priority, want_type).await
        } else {
            let mut entries = self.entries.write().await;
            entries
                .entry(cid)
                .or_insert_with(|| Arc::new(Entry::new(cid, priority, want_type)));
            true
        }
    }

    pub async fn get(&self, cid: &Cid) -> Option<Arc<Entry>> {
        self.entries.read().await.get(cid).cloned()
    }

    pub async fn contains(&self, cid: &Cid) -> bool {
        self.entries.read().await.contains_key(cid)
    }

    /// Drops the entry unconditionally. Returns whatever entry was present.
    pub async fn remove(&self, cid: &Cid) -> Option<Arc<Entry>> {
        self.entries.write().await.remove(cid)
    }

    /// Drops the entry unless doing so for `want_type` would discard a
    /// stronger existing want (existing `Block`, incoming `Have`).
    pub async fn remove_type(&self, cid: &Cid, want_type: WantType) -> bool {
        let entry = {
            let entries = self.entries.read().await;
            match entries.get(cid) {
                Some(entry) => entry.clone(),
                None => return false,
            }
        };
        if matches!((entry.want_type().await, want_type), (WantType::Block, WantType::Have)) {
            return false;
        }
        self.entries.write().await.remove(cid);
        true
    }

    pub async fn entries(&self) -> Vec<Arc<Entry>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash::{Code, MultihashDigest};

    fn test_cid(seed: &[u8]) -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(seed))
    }

    #[tokio::test]
    async fn add_block_then_have_is_noop() {
        let wl = WantList::new();
        let cid = test_cid(b"a");
        assert!(wl.add(cid, 1, WantType::Block).await);
        assert!(!wl.add(cid, 5, WantType::Have).await);
        let e = wl.get(&cid).await.unwrap();
        assert_eq!(e.want_type().await, WantType::Block);
        assert_eq!(e.priority(), 1);
    }

    #[tokio::test]
    async fn add_block_then_block_raises_priority() {
        let wl = WantList::new();
        let cid = test_cid(b"b");
        assert!(wl.add(cid, 1, WantType::Block).await);
        assert!(wl.add(cid, 5, WantType::Block).await);
        let e = wl.get(&cid).await.unwrap();
        assert_eq!(e.priority(), 5);
    }

    #[tokio::test]
    async fn remove_type_keeps_block_against_have_removal() {
        let wl = WantList::new();
        let cid = test_cid(b"c");
        wl.add(cid, 1, WantType::Block).await;
        assert!(!wl.remove_type(&cid, WantType::Have).await);
        assert!(wl.contains(&cid).await);
        assert!(wl.remove_type(&cid, WantType::Block).await);
        assert!(!wl.contains(&cid).await);
    }
}
