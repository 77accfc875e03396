use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use cid::Cid;
use tokio::sync::{watch, RwLock};

use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WantType {
    Block,
    Have,
}

/// `true` is a downgrade from `existing` to `incoming`: we already have a
/// stronger want on file and the new one would weaken it.
fn is_downgrade(existing: WantType, incoming: WantType) -> bool {
    matches!((existing, incoming), (WantType::Block, WantType::Have))
}

/// One outstanding local want. Shared via `Arc` between the facade, the
/// engine, and any sessions waiting on it; `block_event` lets any number of
/// waiters observe the one-shot transition from "no block yet" to
/// "block present" without holding a lock across an `.await`.
#[derive(Debug)]
pub struct Entry {
    pub cid: Cid,
    priority: AtomicI32,
    state: RwLock<EntryState>,
    block_tx: watch::Sender<bool>,
    block_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
struct EntryState {
    want_type: WantType,
    block: Option<Bytes>,
    sessions: HashSet<SessionId>,
}

impl Entry {
    pub fn new(cid: Cid, priority: i32, want_type: WantType) -> Self {
        let (block_tx, block_rx) = watch::channel(false);
        Entry {
            cid,
            priority: AtomicI32::new(priority),
            state: RwLock::new(EntryState {
                want_type,
                block: None,
                sessions: HashSet::new(),
            }),
            block_tx,
            block_rx,
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub async fn want_type(&self) -> WantType {
        self.state.read().await.want_type
    }

    pub async fn block(&self) -> Option<Bytes> {
        self.state.read().await.block.clone()
    }

    pub fn has_block(&self) -> bool {
        *self.block_rx.borrow()
    }

    /// A clone of the watch receiver; `changed()`/`wait_for` observe the
    /// edge-triggered transition even for a receiver created after the
    /// block was already set (it will see the latched `true` immediately).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.block_rx.clone()
    }

    /// Sets `block` if unset. Returns `true` if this call performed the
    /// transition (and therefore raised `block_event`).
    pub async fn set_block(&self, data: Bytes) -> bool {
        let mut state = self.state.write().await;
        if state.block.is_some() {
            return false;
        }
        state.block = Some(data);
        // never fails: `self` holds the receiver, so the channel can't be closed.
        let _ = self.block_tx.send(true);
        true
    }

    /// Applies `(priority, want_type)` as in `WantList::add`: refuses a
    /// downgrade, otherwise raises priority monotonically and allows
    /// `Have -> Block` upgrades. Returns `false` if the update was
    /// rejected as a downgrade.
    pub async fn upgrade(&self, priority: i32, want_type: WantType) -> bool {
        let mut state = self.state.write().await;
        if is_downgrade(state.want_type, want_type) {
            return false;
        }
        state.want_type = want_type;
        drop(state);
        self.priority.fetch_max(priority, Ordering::AcqRel);
        true
    }

    pub async fn add_session(&self, session: SessionId) {
        self.state.write().await.sessions.insert(session);
    }

    pub async fn remove_session(&self, session: SessionId) {
        self.state.write().await.sessions.remove(&session);
    }

    pub async fn sessions(&self) -> Vec<SessionId> {
        self.state.read().await.sessions.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash::{Code, MultihashDigest};

    fn test_cid() -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(b"entry-test"))
    }

    #[tokio::test]
    async fn block_transition_is_monotone() {
        let e = Entry::new(test_cid(), 1, WantType::Block);
        assert!(!e.has_block());
        assert!(e.set_block(Bytes::from_static(b"hi")).await);
        assert!(e.has_block());
        // second set is a no-op, first write wins
        assert!(!e.set_block(Bytes::from_static(b"bye")).await);
        assert_eq!(e.block().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn block_to_have_downgrade_is_rejected() {
        let e = Entry::new(test_cid(), 1, WantType::Block);
        assert!(!e.upgrade(5, WantType::Have).await);
        assert_eq!(e.want_type().await, WantType::Block);
        assert_eq!(e.priority(), 1);
    }

    #[tokio::test]
    async fn have_to_block_upgrade_raises_priority() {
        let e = Entry::new(test_cid(), 1, WantType::Have);
        assert!(e.upgrade(5, WantType::Block).await);
        assert_eq!(e.want_type().await, WantType::Block);
        assert_eq!(e.priority(), 5);
    }

    #[tokio::test]
    async fn late_subscriber_sees_latched_block_event() {
        let e = Entry::new(test_cid(), 1, WantType::Block);
        e.set_block(Bytes::from_static(b"hi")).await;
        let mut rx = e.subscribe();
        assert!(*rx.borrow_and_update());
    }
}
