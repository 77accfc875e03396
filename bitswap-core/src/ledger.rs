use std::sync::Arc;

use cid::Cid;

use crate::wantlist::{Entry, WantList, WantType};

/// Thin, direction-agnostic wrapper around a [`WantList`]. The same type
/// backs both the local ledger (what we want) and each peer's ledger (what
/// they want from us) — the direction is a matter of which `Peer`/facade
/// holds the instance, not of the type itself.
#[derive(Debug, Default)]
pub struct Ledger {
    wantlist: WantList,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            wantlist: WantList::new(),
        }
    }

    pub async fn wants(&self, cid: Cid, priority: i32, want_type: WantType) -> bool {
        self.wantlist.add(cid, priority, want_type).await
    }

    pub async fn cancel_want(&self, cid: &Cid) -> Option<Arc<Entry>> {
        self.wantlist.remove(cid).await
    }

    pub async fn cancel_want_type(&self, cid: &Cid, want_type: WantType) -> bool {
        self.wantlist.remove_type(cid, want_type).await
    }

    pub async fn get_entry(&self, cid: &Cid) -> Option<Arc<Entry>> {
        self.wantlist.get(cid).await
    }

    pub async fn contains(&self, cid: &Cid) -> bool {
        self.wantlist.contains(cid).await
    }

    pub async fn entries(&self) -> Vec<Arc<Entry>> {
        self.wantlist.entries().await
    }

    pub async fn is_empty(&self) -> bool {
        self.wantlist.is_empty().await
    }
}
