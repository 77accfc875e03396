use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::Config;
use crate::message::{BitswapMessage, PresenceType};
use crate::network::BlockStore;
use crate::peer::{Peer, Task};
use crate::peer_manager::PeerManager;
use crate::task::spawn_tracked;
use crate::wantlist::WantType;

/// Outbound fairness scheduler: picks the least-loaded peer with pending
/// work (ties broken by reciprocity), pops its highest-priority task, and
/// produces the appropriate response.
pub struct Decision {
    peer_manager: Arc<PeerManager>,
    block_store: Arc<dyn BlockStore>,
    config: Config,
}

impl Decision {
    pub fn new(peer_manager: Arc<PeerManager>, block_store: Arc<dyn BlockStore>, config: Config) -> Arc<Self> {
        Arc::new(Decision {
            peer_manager,
            block_store,
            config,
        })
    }

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        spawn_tracked("decision", token, async move {
            loop {
                this.run_once().await;
            }
        })
    }

    #[instrument(skip(self))]
    async fn run_once(&self) {
        let peers = self.peer_manager.peers().await;
        if peers.is_empty() {
            bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::DecisionIdleCycles);
            tokio::time::sleep(self.config.decision_sleep_timeout).await;
            return;
        }

        let min_queue_len = peers.iter().map(|p| p.response_queue_len()).min().unwrap_or(0);
        let least_loaded: Vec<Arc<Peer>> = peers
            .into_iter()
            .filter(|p| p.response_queue_len() == min_queue_len)
            .collect();

        let mut eligible = Vec::with_capacity(least_loaded.len());
        for peer in least_loaded {
            if peer.task_count().await > 0 {
                eligible.push(peer);
            }
        }
        if eligible.is_empty() {
            bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::DecisionIdleCycles);
            tokio::time::sleep(self.config.decision_sleep_timeout).await;
            return;
        }

        let peer = eligible
            .into_iter()
            .max_by(|a, b| a.rank().partial_cmp(&b.rank()).unwrap_or(std::cmp::Ordering::Equal))
            .expect("non-empty");

        loop {
            let Some(task) = peer.pop_task(self.config.task_wait_timeout).await else {
                return;
            };
            if !peer.ledger.contains(&task.cid).await {
                continue;
            }
            self.serve(&peer, task).await;
            return;
        }
    }

    async fn serve(&self, peer: &Arc<Peer>, task: Task) {
        let mut msg = BitswapMessage::new();
        match task.want_type {
            WantType::Block => self.respond_block_or_dont_have(&mut msg, &task).await,
            // The peer's want may have been upgraded to `Block` since this
            // task was queued; `respond_have` re-checks their live ledger
            // entry rather than trusting `task.want_type`.
            WantType::Have => self.respond_have(&mut msg, peer, &task).await,
        }
        if !msg.is_empty() {
            peer.push_response(msg);
        }
    }

    async fn respond_block_or_dont_have(&self, msg: &mut BitswapMessage, task: &Task) {
        if let Some(data) = self.block_store.get(&task.cid).await {
            msg.add_block(crate::block::Block::new(task.cid, data));
            bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::BlocksServed);
        } else {
            msg.add_block_presence(task.cid, PresenceType::DontHave);
        }
    }

    async fn respond_have(&self, msg: &mut BitswapMessage, peer: &Arc<Peer>, task: &Task) {
        let current_want_type = match peer.ledger.get_entry(&task.cid).await {
            Some(entry) => entry.want_type().await,
            None => return,
        };

        if current_want_type == WantType::Block {
            self.respond_block_or_dont_have(msg, task).await;
            return;
        }

        let have = self.block_store.has(&task.cid).await;
        if !have {
            if task.send_dont_have {
                msg.add_block_presence(task.cid, PresenceType::DontHave);
            }
            return;
        }

        let size = self.block_store.size(&task.cid).await.unwrap_or(usize::MAX);
        if size <= self.config.max_block_size_have_to_block {
            if let Some(data) = self.block_store.get(&task.cid).await {
                msg.add_block(crate::block::Block::new(task.cid, data));
            }
        } else {
            msg.add_block_presence(task.cid, PresenceType::Have);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MemoryBlockStore, MemoryNetwork, Network};
    use crate::peer::PeerId;
    use cid::Cid;
    use multihash::{Code, MultihashDigest};

    fn test_cid(seed: &[u8]) -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(seed))
    }

    async fn connected_peer() -> (Arc<PeerManager>, Arc<Peer>) {
        let shared = MemoryNetwork::new();
        let self_id = PeerId::random();
        let remote_id = PeerId::random();
        let _remote_handle = shared.handle(remote_id).await;
        let net: Arc<dyn Network> = Arc::new(shared.handle(self_id).await);
        let pm = PeerManager::new(net, Config::default());
        let peer = pm.connect(remote_id, None).await.unwrap();
        (pm, peer)
    }

    #[tokio::test]
    async fn serves_block_for_pending_block_want() {
        let (pm, peer) = connected_peer().await;
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let cid = test_cid(b"decision-block");
        store.put(cid, b"hi".to_vec()).await;

        peer.ledger.wants(cid, 5, WantType::Block).await;
        peer.push_task(cid, 5, WantType::Block, true).await;

        let decision = Decision::new(pm, store, Config::default());
        decision.run_once().await;

        let resp = peer.next_response().await;
        let block = resp.blocks().next().expect("expected a block response");
        assert_eq!(block.cid, cid);
    }

    #[tokio::test]
    async fn sends_dont_have_for_missing_block_want() {
        let (pm, peer) = connected_peer().await;
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let cid = test_cid(b"missing");

        peer.ledger.wants(cid, 1, WantType::Block).await;
        peer.push_task(cid, 1, WantType::Block, true).await;

        let decision = Decision::new(pm, store, Config::default());
        decision.run_once().await;

        let resp = peer.next_response().await;
        assert_eq!(
            resp.block_presences().next(),
            Some((&cid, &PresenceType::DontHave))
        );
    }

    #[tokio::test]
    async fn large_have_elides_to_presence_not_block() {
        let (pm, peer) = connected_peer().await;
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let cid = test_cid(b"big");
        store.put(cid, vec![0u8; 2048]).await;

        peer.ledger.wants(cid, 1, WantType::Have).await;
        peer.push_task(cid, 1, WantType::Have, true).await;

        let mut config = Config::default();
        config.max_block_size_have_to_block = 1024;
        let decision = Decision::new(pm, store, config);
        decision.run_once().await;

        let resp = peer.next_response().await;
        assert_eq!(resp.block_presences().next(), Some((&cid, &PresenceType::Have)));
        assert_eq!(resp.blocks().count(), 0);
    }

    #[tokio::test]
    async fn small_have_is_upgraded_to_block() {
        let (pm, peer) = connected_peer().await;
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let cid = test_cid(b"small");
        store.put(cid, vec![0u8; 10]).await;

        peer.ledger.wants(cid, 1, WantType::Have).await;
        peer.push_task(cid, 1, WantType::Have, true).await;

        let decision = Decision::new(pm, store, Config::default());
        decision.run_once().await;

        let resp = peer.next_response().await;
        assert_eq!(resp.blocks().next().map(|b| b.cid), Some(cid));
    }
}
