use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::Engine;
use crate::ledger::Ledger;
use crate::message::BitswapMessage;
use crate::network::Network;
use crate::peer::Peer;
use crate::peer_manager::PeerManager;
use crate::protocol::ProtocolId;
use crate::session::SessionManager;
use crate::task::spawn_tracked;

/// Wires inbound dials to `PeerManager::connect` and, for each resulting
/// peer, an inbound decode-and-dispatch loop paired with an outbound
/// drain-and-send loop.
pub struct ConnectionManager {
    network: Arc<dyn Network>,
    peer_manager: Arc<PeerManager>,
    engine: Arc<Engine>,
    sessions: Arc<SessionManager>,
    local_ledger: Arc<Ledger>,
    token: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// `token` bounds the lifetime of every loop this manager starts,
    /// including ones started later via `PeerManager`'s connect hook for
    /// outbound dials (e.g. from `Session::discover_and_connect`).
    pub fn new(
        network: Arc<dyn Network>,
        peer_manager: Arc<PeerManager>,
        engine: Arc<Engine>,
        sessions: Arc<SessionManager>,
        local_ledger: Arc<Ledger>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let this = Arc::new(ConnectionManager {
            network,
            peer_manager,
            engine,
            sessions,
            local_ledger,
            token,
        });
        let weak = Arc::downgrade(&this);
        this.peer_manager.set_connect_hook(move |peer| {
            if let Some(cm) = weak.upgrade() {
                cm.run_message_handlers(peer);
            }
        });
        this
    }

    /// Accepts inbound connections forever, installing each as a peer.
    /// `PeerManager`'s connect hook starts that peer's message loops, the
    /// same way it does for outbound dials. Runs until this manager's
    /// token is cancelled.
    pub fn run_handle_conn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        spawn_tracked("connection-accept", this.token.child_token(), async move {
            let mut incoming = this.network.new_connections();
            while let Some((peer_id, transport)) = incoming.next().await {
                if let Err(err) = this.peer_manager.connect(peer_id, Some(transport)).await {
                    warn!(peer = %peer_id, error = %err, "failed to install inbound connection");
                }
            }
            Ok(())
        })
    }

    /// Starts the inbound decode loop and outbound send loop for `peer`,
    /// plus a supervisor that tears both down and removes the peer
    /// everywhere once either loop exits.
    pub fn run_message_handlers(self: &Arc<Self>, peer: Arc<Peer>) {
        let peer_id = peer.id;
        let inbound_token = self.token.child_token();
        let outbound_token = self.token.child_token();

        let inbound_peer = peer.clone();
        let engine = self.engine.clone();
        let peer_manager = self.peer_manager.clone();
        let local_ledger = self.local_ledger.clone();
        let inbound = spawn_tracked("inbound", inbound_token, async move {
            loop {
                let Some(transport) = inbound_peer.transport() else {
                    break;
                };
                let Some(bytes) = transport.recv().await else {
                    break;
                };
                inbound_peer.record_received(bytes.len());
                bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::MessagesReceived);
                bitswap_metrics::record!(bitswap_metrics::BitswapMetrics::BytesReceived, bytes.len() as f64);
                match BitswapMessage::from_bytes(&bytes) {
                    Ok(msg) => {
                        engine
                            .handle(inbound_peer.clone(), msg, &peer_manager, &local_ledger)
                            .await
                    }
                    Err(err) => warn!(peer = %peer_id, error = %err, "failed to decode message, dropping it"),
                }
            }
            Ok(())
        });

        let outbound_peer = peer.clone();
        let outbound = spawn_tracked("outbound", outbound_token.clone(), async move {
            loop {
                let msg = outbound_peer.next_response().await;
                let Some(transport) = outbound_peer.transport() else {
                    break;
                };
                let bytes = msg.to_bytes(ProtocolId::Bitswap110);
                let len = bytes.len();
                match transport.send(bytes).await {
                    Ok(()) => {
                        outbound_peer.record_sent(len);
                        bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::MessagesSent);
                        bitswap_metrics::record!(bitswap_metrics::BitswapMetrics::BytesSent, len as f64);
                    }
                    Err(err) => warn!(peer = %peer_id, error = %err, "send failed"),
                }
            }
            Ok(())
        });

        let peer_manager = self.peer_manager.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let _ = inbound.await;
            outbound_token.cancel();
            let _ = outbound.await;
            sessions.forget_peer_everywhere(peer_id).await;
            peer_manager.remove_peer(peer_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::config::Config;
    use crate::network::{BlockStore, MemoryBlockStore, MemoryNetwork};
    use crate::peer::PeerId;
    use crate::wantlist::WantType;
    use cid::Cid;
    use multihash::{Code, MultihashDigest};

    fn test_cid(seed: &[u8]) -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(seed))
    }

    struct Node {
        peer_manager: Arc<PeerManager>,
        connection_manager: Arc<ConnectionManager>,
        local_ledger: Arc<Ledger>,
        store: Arc<dyn BlockStore>,
    }

    async fn build_node(net: Arc<dyn Network>, token: CancellationToken) -> Node {
        let peer_manager = PeerManager::new(net.clone(), Config::default());
        let sessions = SessionManager::new();
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let engine = Engine::new(sessions.clone(), store.clone());
        let local_ledger = Arc::new(Ledger::new());
        let connection_manager =
            ConnectionManager::new(net, peer_manager.clone(), engine, sessions, local_ledger.clone(), token);
        Node {
            peer_manager,
            connection_manager,
            local_ledger,
            store,
        }
    }

    #[tokio::test]
    async fn block_pushed_from_b_reaches_a_via_connection_loops() {
        let shared = MemoryNetwork::new();
        let a_id = PeerId::random();
        let b_id = PeerId::random();

        let token = CancellationToken::new();
        let a = build_node(Arc::new(shared.handle(a_id).await), token.child_token()).await;
        let b = build_node(Arc::new(shared.handle(b_id).await), token.child_token()).await;

        b.connection_manager.run_handle_conn();

        // `connect`'s hook (installed by `ConnectionManager::new`) starts
        // A's message loops for this peer automatically.
        let peer_b_for_a = a.peer_manager.connect(b_id, None).await.unwrap();

        let peer_a_for_b = loop {
            if let Some(p) = b.peer_manager.get(a_id).await {
                break p;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        let cid = test_cid(b"cm-e2e");
        b.store.put(cid, b"hi from b".to_vec()).await;
        a.local_ledger.wants(cid, 1, WantType::Block).await;
        let entry = a.local_ledger.get_entry(&cid).await.unwrap();

        let mut msg = BitswapMessage::new();
        msg.add_block(Block::new(cid, b"hi from b".to_vec()));
        peer_a_for_b.push_response(msg);

        for _ in 0..100 {
            if entry.has_block() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(entry.has_block());
        assert_eq!(entry.block().await.unwrap(), bytes::Bytes::from_static(b"hi from b"));

        token.cancel();
    }
}
