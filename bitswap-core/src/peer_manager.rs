use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::network::{BoxTransport, Network};
use crate::peer::{Peer, PeerId};

/// Owns the set of connected peers. Connection and liveness bookkeeping
/// live here; message routing is the `ConnectionManager`'s job.
pub struct PeerManager {
    network: Arc<dyn Network>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    config: Config,
    connect_hook: std::sync::OnceLock<Box<dyn Fn(Arc<Peer>) + Send + Sync>>,
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager").finish_non_exhaustive()
    }
}

impl PeerManager {
    pub fn new(network: Arc<dyn Network>, config: Config) -> Arc<Self> {
        Arc::new(PeerManager {
            network,
            peers: RwLock::new(HashMap::new()),
            config,
            connect_hook: std::sync::OnceLock::new(),
        })
    }

    /// Installs the hook run once for each newly-installed peer, used by
    /// `ConnectionManager` to start that peer's inbound/outbound loops
    /// without `PeerManager` needing to know about it. A no-op if never
    /// set, so tests that only exercise `PeerManager` are unaffected.
    pub fn set_connect_hook(&self, hook: impl Fn(Arc<Peer>) + Send + Sync + 'static) {
        let _ = self.connect_hook.set(Box::new(hook));
    }

    pub async fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn is_connected(&self, id: PeerId) -> bool {
        self.peers.read().await.contains_key(&id)
    }

    /// Installs `id` as a connected peer, dialing through `network` first
    /// if no `transport` was supplied by an inbound connection. A peer
    /// already connected is returned as-is without redialing.
    #[instrument(skip(self, transport))]
    pub async fn connect(
        &self,
        id: PeerId,
        transport: Option<BoxTransport>,
    ) -> anyhow::Result<Arc<Peer>> {
        if let Some(existing) = self.get(id).await {
            return Ok(existing);
        }

        let transport = match transport {
            Some(t) => t,
            None => {
                tokio::time::timeout(self.config.connect_timeout, self.network.connect(id))
                    .await
                    .map_err(|_| anyhow::anyhow!("dial to {id} timed out"))??
            }
        };

        let peer = Peer::new(id).tap_transport(transport);
        self.peers.write().await.insert(id, peer.clone());
        debug!(peer = %id, "connected");
        if let Some(hook) = self.connect_hook.get() {
            hook(peer.clone());
        }
        Ok(peer)
    }

    /// Removes `id`, closing its transport if still present. Safe to call
    /// on an already-removed peer.
    pub async fn remove_peer(&self, id: PeerId) {
        if let Some(peer) = self.peers.write().await.remove(&id) {
            peer.close().await;
            debug!(peer = %id, "disconnected");
        }
    }

    pub async fn disconnect(&self) {
        let ids: Vec<PeerId> = self.peers.read().await.keys().copied().collect();
        for id in ids {
            self.remove_peer(id).await;
        }
    }

    /// Spawns the background liveness sweep: every `check_no_active_ping_period`,
    /// peers idle past `max_no_active_time` are disconnected; others are
    /// pinged to refresh their `last_active` timestamp. Runs until `token`
    /// is cancelled.
    pub fn spawn_liveness_sweep(self: &Arc<Self>, token: tokio_util::sync::CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        crate::task::spawn_tracked("liveness-sweep", token, async move {
            let mut tick = tokio::time::interval(this.config.check_no_active_ping_period);
            loop {
                tick.tick().await;
                this.sweep_once().await;
            }
        })
    }

    async fn sweep_once(&self) {
        for peer in self.peers().await {
            if peer.idle_for() > self.config.max_no_active_time {
                self.remove_peer(peer.id).await;
                continue;
            }
            if let Some(transport) = peer.transport() {
                if transport.ping().await.is_some() {
                    peer.touch();
                } else {
                    warn!(peer = %peer.id, "liveness ping failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;

    #[tokio::test]
    async fn connect_is_idempotent() {
        let shared = MemoryNetwork::new();
        let self_id = PeerId::random();
        let other = PeerId::random();
        let _other_handle = shared.handle(other).await;
        let net: Arc<dyn Network> = Arc::new(shared.handle(self_id).await);
        let pm = PeerManager::new(net, Config::default());

        let first = pm.connect(other, None).await.unwrap();
        let second = pm.connect(other, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(pm.is_connected(other).await);
    }

    #[tokio::test]
    async fn remove_peer_is_safe_twice() {
        let shared = MemoryNetwork::new();
        let self_id = PeerId::random();
        let net: Arc<dyn Network> = Arc::new(shared.handle(self_id).await);
        let pm = PeerManager::new(net, Config::default());
        let random_peer = PeerId::random();
        pm.remove_peer(random_peer).await;
        pm.remove_peer(random_peer).await;
    }
}
