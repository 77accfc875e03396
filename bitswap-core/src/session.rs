use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cid::Cid;
use tokio::sync::{Notify, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{instrument, trace, warn};

use crate::message::BitswapMessage;
use crate::network::Network;
use crate::peer::PeerId;
use crate::peer_manager::PeerManager;
use crate::wantlist::Entry;

/// Smoothing factor for the peer-score EWMA: `score <- α·new + (1-α)·old`.
const SCORE_ALPHA: f64 = 0.5;

/// Opaque handle a [`crate::wantlist::Entry`] stores instead of an
/// `Arc<Session>`, resolved back to the live session (if any) through
/// [`SessionManager`]. Standing in for a weak reference: Rust has no
/// ergonomic weak pointer to an arbitrary trait-less object shared this
/// widely, so we key through an integer table instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerScoreState {
    score: f64,
    latency: Option<Duration>,
}

impl Default for PeerScoreState {
    fn default() -> Self {
        PeerScoreState {
            score: 0.0,
            latency: None,
        }
    }
}

/// Coordinates discovery and retrieval for one or more blocks on behalf
/// of a single high-level caller. Multiple `get` calls against the same
/// session share discovered peers and their accumulated scores.
pub struct Session {
    pub id: SessionId,
    peer_manager: Arc<PeerManager>,
    network: Arc<dyn Network>,
    peers: RwLock<HashMap<PeerId, PeerScoreState>>,
    blocks_have: RwLock<HashMap<Cid, HashSet<PeerId>>>,
    blocks_pending: RwLock<HashMap<Cid, HashSet<PeerId>>>,
    ban_peers: RwLock<HashMap<PeerId, Instant>>,
    have_notify: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Session {
    fn new(id: SessionId, peer_manager: Arc<PeerManager>, network: Arc<dyn Network>) -> Arc<Self> {
        Arc::new(Session {
            id,
            peer_manager,
            network,
            peers: RwLock::new(HashMap::new()),
            blocks_have: RwLock::new(HashMap::new()),
            blocks_pending: RwLock::new(HashMap::new()),
            ban_peers: RwLock::new(HashMap::new()),
            have_notify: Notify::new(),
        })
    }

    /// Records `peer` for this session; if `have` is set, also marks it as
    /// believed to hold `cid` and applies the `Have`-presence EWMA bump.
    pub async fn add_peer(&self, peer: PeerId, cid: Cid, have: bool) {
        self.peers.write().await.entry(peer).or_default();
        if have {
            self.blocks_have.write().await.entry(cid).or_default().insert(peer);
            self.change_peer_score(peer, 1.0).await;
            self.have_notify.notify_waiters();
        }
    }

    pub async fn change_peer_score(&self, peer: PeerId, new: f64) {
        let mut peers = self.peers.write().await;
        let state = peers.entry(peer).or_default();
        state.score = SCORE_ALPHA * new + (1.0 - SCORE_ALPHA) * state.score;
    }

    pub async fn set_peer_latency(&self, peer: PeerId, latency: Duration) {
        let mut peers = self.peers.write().await;
        peers.entry(peer).or_default().latency = Some(latency);
    }

    /// Peers this session believes have, or has already asked for, `cid`
    /// — the notification set used when a block arrives from elsewhere.
    pub async fn interested_peers(&self, cid: &Cid) -> HashSet<PeerId> {
        let mut out = HashSet::new();
        if let Some(s) = self.blocks_have.read().await.get(cid) {
            out.extend(s);
        }
        if let Some(s) = self.blocks_pending.read().await.get(cid) {
            out.extend(s);
        }
        out
    }

    /// Drops every trace of `peer` from this session, called when a
    /// connection tears down.
    pub async fn forget_peer(&self, peer: PeerId) {
        self.peers.write().await.remove(&peer);
        for set in self.blocks_have.write().await.values_mut() {
            set.remove(&peer);
        }
        for set in self.blocks_pending.write().await.values_mut() {
            set.remove(&peer);
        }
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().copied().collect()
    }

    async fn is_banned(&self, peer: PeerId, ban_timeout: Duration) -> bool {
        let mut bans = self.ban_peers.write().await;
        match bans.get(&peer) {
            Some(at) if at.elapsed() < ban_timeout => true,
            Some(_) => {
                bans.remove(&peer);
                false
            }
            None => false,
        }
    }

    async fn ban(&self, peer: PeerId) {
        self.ban_peers.write().await.insert(peer, Instant::now());
    }

    /// Best `(score, -latency)` peer currently believed to have `cid`,
    /// removed from `blocks_have[cid]` on return.
    async fn take_best_have_peer(&self, cid: &Cid) -> Option<PeerId> {
        let peers = self.peers.read().await.clone();
        let mut have = self.blocks_have.write().await;
        let candidates = have.get_mut(cid)?;
        if candidates.is_empty() {
            return None;
        }
        let best = candidates
            .iter()
            .copied()
            .max_by(|a, b| {
                let sa = peers.get(a).copied().unwrap_or_default();
                let sb = peers.get(b).copied().unwrap_or_default();
                let key_a = (sa.score, sa.latency.map(|d| -(d.as_secs_f64())).unwrap_or(0.0));
                let key_b = (sb.score, sb.latency.map(|d| -(d.as_secs_f64())).unwrap_or(0.0));
                key_a.partial_cmp(&key_b).unwrap_or(std::cmp::Ordering::Equal)
            })?;
        candidates.remove(&best);
        Some(best)
    }

    async fn send_want(&self, peer_id: PeerId, cid: Cid, want_have: bool, priority: i32) {
        let Some(peer) = self.peer_manager.get(peer_id).await else {
            return;
        };
        let mut msg = BitswapMessage::new();
        if want_have {
            msg.want_have_block(&cid, priority, true);
        } else {
            msg.want_block(&cid, priority, true);
        }
        peer.push_response(msg);
    }

    async fn broadcast_have(&self, cid: Cid, peers: &[PeerId]) {
        for peer in peers {
            self.send_want(*peer, cid, true, 1).await;
        }
    }

    async fn discover_and_connect(
        &self,
        cid: Cid,
        connect_timeout: Duration,
        ban_timeout: Duration,
    ) -> Vec<PeerId> {
        let candidates = self.network.find_peers(cid).await;
        self.connect_candidates(candidates, connect_timeout, ban_timeout).await
    }

    /// Filters `candidates` against the connected/banned state and dials
    /// the rest, returning every peer now connected (already-connected or
    /// freshly dialed). Shared by [`Self::discover_and_connect`] and
    /// `drive_until_block`'s re-probe so a second `find_peers` call is
    /// never just thrown away.
    async fn connect_candidates(
        &self,
        candidates: Vec<PeerId>,
        connect_timeout: Duration,
        ban_timeout: Duration,
    ) -> Vec<PeerId> {
        let mut connected = Vec::new();
        for candidate in candidates {
            if self.peer_manager.is_connected(candidate).await {
                connected.push(candidate);
                continue;
            }
            if self.is_banned(candidate, ban_timeout).await {
                continue;
            }
            match tokio::time::timeout(connect_timeout, self.peer_manager.connect(candidate, None)).await {
                Ok(Ok(_)) => {
                    self.peers.write().await.entry(candidate).or_default();
                    connected.push(candidate);
                }
                _ => self.ban(candidate).await,
            }
        }
        connected
    }

    /// Retrieval state machine for one block. Returns once `entry.block`
    /// is set (the caller is expected to be racing this against its own
    /// overall timeout via `entry.subscribe()`).
    #[instrument(skip(self, entry))]
    pub async fn get(
        self: &Arc<Self>,
        entry: Arc<Entry>,
        connect_timeout: Duration,
        peer_act_timeout: Duration,
        ban_timeout: Duration,
    ) {
        let cid = entry.cid;
        entry.add_session(self.id).await;

        let known = self.known_peers().await;
        if !known.is_empty() {
            self.broadcast_have(cid, &known).await;
        } else {
            let connected = self.peer_manager.peers().await;
            if !connected.is_empty() {
                let ids: Vec<PeerId> = connected.iter().map(|p| p.id).collect();
                for id in &ids {
                    self.peers.write().await.entry(*id).or_default();
                }
                self.broadcast_have(cid, &ids).await;
            } else {
                loop {
                    let discovered = self.discover_and_connect(cid, connect_timeout, ban_timeout).await;
                    if !discovered.is_empty() {
                        self.broadcast_have(cid, &discovered).await;
                        break;
                    }
                    bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::SessionRetries);
                    tokio::time::sleep(peer_act_timeout).await;
                }
            }
        }

        let result = self.drive_until_block(&entry, connect_timeout, peer_act_timeout, ban_timeout).await;
        if let Err(err) = result {
            warn!(cid = %cid, error = %err, "session get loop ended without a block");
        }

        let mut pending = self.blocks_pending.write().await;
        if let Some(set) = pending.get_mut(&cid) {
            set.clear();
        }
    }

    async fn drive_until_block(
        &self,
        entry: &Arc<Entry>,
        connect_timeout: Duration,
        peer_act_timeout: Duration,
        ban_timeout: Duration,
    ) -> anyhow::Result<()> {
        let cid = entry.cid;
        let mut have_rx = entry.subscribe();
        while !entry.has_block() {
            let have_peer = tokio::time::timeout(peer_act_timeout, self.take_best_have_peer_blocking(&cid)).await;

            match have_peer {
                Ok(Some(peer)) => {
                    let already_pending = {
                        let mut pending = self.blocks_pending.write().await;
                        let set = pending.entry(cid).or_default();
                        if set.contains(&peer) {
                            true
                        } else {
                            set.insert(peer);
                            false
                        }
                    };
                    if !already_pending && self.peer_manager.is_connected(peer).await {
                        self.send_want(peer, cid, false, 2).await;
                    }
                    let _ = tokio::time::timeout(peer_act_timeout, have_rx.changed()).await;
                }
                Ok(None) | Err(_) => {
                    bitswap_metrics::inc!(bitswap_metrics::BitswapMetrics::SessionRetries);
                    let mut discovered = self.discover_and_connect(cid, connect_timeout, ban_timeout).await;
                    if discovered.is_empty() {
                        let reprobed = self.network.find_peers(cid).await;
                        discovered = self.connect_candidates(reprobed, connect_timeout, ban_timeout).await;
                    }
                    if discovered.is_empty() {
                        let known = self.known_peers().await;
                        if known.is_empty() {
                            continue;
                        }
                    } else {
                        self.broadcast_have(cid, &discovered).await;
                    }
                }
            }
        }
        trace!(cid = %cid, "block satisfied");
        Ok(())
    }

    /// Waits for a have-peer to become available, polling
    /// `blocks_have`/`have_notify` rather than busy-looping.
    async fn take_best_have_peer_blocking(&self, cid: &Cid) -> Option<PeerId> {
        loop {
            if let Some(peer) = self.take_best_have_peer(cid).await {
                return Some(peer);
            }
            self.have_notify.notified().await;
        }
    }
}

/// Central table resolving [`SessionId`]s to live sessions. Dropping the
/// last `Arc<Session>` held by a caller removes the session here on next
/// `gc`; lookups against a vanished id simply return `None`.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, std::sync::Weak<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionManager::default())
    }

    pub async fn new_session(
        self: &Arc<Self>,
        peer_manager: Arc<PeerManager>,
        network: Arc<dyn Network>,
    ) -> Arc<Session> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let session = Session::new(id, peer_manager, network);
        self.sessions.write().await.insert(id, Arc::downgrade(&session));
        session
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).and_then(std::sync::Weak::upgrade)
    }

    /// Drops table entries whose session has been dropped by its caller.
    pub async fn gc(&self) {
        self.sessions.write().await.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Removes `peer` from every still-live session; called when a
    /// connection is torn down.
    pub async fn forget_peer_everywhere(&self, peer: PeerId) {
        let live: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(std::sync::Weak::upgrade)
            .collect();
        for session in live {
            session.forget_peer(peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use crate::config::Config;
    use multihash::{Code, MultihashDigest};

    fn test_cid(seed: &[u8]) -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(seed))
    }

    async fn test_session() -> Arc<Session> {
        let shared = MemoryNetwork::new();
        let net: Arc<dyn Network> = Arc::new(shared.handle(PeerId::random()).await);
        let pm = PeerManager::new(net.clone(), Config::default());
        let manager = SessionManager::new();
        manager.new_session(pm, net).await
    }

    #[tokio::test]
    async fn add_peer_with_have_bumps_score_and_have_set() {
        let session = test_session().await;
        let peer = PeerId::random();
        let cid = test_cid(b"block");
        session.add_peer(peer, cid, true).await;
        assert_eq!(session.take_best_have_peer(&cid).await, Some(peer));
        // removed on take
        assert_eq!(session.take_best_have_peer(&cid).await, None);
    }

    #[tokio::test]
    async fn ban_expires_after_timeout() {
        let session = test_session().await;
        let peer = PeerId::random();
        session.ban(peer).await;
        assert!(session.is_banned(peer, Duration::from_secs(10)).await);
        assert!(!session.is_banned(peer, Duration::from_millis(0)).await);
    }

    #[tokio::test]
    async fn session_manager_lookup_vanishes_after_drop() {
        let shared = MemoryNetwork::new();
        let net: Arc<dyn Network> = Arc::new(shared.handle(PeerId::random()).await);
        let pm = PeerManager::new(net.clone(), Config::default());
        let manager = SessionManager::new();
        let session = manager.new_session(pm, net).await;
        let id = session.id;
        assert!(manager.get(id).await.is_some());
        drop(session);
        manager.gc().await;
        assert!(manager.get(id).await.is_none());
    }
}
