use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::Config;
use crate::connection_manager::ConnectionManager;
use crate::decision::Decision;
use crate::ledger::Ledger;
use crate::network::{BlockStore, Network};
use crate::peer_manager::PeerManager;
use crate::session::{Session, SessionManager};
use crate::wantlist::WantType;

/// Knobs for a single `Bitswap::get` call; defaults match §6c.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    pub priority: i32,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub peer_act_timeout: Duration,
    pub ban_timeout: Duration,
}

impl Default for GetOptions {
    fn default() -> Self {
        let cfg = Config::default();
        GetOptions {
            priority: 1,
            timeout: cfg.get_timeout,
            connect_timeout: cfg.connect_timeout,
            peer_act_timeout: cfg.peer_act_timeout,
            ban_timeout: cfg.ban_peer_timeout,
        }
    }
}

/// Top-level facade: `put`/`get` plus the `run`/`stop` lifecycle that
/// starts and deterministically tears down the connection-accept,
/// liveness-sweep, and decision background loops.
pub struct Bitswap {
    block_store: Arc<dyn BlockStore>,
    network: Arc<dyn Network>,
    peer_manager: Arc<PeerManager>,
    sessions: Arc<SessionManager>,
    local_ledger: Arc<Ledger>,
    connection_manager: Arc<ConnectionManager>,
    decision: Arc<Decision>,
    root_token: CancellationToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Bitswap {
    pub fn new(network: Arc<dyn Network>, block_store: Arc<dyn BlockStore>, config: Config) -> Arc<Self> {
        let root_token = CancellationToken::new();
        let peer_manager = PeerManager::new(network.clone(), config);
        let sessions = SessionManager::new();
        let local_ledger = Arc::new(Ledger::new());
        let engine = crate::engine::Engine::new(sessions.clone(), block_store.clone());
        let connection_manager = ConnectionManager::new(
            network.clone(),
            peer_manager.clone(),
            engine,
            sessions.clone(),
            local_ledger.clone(),
            root_token.child_token(),
        );
        let decision = Decision::new(peer_manager.clone(), block_store.clone(), config);

        Arc::new(Bitswap {
            block_store,
            network,
            peer_manager,
            sessions,
            local_ledger,
            connection_manager,
            decision,
            root_token,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Starts the connection-accept loop, the peer liveness sweep, and the
    /// decision loop as background tasks.
    pub async fn run(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        handles.push(self.connection_manager.run_handle_conn());
        handles.push(self.peer_manager.spawn_liveness_sweep(self.root_token.child_token()));
        handles.push(self.decision.spawn(self.root_token.child_token()));
    }

    /// Cancels every background task started by `run` and waits for them
    /// to finish.
    pub async fn stop(&self) {
        self.root_token.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Stores `data` under `cid` if not already present and announces it
    /// to the network. Returns `false` if the block store already had it.
    #[instrument(skip(self, data))]
    pub async fn put(&self, cid: Cid, data: Vec<u8>) -> bool {
        if self.block_store.has(&cid).await {
            return false;
        }
        self.block_store.put(cid, data).await;
        self.network.publish(cid).await;
        true
    }

    /// Retrieves `cid`, consulting the local block store first and then
    /// driving a `Session::get` in the background up to `opts.timeout`.
    #[instrument(skip(self, session))]
    pub async fn get(
        self: &Arc<Self>,
        cid: Cid,
        opts: GetOptions,
        session: Option<Arc<Session>>,
    ) -> Option<Bytes> {
        if let Some(data) = self.block_store.get(&cid).await {
            return Some(Bytes::from(data));
        }

        let session = match session {
            Some(s) => s,
            None => self.sessions.new_session(self.peer_manager.clone(), self.network.clone()).await,
        };

        let entry = match self.local_ledger.get_entry(&cid).await {
            Some(existing) => {
                if existing.has_block() {
                    self.local_ledger.cancel_want(&cid).await;
                    return existing.block().await;
                }
                existing.upgrade(opts.priority, WantType::Block).await;
                existing
            }
            None => {
                self.local_ledger.wants(cid, opts.priority, WantType::Block).await;
                self.local_ledger
                    .get_entry(&cid)
                    .await
                    .expect("entry was just inserted by `wants`")
            }
        };

        let mut block_rx = entry.subscribe();
        let get_task = {
            let session = session.clone();
            let entry = entry.clone();
            let (connect_timeout, peer_act_timeout, ban_timeout) =
                (opts.connect_timeout, opts.peer_act_timeout, opts.ban_timeout);
            tokio::spawn(async move {
                session.get(entry, connect_timeout, peer_act_timeout, ban_timeout).await;
            })
        };

        let _ = tokio::time::timeout(opts.timeout, async {
            if entry.has_block() {
                return;
            }
            let _ = block_rx.changed().await;
        })
        .await;

        get_task.abort();
        let _ = get_task.await;

        let block = entry.block().await;
        if block.is_some() {
            self.local_ledger.cancel_want(&cid).await;
        }
        block
    }
}
