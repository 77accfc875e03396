use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cid::Cid;
use keyed_priority_queue::KeyedPriorityQueue;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

use crate::ledger::Ledger;
use crate::message::{BitswapMessage, Priority};
use crate::network::BoxTransport;
use crate::wantlist::WantType;

/// Peer identity. Bitswap piggybacks on libp2p's `PeerId` for the
/// transport-level endpoint identifier (distinct from the content-addressed
/// `cid::Cid` used for blocks).
pub type PeerId = libp2p::PeerId;

/// A pending service task: serve `cid` (as `want_type`, possibly with
/// `send_dont_have`) to this peer.
#[derive(Debug, Clone)]
pub struct Task {
    pub cid: Cid,
    pub want_type: WantType,
    pub send_dont_have: bool,
}

/// FIFO-within-priority queue of pending tasks. A task pushed for a CID
/// already queued replaces its priority rather than duplicating the entry
/// — Decision re-validates against the peer's ledger on pop regardless, so
/// a collapsed duplicate never produces a stale send.
#[derive(Debug, Default)]
struct TaskQueue {
    heap: KeyedPriorityQueue<Cid, i64>,
    tasks: std::collections::HashMap<Cid, Task>,
}

impl TaskQueue {
    fn push(&mut self, task: Task, priority_key: i64) {
        self.heap.push(task.cid, priority_key);
        self.tasks.insert(task.cid, task);
    }

    fn pop(&mut self) -> Option<Task> {
        let (cid, _) = self.heap.pop()?;
        self.tasks.remove(&cid)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// A single remote endpoint: their wants (ledger), our pending work for
/// them (tasks_queue), and our outbound backlog to them (response_queue).
pub struct Peer {
    pub id: PeerId,
    pub ledger: Ledger,
    response_queue: deadqueue::unlimited::Queue<BitswapMessage>,
    tasks: Mutex<TaskQueue>,
    tasks_notify: Notify,
    transport: std::sync::Mutex<Option<BoxTransport>>,
    seq: AtomicU64,
    bytes_sent: AtomicI64,
    bytes_received: AtomicI64,
    last_active_unix_ms: AtomicI64,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish_non_exhaustive()
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Peer {
    pub fn new(id: PeerId) -> Arc<Self> {
        Arc::new(Peer {
            id,
            ledger: Ledger::new(),
            response_queue: deadqueue::unlimited::Queue::new(),
            tasks: Mutex::new(TaskQueue::default()),
            tasks_notify: Notify::new(),
            transport: std::sync::Mutex::new(None),
            seq: AtomicU64::new(0),
            bytes_sent: AtomicI64::new(0),
            bytes_received: AtomicI64::new(0),
            last_active_unix_ms: AtomicI64::new(now_unix_ms()),
        })
    }

    pub fn touch(&self) {
        self.last_active_unix_ms.store(now_unix_ms(), Ordering::Release);
    }

    /// Installs `self`'s transport, returning `self` for chaining in
    /// `PeerManager::connect`.
    pub fn tap_transport(self: Arc<Self>, transport: BoxTransport) -> Arc<Self> {
        *self.transport.lock().unwrap() = Some(transport);
        self
    }

    pub fn transport(&self) -> Option<BoxTransport> {
        self.transport.lock().unwrap().clone()
    }

    pub async fn close(&self) {
        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    pub fn idle_for(&self) -> Duration {
        let elapsed = now_unix_ms() - self.last_active_unix_ms.load(Ordering::Acquire);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as i64, Ordering::AcqRel);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as i64, Ordering::AcqRel);
        self.touch();
    }

    /// Reciprocity ratio `rx / (tx + rx)`, `0` while we have received
    /// nothing from this peer yet.
    pub fn rank(&self) -> f64 {
        let rx = self.bytes_received.load(Ordering::Acquire).max(0) as f64;
        let tx = self.bytes_sent.load(Ordering::Acquire).max(0) as f64;
        if rx <= 0.0 {
            0.0
        } else {
            rx / (tx + rx)
        }
    }

    pub fn push_response(&self, msg: BitswapMessage) {
        self.response_queue.push(msg);
        bitswap_metrics::record!(bitswap_metrics::BitswapMetrics::QueueDepth, self.response_queue.len() as f64);
    }

    pub async fn next_response(&self) -> BitswapMessage {
        self.response_queue.pop().await
    }

    pub fn response_queue_len(&self) -> usize {
        self.response_queue.len()
    }

    /// Schedules `cid` for service at `priority`; later cancellation is
    /// expressed by removing `cid` from `self.ledger`, which Decision
    /// checks for on pop.
    pub async fn push_task(&self, cid: Cid, priority: Priority, want_type: WantType, send_dont_have: bool) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        // Higher `priority` dominates; among equal priorities, the smaller
        // (earlier) `seq` yields a larger key, preserving FIFO order.
        let key = (priority as i64) * 1_000_000_000 - seq as i64;
        self.tasks.lock().await.push(
            Task {
                cid,
                want_type,
                send_dont_have,
            },
            key,
        );
        self.tasks_notify.notify_waiters();
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Pops the highest-priority task, waiting up to `timeout` if the
    /// queue is currently empty. `None` on timeout, matching the expected
    /// `TimeoutError` swallowed by the Decision loop.
    pub async fn pop_task(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.tasks.lock().await.pop() {
                return Some(task);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let notified = self.tasks_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}
