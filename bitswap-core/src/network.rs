use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::Mutex;
use tokio_stream::Stream;

use crate::peer::PeerId;

/// Per-peer framed-message channel. One `Transport` is owned by exactly
/// one `Peer`'s inbound/outbound loops.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Blocks until the next complete framed message arrives, or the
    /// connection closes (`None`).
    async fn recv(&self) -> Option<Vec<u8>>;
    async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()>;
    async fn close(&self);
    /// Round-trip latency, if the transport supports liveness probing.
    async fn ping(&self) -> Option<Duration>;
}

pub type BoxTransport = Arc<dyn Transport>;
pub type NewConnection = (PeerId, BoxTransport);
pub type ConnectionStream = Pin<Box<dyn Stream<Item = NewConnection> + Send>>;

/// The networking surface the core depends on. A real implementation
/// would drive libp2p; this crate only defines the trait plus an
/// in-memory stand-in for tests and the demonstration CLI.
#[async_trait]
pub trait Network: Send + Sync {
    async fn connect(&self, peer: PeerId) -> anyhow::Result<BoxTransport>;
    /// Best-effort announcement that we now have `cid` available.
    async fn publish(&self, cid: Cid);
    async fn find_peers(&self, cid: Cid) -> Vec<PeerId>;
    /// Infinite stream of inbound connections accepted by the transport
    /// layer.
    fn new_connections(&self) -> ConnectionStream;
}

/// Storage surface the core depends on for content-addressed bytes.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn has(&self, cid: &Cid) -> bool;
    async fn get(&self, cid: &Cid) -> Option<Vec<u8>>;
    async fn put(&self, cid: Cid, data: Vec<u8>);
    async fn size(&self, cid: &Cid) -> Option<usize>;
    async fn put_many(&self, blocks: HashMap<Cid, Vec<u8>>);
}

/// In-memory `BlockStore`, sufficient for tests and the demonstration
/// binary; not a durable store.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        MemoryBlockStore::default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn has(&self, cid: &Cid) -> bool {
        self.blocks.lock().await.contains_key(cid)
    }

    async fn get(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.blocks.lock().await.get(cid).cloned()
    }

    async fn put(&self, cid: Cid, data: Vec<u8>) {
        self.blocks.lock().await.insert(cid, data);
    }

    async fn size(&self, cid: &Cid) -> Option<usize> {
        self.blocks.lock().await.get(cid).map(|d| d.len())
    }

    async fn put_many(&self, blocks: HashMap<Cid, Vec<u8>>) {
        self.blocks.lock().await.extend(blocks);
    }
}

/// Loopback `Transport` backed by a pair of unbounded channels; used by
/// `MemoryNetwork` to connect two in-process peers without any real I/O.
struct ChannelTransport {
    outbox: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    inbox: Mutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbox.lock().await.recv().await
    }

    async fn send(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.outbox
            .send(bytes)
            .map_err(|_| anyhow::anyhow!("peer disconnected"))
    }

    async fn close(&self) {
        // Dropping our half is implicit in `MemoryNetwork::connect` once
        // both `Arc<ChannelTransport>` ends are released; explicit close
        // has nothing further to do for an in-memory pipe.
    }

    async fn ping(&self) -> Option<Duration> {
        Some(Duration::from_millis(0))
    }
}

#[derive(Default)]
struct MemoryNetworkInner {
    nodes: HashMap<PeerId, tokio::sync::mpsc::UnboundedSender<NewConnection>>,
    published: HashMap<Cid, Vec<PeerId>>,
}

/// Shared registry behind every node's [`MemoryNetworkHandle`] in a
/// single process. Used by tests and the demonstration CLI to exercise
/// more than one bitswap node without a real transport.
#[derive(Default, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryNetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    /// Returns a `Network` handle scoped to `peer`: `publish`/`find_peers`
    /// record and query under this identity, and `new_connections` yields
    /// inbound dials addressed to it.
    pub async fn handle(&self, peer: PeerId) -> MemoryNetworkHandle {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner.lock().await.nodes.insert(peer, tx);
        MemoryNetworkHandle {
            self_id: peer,
            inner: self.inner.clone(),
            inbound: Arc::new(Mutex::new(Some(rx))),
        }
    }
}

pub struct MemoryNetworkHandle {
    self_id: PeerId,
    inner: Arc<Mutex<MemoryNetworkInner>>,
    inbound: Arc<Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<NewConnection>>>>,
}

#[async_trait]
impl Network for MemoryNetworkHandle {
    async fn connect(&self, peer: PeerId) -> anyhow::Result<BoxTransport> {
        let target = {
            let inner = self.inner.lock().await;
            inner
                .nodes
                .get(&peer)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such peer registered: {peer}"))?
        };

        let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
        let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
        let ours: BoxTransport = Arc::new(ChannelTransport {
            outbox: a_tx,
            inbox: Mutex::new(b_rx),
        });
        let theirs: BoxTransport = Arc::new(ChannelTransport {
            outbox: b_tx,
            inbox: Mutex::new(a_rx),
        });
        target
            .send((self.self_id, theirs))
            .map_err(|_| anyhow::anyhow!("peer connection stream closed"))?;
        Ok(ours)
    }

    async fn publish(&self, cid: Cid) {
        self.inner
            .lock()
            .await
            .published
            .entry(cid)
            .or_default()
            .push(self.self_id);
    }

    async fn find_peers(&self, cid: Cid) -> Vec<PeerId> {
        self.inner
            .lock()
            .await
            .published
            .get(&cid)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| *p != self.self_id)
            .collect()
    }

    fn new_connections(&self) -> ConnectionStream {
        let inbound = self.inbound.clone();
        Box::pin(async_stream::stream! {
            let mut rx = inbound.lock().await.take().expect("new_connections called twice");
            while let Some(conn) = rx.recv().await {
                yield conn;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrips() {
        let store = MemoryBlockStore::new();
        let cid = Cid::try_from("bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku").unwrap();
        assert!(!store.has(&cid).await);
        store.put(cid, b"hello".to_vec()).await;
        assert!(store.has(&cid).await);
        assert_eq!(store.get(&cid).await, Some(b"hello".to_vec()));
        assert_eq!(store.size(&cid).await, Some(5));
    }

    #[tokio::test]
    async fn memory_network_connects_two_peers() {
        let net = MemoryNetwork::new();
        let a = PeerId::random();
        let b = PeerId::random();
        let a_handle = net.handle(a).await;
        let b_handle = net.handle(b).await;
        let mut b_conns = b_handle.new_connections();

        let to_b = a_handle.connect(b).await.unwrap();
        to_b.send(b"hi".to_vec()).await.unwrap();

        let (from, transport) = tokio_stream::StreamExt::next(&mut b_conns).await.unwrap();
        assert_eq!(from, a);
        assert_eq!(transport.recv().await, Some(b"hi".to_vec()));
    }

    #[tokio::test]
    async fn find_peers_excludes_self_and_reflects_publish() {
        let net = MemoryNetwork::new();
        let a = PeerId::random();
        let b = PeerId::random();
        let a_handle = net.handle(a).await;
        let b_handle = net.handle(b).await;
        let cid = Cid::try_from("bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku").unwrap();

        a_handle.publish(cid).await;
        assert_eq!(b_handle.find_peers(cid).await, vec![a]);
        assert!(a_handle.find_peers(cid).await.is_empty());
    }
}
