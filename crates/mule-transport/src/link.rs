use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mule_core::NodeId;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Errors surfaced by a peer link.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Remote side went away mid-session.
    #[error("link closed")]
    Closed,
    #[error("link i/o error: {0}")]
    Io(String),
}

/// Coarse per-link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHealthSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Ordered, reliable, framed byte channel to one directly reachable peer.
///
/// Opened for the duration of a contact; dropped when the peer leaves range.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Identity of the peer on the other end.
    fn peer_id(&self) -> NodeId;
    /// Sends one frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError>;
    /// Waits for the next frame.
    async fn recv(&self) -> Result<Vec<u8>, LinkError>;

    fn health_snapshot(&self) -> LinkHealthSnapshot {
        LinkHealthSnapshot::default()
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// In-memory link for tests and simulations.
#[derive(Debug)]
pub struct InMemoryLink {
    peer_id: NodeId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    counters: Arc<Counters>,
}

impl InMemoryLink {
    /// Builds two connected link ends.
    ///
    /// The first end is held by node `a` and talks to `b`; the second the reverse.
    pub fn pair(a: NodeId, b: NodeId) -> (InMemoryLink, InMemoryLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_end = InMemoryLink {
            peer_id: b,
            outbound: a_tx,
            inbound: Mutex::new(a_rx),
            counters: Arc::default(),
        };
        let b_end = InMemoryLink {
            peer_id: a,
            outbound: b_tx,
            inbound: Mutex::new(b_rx),
            counters: Arc::default(),
        };
        (a_end, b_end)
    }
}

#[async_trait]
impl PeerLink for InMemoryLink {
    fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), LinkError> {
        let len = frame.len() as u64;
        self.outbound.send(frame).map_err(|_| LinkError::Closed)?;
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, LinkError> {
        let frame = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(LinkError::Closed)?;
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(frame)
    }

    fn health_snapshot(&self) -> LinkHealthSnapshot {
        LinkHealthSnapshot {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }
}
