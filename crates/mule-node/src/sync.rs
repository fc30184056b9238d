use std::collections::{HashMap, HashSet};

use mule_core::{BundleId, Priority, UnixSeconds};
use mule_transport::{LinkError, PeerLink};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest index a peer may advertise in one session.
pub const MAX_INDEX_ENTRIES: usize = 4096;

/// Advertised metadata for one bundle; carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub bundle_id: BundleId,
    pub priority: Priority,
    pub expires_at: UnixSeconds,
    pub size_bytes: u64,
}

/// Frames exchanged during one contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    Advertise { entries: Vec<IndexEntry> },
    Request { ids: Vec<BundleId> },
    /// Full signed bundle in wire encoding.
    Transfer { bundle: Vec<u8> },
    Done,
    /// Ids from the peer's transfers that were stored locally.
    Ack { ids: Vec<BundleId> },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync timed out")]
    Timeout,
    #[error("link failure: {0}")]
    Link(#[from] LinkError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("frame codec error: {0}")]
    Codec(String),
}

pub fn encode_message(msg: &SyncMessage) -> Result<Vec<u8>, SyncError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(msg, &mut out).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(out)
}

pub fn decode_message(bytes: &[u8]) -> Result<SyncMessage, SyncError> {
    ciborium::de::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}

/// What the local side is willing to send this session.
#[derive(Debug, Clone, Default)]
pub struct SessionOffer {
    pub index: Vec<IndexEntry>,
    /// Wire bytes per advertised id, already carrying the advanced hop count.
    pub frames: HashMap<BundleId, Vec<u8>>,
}

/// Result of a completed session. Nothing here is committed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    pub offered: usize,
    /// Entries actually transferred to the peer.
    pub sent: Vec<IndexEntry>,
    /// Sent ids the peer reported as stored.
    pub acknowledged: HashSet<BundleId>,
    pub requested: usize,
    pub received_frames: usize,
}

impl SessionOutcome {
    /// Transferred entries the peer did not keep.
    pub fn declined(&self) -> impl Iterator<Item = &IndexEntry> {
        self.sent
            .iter()
            .filter(|e| !self.acknowledged.contains(&e.bundle_id))
    }
}

async fn send(link: &dyn PeerLink, msg: &SyncMessage) -> Result<(), SyncError> {
    link.send(encode_message(msg)?).await?;
    Ok(())
}

async fn recv(link: &dyn PeerLink) -> Result<SyncMessage, SyncError> {
    decode_message(&link.recv().await?)
}

/// Runs one symmetric advertise / request / transfer / ack exchange.
///
/// Both ends run the same sequence, so the link only needs to buffer one
/// phase of frames. `skip` reports ids not worth requesting (held or
/// previously declined); `ingest` is handed each received bundle frame as
/// soon as it arrives and returns the id when the bundle was stored. The
/// caller owns committing `SessionOutcome::sent` once this returns `Ok`.
pub async fn run_session<H, I>(
    link: &dyn PeerLink,
    offer: SessionOffer,
    skip: H,
    mut ingest: I,
) -> Result<SessionOutcome, SyncError>
where
    H: Fn(&BundleId) -> bool,
    I: FnMut(Vec<u8>) -> Option<BundleId>,
{
    let mut outcome = SessionOutcome {
        offered: offer.index.len(),
        ..SessionOutcome::default()
    };

    send(
        link,
        &SyncMessage::Advertise {
            entries: offer.index.clone(),
        },
    )
    .await?;
    let remote_index = match recv(link).await? {
        SyncMessage::Advertise { entries } => entries,
        _ => return Err(SyncError::Protocol("expected advertise")),
    };
    if remote_index.len() > MAX_INDEX_ENTRIES {
        return Err(SyncError::Protocol("advertised index too large"));
    }

    let wanted: Vec<BundleId> = remote_index
        .iter()
        .map(|entry| entry.bundle_id)
        .filter(|id| !skip(id))
        .collect();
    send(link, &SyncMessage::Request { ids: wanted }).await?;
    let requested = match recv(link).await? {
        SyncMessage::Request { ids } => ids,
        _ => return Err(SyncError::Protocol("expected request")),
    };

    let mut seen = HashSet::new();
    for id in requested {
        if !seen.insert(id) {
            continue;
        }
        outcome.requested += 1;
        let (Some(frame), Some(entry)) = (
            offer.frames.get(&id),
            offer.index.iter().find(|e| e.bundle_id == id),
        ) else {
            continue;
        };
        send(
            link,
            &SyncMessage::Transfer {
                bundle: frame.clone(),
            },
        )
        .await?;
        outcome.sent.push(*entry);
    }
    send(link, &SyncMessage::Done).await?;

    let mut kept = Vec::new();
    loop {
        match recv(link).await? {
            SyncMessage::Transfer { bundle } => {
                outcome.received_frames += 1;
                kept.extend(ingest(bundle));
            }
            SyncMessage::Done => break,
            _ => return Err(SyncError::Protocol("expected transfer or done")),
        }
    }

    send(link, &SyncMessage::Ack { ids: kept }).await?;
    let acked = match recv(link).await? {
        SyncMessage::Ack { ids } => ids,
        _ => return Err(SyncError::Protocol("expected ack")),
    };
    if acked.len() > MAX_INDEX_ENTRIES {
        return Err(SyncError::Protocol("ack too large"));
    }
    outcome.acknowledged = acked
        .into_iter()
        .filter(|id| outcome.sent.iter().any(|e| e.bundle_id == *id))
        .collect();
    Ok(outcome)
}
