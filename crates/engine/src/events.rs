//! Broadcast bus for torrent lifecycle events that other collaborators (UI, persistence, and
//! sibling peer sessions of the same torrent) want to observe. The registry emits
//! `SeedingTorrent`; peer sessions emit `PieceComplete` and `CancelChunk` and also subscribe to
//! react to each other's emissions. It does not model a general event taxonomy.

use crate::chunk_assigner::Chunk;
use crate::type_aliases::{PeerHandle, PieceIndex, TorrentId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TorrentEventKind {
    /// The torrent transitioned from leeching to seeding: `left` reached zero.
    SeedingTorrent,
    /// A single piece finished downloading and verifying.
    PieceComplete(PieceIndex),
    /// Endgame duplicate resolution: `target` already has `chunk` in flight from another
    /// session and should cancel its own copy of the request.
    CancelChunk { target: PeerHandle, chunk: Chunk },
}

#[derive(Clone, Copy, Debug)]
pub struct TorrentEvent {
    pub torrent_id: TorrentId,
    pub kind: TorrentEventKind,
}

#[derive(Clone, Debug)]
pub struct SessionEventBus {
    event_tx: tokio::sync::broadcast::Sender<TorrentEvent>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(128);
        Self { event_tx }
    }

    pub(crate) fn new_torrent_bus(&self, torrent_id: TorrentId) -> TorrentEventBus {
        TorrentEventBus {
            torrent_id,
            session_bus: self.clone(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TorrentEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle scoped to one torrent; the chunk assigner and registry hold one of these each and
/// never see other torrents' events.
#[derive(Clone, Debug)]
pub struct TorrentEventBus {
    torrent_id: TorrentId,
    session_bus: SessionEventBus,
}

impl TorrentEventBus {
    /// Subscribes to this torrent's events. The underlying channel carries every torrent's
    /// events; callers filter on `TorrentEvent::torrent_id` (it always equals this bus's id).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TorrentEvent> {
        self.session_bus.subscribe()
    }

    pub fn emit(&self, kind: TorrentEventKind) {
        let _ = self.session_bus.event_tx.send(TorrentEvent {
            torrent_id: self.torrent_id,
            kind,
        });
    }

    pub fn seeding_torrent(&self) {
        self.emit(TorrentEventKind::SeedingTorrent);
    }

    pub fn piece_complete(&self, piece: PieceIndex) {
        self.emit(TorrentEventKind::PieceComplete(piece));
    }

    pub fn cancel_chunk(&self, target: PeerHandle, chunk: Chunk) {
        self.emit(TorrentEventKind::CancelChunk { target, chunk });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn piece_complete_reaches_session_subscriber() {
        let bus = SessionEventBus::new();
        let mut rx = bus.subscribe();
        let torrent_bus = bus.new_torrent_bus(7);

        torrent_bus.piece_complete(3);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.torrent_id, 7);
        assert_eq!(ev.kind, TorrentEventKind::PieceComplete(3));
    }
}
