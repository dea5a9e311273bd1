//! Process-wide table of per-`(torrent, peer)` choke/interest flags and rates.
//!
//! Reads (the choker's per-round snapshot) never block writers (a session updating its own
//! flags), and vice versa: the table is a `parking_lot::RwLock` over a plain map, matching the
//! locking discipline used across this crate rather than anything lock-free.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use core_types::rate_meter::RateMeter;
use parking_lot::RwLock;

use crate::type_aliases::{PeerHandle, TorrentId};

const SNUB_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct PeerFlags {
    pub local_choke: bool,
    pub remote_choke: bool,
    pub local_interest: bool,
    pub remote_interest: bool,
    last_piece_received: Instant,
    pub send_rate: RateMeter,
    pub recv_rate: RateMeter,
}

impl PeerFlags {
    fn new(now: Instant) -> Self {
        Self {
            local_choke: true,
            remote_choke: true,
            local_interest: false,
            remote_interest: false,
            last_piece_received: now,
            send_rate: RateMeter::new(),
            recv_rate: RateMeter::new(),
        }
    }

    pub fn snubbed(&self, now: Instant) -> bool {
        now.duration_since(self.last_piece_received) >= SNUB_AFTER
    }

    pub fn note_piece_received(&mut self, amount: u64, now: Instant) {
        self.recv_rate.update(amount, now);
        self.last_piece_received = now;
    }
}

/// A read-only view handed to the choker; cheap to clone since rates are atomics.
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub peer: PeerHandle,
    pub local_choke: bool,
    pub remote_interest: bool,
    pub snubbed: bool,
    pub send_rate: f64,
    pub recv_rate: f64,
}

#[derive(Default)]
pub struct PeerStateTable {
    inner: RwLock<HashMap<(TorrentId, PeerHandle), PeerFlags>>,
}

impl PeerStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, torrent_id: TorrentId, peer: PeerHandle) {
        self.inner
            .write()
            .insert((torrent_id, peer), PeerFlags::new(Instant::now()));
    }

    pub fn remove(&self, torrent_id: TorrentId, peer: PeerHandle) {
        self.inner.write().remove(&(torrent_id, peer));
    }

    pub fn with_mut<R>(
        &self,
        torrent_id: TorrentId,
        peer: PeerHandle,
        f: impl FnOnce(&mut PeerFlags) -> R,
    ) -> Option<R> {
        self.inner.write().get_mut(&(torrent_id, peer)).map(f)
    }

    pub fn set_local_choke(&self, torrent_id: TorrentId, peer: PeerHandle, choke: bool) {
        self.with_mut(torrent_id, peer, |f| f.local_choke = choke);
    }

    /// Snapshot every peer of a torrent for the choker's rechoke pass. Never blocks a writer
    /// for longer than a single read-lock acquisition.
    pub fn snapshot_torrent(&self, torrent_id: TorrentId) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        self.inner
            .read()
            .iter()
            .filter(|((tid, _), _)| *tid == torrent_id)
            .map(|((_, peer), flags)| PeerSnapshot {
                peer: *peer,
                local_choke: flags.local_choke,
                remote_interest: flags.remote_interest,
                snubbed: flags.snubbed(now),
                send_rate: flags.send_rate.rate(),
                recv_rate: flags.recv_rate.rate(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn peer(n: u16) -> PeerHandle {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, n))
    }

    #[test]
    fn fresh_peer_starts_choked_and_uninterested() {
        let table = PeerStateTable::new();
        table.insert(1, peer(1));
        let snap = table.snapshot_torrent(1);
        assert_eq!(snap.len(), 1);
        assert!(snap[0].local_choke);
    }

    #[test]
    fn snub_flag_follows_last_piece_timestamp() {
        let table = PeerStateTable::new();
        table.insert(1, peer(1));
        table.with_mut(1, peer(1), |f| {
            f.last_piece_received = Instant::now() - Duration::from_secs(31);
        });
        assert!(table.snapshot_torrent(1)[0].snubbed);
    }

    #[test]
    fn note_piece_received_resets_the_snub_clock() {
        let table = PeerStateTable::new();
        table.insert(1, peer(1));
        table.with_mut(1, peer(1), |f| {
            f.last_piece_received = Instant::now() - Duration::from_secs(31);
        });
        assert!(table.snapshot_torrent(1)[0].snubbed);

        table.with_mut(1, peer(1), |f| f.note_piece_received(16384, Instant::now()));
        assert!(!table.snapshot_torrent(1)[0].snubbed);
    }
}
