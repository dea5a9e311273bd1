//! Peer manager (§4.11, C11): candidate intake, the bad-peer table, and spare-slot filling.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::type_aliases::{PeerHandle, TorrentId};

const BAD_PEER_GRACE: Duration = Duration::from_secs(900);
pub const BAD_PEER_CLEANUP_EVERY: Duration = Duration::from_secs(120);
const MAX_OFFENSES_BEFORE_SKIP: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct BadPeerEntry {
    offenses: u32,
    last_offense: Instant,
}

#[derive(Default)]
struct Inner {
    candidates: Vec<PeerHandle>,
    connected: HashSet<(TorrentId, PeerHandle)>,
    bad_peers: HashMap<SocketAddr, BadPeerEntry>,
}

/// Owns the shuffled candidate list and the bad-peer table for the whole process; every
/// torrent's connector loop calls into the same instance.
pub struct PeerManager {
    inner: Mutex<Inner>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges freshly announced peers into the candidate list, deduplicated, and reshuffles.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerHandle>) {
        let mut g = self.inner.lock();
        let mut seen: HashSet<PeerHandle> = g.candidates.iter().copied().collect();
        for p in peers {
            if seen.insert(p) {
                g.candidates.push(p);
            }
        }
        g.candidates.shuffle(&mut rand::rng());
    }

    /// Pops candidates until `want` connectable ones are found or the list is exhausted.
    /// Already-connected and over-threshold bad peers are skipped, not requeued.
    pub fn take_connectable(&self, torrent_id: TorrentId, want: usize) -> Vec<PeerHandle> {
        let mut g = self.inner.lock();
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            let Some(candidate) = g.candidates.pop() else {
                break;
            };
            if g.connected.contains(&(torrent_id, candidate)) {
                continue;
            }
            if let Some(entry) = g.bad_peers.get(&candidate) {
                if entry.offenses > MAX_OFFENSES_BEFORE_SKIP {
                    continue;
                }
            }
            out.push(candidate);
        }
        out
    }

    pub fn mark_connected(&self, torrent_id: TorrentId, peer: PeerHandle) {
        self.inner.lock().connected.insert((torrent_id, peer));
    }

    pub fn mark_disconnected(&self, torrent_id: TorrentId, peer: PeerHandle) {
        self.inner.lock().connected.remove(&(torrent_id, peer));
    }

    /// Records a protocol-violation offense against `peer`.
    pub fn enter_bad_peer(&self, peer: PeerHandle) {
        let mut g = self.inner.lock();
        let now = Instant::now();
        g.bad_peers
            .entry(peer)
            .and_modify(|e| {
                e.offenses += 1;
                e.last_offense = now;
            })
            .or_insert(BadPeerEntry {
                offenses: 1,
                last_offense: now,
            });
    }

    /// Drops bad-peer entries whose last offense is older than the grace window. Intended to
    /// run on a 120-second tick.
    pub fn cleanup_bad_peers(&self) {
        let mut g = self.inner.lock();
        let now = Instant::now();
        g.bad_peers
            .retain(|_, e| now.duration_since(e.last_offense) < BAD_PEER_GRACE);
    }

    pub fn bad_peer_count(&self) -> usize {
        self.inner.lock().bad_peers.len()
    }
}
