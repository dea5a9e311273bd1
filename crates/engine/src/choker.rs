//! Tit-for-tat choking algorithm (§4.9): periodic rechoke plus optimistic-unchoke rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::peer_state::{PeerSnapshot, PeerStateTable};
use crate::type_aliases::{PeerHandle, TorrentId};

pub const DEFAULT_ROUND: Duration = Duration::from_secs(10);
const MIN_UPLOAD_SLOTS: usize = 1;
const OPTIMISTIC_ROTATE_EVERY: u64 = 3;

#[derive(Debug, Clone, Copy)]
pub struct ChokerConfig {
    pub max_upload_slots: MaxUploadSlots,
}

#[derive(Debug, Clone, Copy)]
pub enum MaxUploadSlots {
    Fixed(usize),
    Auto { max_upload_rate_kbps: u32 },
}

impl MaxUploadSlots {
    pub fn resolve(self) -> usize {
        match self {
            MaxUploadSlots::Fixed(n) => n,
            MaxUploadSlots::Auto {
                max_upload_rate_kbps,
            } => {
                let kbps = max_upload_rate_kbps as f64;
                if max_upload_rate_kbps == 0 {
                    7
                } else if kbps < 9.0 {
                    2
                } else if kbps < 15.0 {
                    3
                } else if kbps < 42.0 {
                    4
                } else {
                    (kbps * 0.8).sqrt().round() as usize
                }
            }
        }
    }
}

/// Whether a peer of ours is a leecher (downloading from us) or a seeder (we're downloading
/// from them) from the torrent's point of view, used to split the upload-slot budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Leecher,
    Seeder,
}

pub struct Decision {
    pub unchoke: Vec<PeerHandle>,
    pub choke: Vec<PeerHandle>,
}

/// Holds the optimistic-rotation ring and round counter for one torrent. Created once per
/// torrent alongside its `ChunkAssigner`.
pub struct Choker {
    round: AtomicUsize,
    ring: Mutex<Vec<PeerHandle>>,
}

impl Default for Choker {
    fn default() -> Self {
        Self {
            round: AtomicUsize::new(0),
            ring: Mutex::new(Vec::new()),
        }
    }
}

impl Choker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_joined(&self, peer: PeerHandle) {
        let mut ring = self.ring.lock();
        let pos = if ring.is_empty() {
            0
        } else {
            rand::rng().random_range(0..=ring.len())
        };
        ring.insert(pos, peer);
    }

    pub fn peer_left(&self, peer: PeerHandle) {
        self.ring.lock().retain(|p| *p != peer);
    }

    /// Run one rechoke pass for a torrent. `kind_of` classifies each connected peer as
    /// leecher or seeder from this torrent's perspective.
    pub fn rechoke(
        &self,
        torrent_id: TorrentId,
        table: &PeerStateTable,
        config: ChokerConfig,
        kind_of: impl Fn(PeerHandle) -> PeerKind,
    ) -> Decision {
        let snapshot = table.snapshot_torrent(torrent_id);
        let eligible: Vec<&PeerSnapshot> = snapshot
            .iter()
            .filter(|p| p.remote_interest && !p.snubbed)
            .collect();

        let mut leechers: Vec<&PeerSnapshot> = eligible
            .iter()
            .copied()
            .filter(|p| kind_of(p.peer) == PeerKind::Leecher)
            .collect();
        leechers.sort_by(|a, b| b.recv_rate.partial_cmp(&a.recv_rate).unwrap());

        let mut seeders: Vec<&PeerSnapshot> = eligible
            .iter()
            .copied()
            .filter(|p| kind_of(p.peer) == PeerKind::Seeder)
            .collect();
        seeders.sort_by(|a, b| b.send_rate.partial_cmp(&a.send_rate).unwrap());

        let max_slots = config.max_upload_slots.resolve().max(MIN_UPLOAD_SLOTS);
        let leecher_slots = ((max_slots as f64 * 0.7).round() as usize).max(1);
        let seeder_slots = ((max_slots as f64 * 0.3).round() as usize).max(1);

        let mut preferred: Vec<PeerHandle> = leechers
            .iter()
            .take(leecher_slots)
            .chain(seeders.iter().take(seeder_slots))
            .map(|p| p.peer)
            .collect();

        let optimistic_slots = max_slots.saturating_sub(preferred.len()).max(MIN_UPLOAD_SLOTS);

        let round = self.round.fetch_add(1, Ordering::Relaxed) as u64;
        if round % OPTIMISTIC_ROTATE_EVERY == 0 {
            let mut ring = self.ring.lock();
            if !ring.is_empty() {
                let len = ring.len();
                let mut granted = 0usize;
                let mut scanned = 0usize;
                let mut idx = 0usize;
                while granted < optimistic_slots && scanned < len {
                    let candidate = ring[idx % len];
                    scanned += 1;
                    idx += 1;
                    if preferred.contains(&candidate) {
                        continue;
                    }
                    let is_interested = snapshot
                        .iter()
                        .any(|p| p.peer == candidate && p.remote_interest);
                    if is_interested {
                        preferred.push(candidate);
                        granted += 1;
                    }
                }
                ring.rotate_left(idx.min(len));
            }
        }

        let choke: Vec<PeerHandle> = snapshot
            .iter()
            .map(|p| p.peer)
            .filter(|p| !preferred.contains(p))
            .collect();

        Decision {
            unchoke: preferred,
            choke,
        }
    }
}
