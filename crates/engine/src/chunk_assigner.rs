//! Chunk assignment, per-peer pending tracking, and endgame duplication.
//!
//! One [`ChunkAssigner`] exists per torrent. It owns the only mutable view of chunk state;
//! every other component (peer sessions, the choker) only ever calls into it or reads a
//! snapshot. This mirrors the single-writer discipline the peer state table and torrent
//! registry use elsewhere in this crate.

use std::collections::HashMap;

use core_types::lengths::{Lengths, ValidPieceIndex};
use parking_lot::Mutex;

use crate::type_aliases::PeerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Free,
    Assigned,
    Fetched,
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub piece: ValidPieceIndex,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignerMode {
    Progress,
    Endgame,
}

/// What `request()` returned, and whether the caller should treat the returned chunks as
/// duplicated work against other peers (endgame) or exclusive (progress).
#[derive(Debug)]
pub enum Assignment {
    None,
    Chunks { chunks: Vec<Chunk>, endgame: bool },
}

struct Inner {
    lengths: Lengths,
    chunk_state: Vec<ChunkState>,
    // how many chunks in each piece are still `Free`; 0 means fully assigned.
    free_in_piece: Vec<u32>,
    // how many peers have each piece, for rarest-first ordering.
    availability: Vec<u32>,
    // absolute chunk index -> set of peers currently holding an assignment for it.
    assigned_to: HashMap<u32, Vec<PeerHandle>>,
    // peer -> set of absolute chunk indices it's been asked to fetch.
    pending: HashMap<PeerHandle, Vec<u32>>,
    free_total: u32,
    stored_total: u32,
    mode: AssignerMode,
    replication_factor: usize,
}

pub struct ChunkAssigner {
    inner: Mutex<Inner>,
}

fn absolute_index(lengths: &Lengths, piece: ValidPieceIndex, chunk_index: u32) -> u32 {
    lengths.default_chunks_per_piece() * piece.get() + chunk_index
}

impl ChunkAssigner {
    /// `replication_factor` is the endgame duplication cap (`Config::endgame_replication_factor`):
    /// the most peers that may simultaneously hold an assignment for the same chunk once the
    /// torrent is out of free work.
    pub fn new(lengths: Lengths, replication_factor: usize) -> Self {
        let total_chunks = lengths.total_chunks() as usize;
        let total_pieces = lengths.total_pieces() as usize;
        let free_in_piece = lengths
            .iter_piece_infos()
            .map(|p| lengths.chunks_per_piece(p.piece_index))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                lengths,
                chunk_state: vec![ChunkState::Free; total_chunks],
                free_in_piece,
                availability: vec![0; total_pieces],
                assigned_to: HashMap::new(),
                pending: HashMap::new(),
                free_total: total_chunks as u32,
                stored_total: 0,
                mode: AssignerMode::Progress,
                replication_factor: replication_factor.max(1),
            }),
        }
    }

    pub fn mode(&self) -> AssignerMode {
        self.inner.lock().mode
    }

    pub fn lengths(&self) -> Lengths {
        self.inner.lock().lengths
    }

    pub fn is_complete(&self) -> bool {
        let g = self.inner.lock();
        g.stored_total as usize == g.chunk_state.len()
    }

    /// Called when a peer announces (via `have`/`bitfield`) that it has a piece.
    pub fn peer_has_piece(&self, piece: ValidPieceIndex) {
        let mut g = self.inner.lock();
        g.availability[piece.get() as usize] += 1;
    }

    pub fn peer_lost_piece(&self, piece: ValidPieceIndex) {
        let mut g = self.inner.lock();
        let a = &mut g.availability[piece.get() as usize];
        *a = a.saturating_sub(1);
    }

    /// Select up to `n` chunks this peer (who has the pieces in `peer_has`) can fetch.
    pub fn request(
        &self,
        n: usize,
        peer_has: &dyn Fn(ValidPieceIndex) -> bool,
        peer: PeerHandle,
    ) -> Assignment {
        if n == 0 {
            return Assignment::None;
        }
        let mut g = self.inner.lock();
        let endgame = matches!(g.mode, AssignerMode::Endgame);
        let mut out = Vec::with_capacity(n);

        let total_pieces = g.lengths.total_pieces();
        // rarest-first: rank candidate pieces by ascending availability, tie-break by index.
        let mut candidates: Vec<u32> = (0..total_pieces)
            .filter(|&idx| {
                let pi = g.lengths.validate_piece_index(idx).expect("in range");
                peer_has(pi) && (g.free_in_piece[idx as usize] > 0 || endgame)
            })
            .collect();
        candidates.sort_by_key(|&idx| (g.availability[idx as usize], idx));

        'outer: for piece_idx in candidates {
            let piece = g.lengths.validate_piece_index(piece_idx).expect("in range");
            for chunk in g.lengths.iter_chunk_infos(piece) {
                if out.len() >= n {
                    break 'outer;
                }
                let abs = chunk.absolute_index;
                let state = g.chunk_state[abs as usize];
                let eligible = match (state, endgame) {
                    (ChunkState::Free, _) => true,
                    (ChunkState::Assigned, true) => {
                        let holders = g.assigned_to.get(&abs).map(|v| v.len()).unwrap_or(0);
                        holders < g.replication_factor
                            && !g.assigned_to.get(&abs).is_some_and(|v| v.contains(&peer))
                    }
                    _ => false,
                };
                if !eligible {
                    continue;
                }
                if state == ChunkState::Free {
                    g.chunk_state[abs as usize] = ChunkState::Assigned;
                    g.free_in_piece[piece_idx as usize] -= 1;
                    g.free_total -= 1;
                }
                g.assigned_to.entry(abs).or_default().push(peer);
                g.pending.entry(peer).or_default().push(abs);
                out.push(Chunk {
                    piece,
                    offset: chunk.offset,
                    length: chunk.size,
                });
            }
        }

        if out.is_empty() {
            return Assignment::None;
        }

        if g.free_total == 0 && g.mode == AssignerMode::Progress {
            g.mode = AssignerMode::Endgame;
        }

        Assignment::Chunks {
            chunks: out,
            endgame,
        }
    }

    /// Diagnostic snapshot of outstanding requests grouped by the peer they were assigned to.
    /// Mirrors the "pending tracker" view a debug endpoint or test would want; not consulted by
    /// any assignment decision.
    pub fn requests_by_peer(&self) -> HashMap<PeerHandle, Vec<u32>> {
        self.inner.lock().pending.clone()
    }

    /// Diagnostic snapshot of outstanding requests grouped by the chunk they're for.
    pub fn requests_by_chunk(&self) -> HashMap<u32, Vec<PeerHandle>> {
        self.inner.lock().assigned_to.clone()
    }

    /// Rarest-first's availability spectrum as run-length groups: sorted availability counts
    /// paired with how many pieces currently sit at that count. Cheap way for a debug endpoint
    /// to show how lopsided the swarm's piece distribution is without dumping every piece index.
    pub fn availability_histogram(&self) -> Vec<(u32, usize)> {
        let g = self.inner.lock();
        let mut sorted = g.availability.clone();
        sorted.sort_unstable();
        core_types::group::group(sorted)
    }

    /// A peer session died or disconnected: reclaim everything it was assigned.
    pub fn dropped(&self, peer: PeerHandle) {
        let mut g = self.inner.lock();
        let Some(pending) = g.pending.remove(&peer) else {
            return;
        };
        let endgame = matches!(g.mode, AssignerMode::Endgame);
        for abs in pending {
            if g.chunk_state[abs as usize] == ChunkState::Stored {
                continue;
            }
            if let Some(holders) = g.assigned_to.get_mut(&abs) {
                holders.retain(|p| *p != peer);
                if holders.is_empty() {
                    g.assigned_to.remove(&abs);
                    if !endgame {
                        let piece_idx = abs / g.lengths.default_chunks_per_piece();
                        g.chunk_state[abs as usize] = ChunkState::Free;
                        g.free_in_piece[piece_idx as usize] += 1;
                        g.free_total += 1;
                    }
                }
            }
        }
    }

    /// Bytes for this chunk arrived over the wire (not yet durably written).
    pub fn fetched(&self, piece: ValidPieceIndex, offset: u32) {
        let mut g = self.inner.lock();
        let abs = absolute_index(&g.lengths, piece, offset / core_types::constants::CHUNK_SIZE);
        if g.chunk_state[abs as usize] == ChunkState::Assigned {
            g.chunk_state[abs as usize] = ChunkState::Fetched;
        }
    }

    /// The chunk was durably written (and, if it completed the piece, hash-verified).
    /// Returns the peers that should receive a `cancel` for this chunk (endgame only) and
    /// whether this call completed the whole piece.
    pub fn stored(&self, piece: ValidPieceIndex, offset: u32, by: PeerHandle) -> StoredOutcome {
        let mut g = self.inner.lock();
        let chunk_index = offset / core_types::constants::CHUNK_SIZE;
        let abs = absolute_index(&g.lengths, piece, chunk_index);

        let mut cancel_others = Vec::new();
        if let Some(holders) = g.assigned_to.remove(&abs) {
            for peer in holders {
                if peer != by {
                    cancel_others.push(peer);
                }
                if let Some(p) = g.pending.get_mut(&peer) {
                    p.retain(|c| *c != abs);
                }
            }
        }
        let already_stored = g.chunk_state[abs as usize] == ChunkState::Stored;
        if !already_stored {
            g.chunk_state[abs as usize] = ChunkState::Stored;
            g.stored_total += 1;
        }

        let range = g.lengths.chunk_range(piece);
        let piece_complete = g.chunk_state[range].iter().all(|s| *s == ChunkState::Stored);

        StoredOutcome {
            cancel_peers: cancel_others,
            piece_complete,
            was_duplicate: already_stored,
        }
    }
}

#[derive(Debug)]
pub struct StoredOutcome {
    pub cancel_peers: Vec<PeerHandle>,
    pub piece_complete: bool,
    pub was_duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn peer(n: u16) -> PeerHandle {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, n))
    }

    fn all_pieces(_: ValidPieceIndex) -> bool {
        true
    }

    #[test]
    fn chunk_conservation_holds_through_assign_and_store() {
        let lengths = Lengths::new(32768 * 2, 32768).unwrap();
        let assigner = ChunkAssigner::new(lengths, 2);
        let total = lengths.total_chunks();

        let p1 = peer(1);
        let assignment = assigner.request(total as usize, &all_pieces, p1);
        let Assignment::Chunks { chunks, endgame } = assignment else {
            panic!("expected chunks")
        };
        assert!(!endgame);
        assert_eq!(chunks.len(), total as usize);

        for c in &chunks {
            assigner.fetched(c.piece, c.offset);
            assigner.stored(c.piece, c.offset, p1);
        }
        assert!(assigner.is_complete());
    }

    #[test]
    fn no_double_assignment_outside_endgame() {
        let lengths = Lengths::new(32768 * 4, 32768).unwrap();
        let assigner = ChunkAssigner::new(lengths, 2);
        let p1 = peer(1);
        let p2 = peer(2);

        let Assignment::Chunks { chunks: c1, endgame } = assigner.request(2, &all_pieces, p1)
        else {
            panic!("expected chunks")
        };
        assert!(!endgame);
        let Assignment::Chunks { chunks: c2, endgame } = assigner.request(2, &all_pieces, p2)
        else {
            panic!("expected chunks")
        };
        assert!(!endgame);

        let abs = |c: &Chunk| {
            c.piece.get() * lengths.default_chunks_per_piece()
                + c.offset / core_types::constants::CHUNK_SIZE
        };
        let set1: std::collections::HashSet<u32> = c1.iter().map(abs).collect();
        let set2: std::collections::HashSet<u32> = c2.iter().map(abs).collect();
        assert!(set1.is_disjoint(&set2));
    }

    #[test]
    fn requests_diagnostics_are_grouped_both_ways() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let assigner = ChunkAssigner::new(lengths, 2);
        let p1 = peer(1);
        assigner.request(1, &all_pieces, p1);

        let by_peer = assigner.requests_by_peer();
        assert_eq!(by_peer.get(&p1).map(Vec::len), Some(1));

        let by_chunk = assigner.requests_by_chunk();
        assert_eq!(by_chunk.values().flatten().count(), 1);
        assert!(by_chunk.values().flatten().any(|p| *p == p1));
    }

    #[test]
    fn availability_histogram_groups_equal_counts() {
        let lengths = Lengths::new(32768 * 3, 32768).unwrap();
        let assigner = ChunkAssigner::new(lengths, 2);
        let p0 = lengths.validate_piece_index(0).unwrap();
        let p1 = lengths.validate_piece_index(1).unwrap();
        let p2 = lengths.validate_piece_index(2).unwrap();
        assigner.peer_has_piece(p0);
        assigner.peer_has_piece(p1);
        assigner.peer_has_piece(p1);
        assigner.peer_has_piece(p2);
        assigner.peer_has_piece(p2);

        let histogram = assigner.availability_histogram();
        let total: usize = histogram.iter().map(|(_, count)| *count).sum();
        assert_eq!(total, 3);
        assert_eq!(histogram, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn drop_reclaims_chunks_to_free_outside_endgame() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let assigner = ChunkAssigner::new(lengths, 2);
        let p1 = peer(1);
        let assignment = assigner.request(1, &all_pieces, p1);
        assert!(matches!(assignment, Assignment::Chunks { .. }));

        assigner.dropped(p1);
        let p2 = peer(2);
        let assignment = assigner.request(1, &all_pieces, p2);
        assert!(matches!(assignment, Assignment::Chunks { .. }));
    }

    #[test]
    fn endgame_store_cancels_other_holders() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let assigner = ChunkAssigner::new(lengths, 2);
        let p1 = peer(1);
        let p2 = peer(2);

        // exhaust free chunks to force endgame, then duplicate-assign to p2.
        let a1 = assigner.request(1, &all_pieces, p1);
        let Assignment::Chunks { chunks, .. } = a1 else {
            panic!()
        };
        assert_eq!(assigner.mode(), AssignerMode::Endgame);

        let a2 = assigner.request(1, &all_pieces, p2);
        assert!(matches!(a2, Assignment::Chunks { endgame: true, .. }));

        let c = chunks[0];
        let outcome = assigner.stored(c.piece, c.offset, p1);
        assert!(outcome.cancel_peers.contains(&p2));
        assert!(outcome.piece_complete);
    }
}
