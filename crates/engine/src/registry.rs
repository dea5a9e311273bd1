//! In-memory torrent registry (§4.2): the single writer of torrent-level attributes.
//!
//! Mirrors the locking shape used by [`crate::peer_state::PeerStateTable`]: one `RwLock` over
//! a `HashMap`, snapshot reads, serialized writes via a small alteration log so a batch of
//! changes either all land or none do.

use std::collections::HashMap;

use core_types::Id20;
use parking_lot::RwLock;

use crate::events::TorrentEventBus;
use crate::type_aliases::TorrentId;

const RATE_WINDOW_LEN: usize = 25;
const RATE_WINDOW_TRIM_TO: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentMode {
    Progress,
    Endgame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Unknown,
    Leeching,
    Seeding,
    Partial,
    Paused,
    Checking,
    Waiting,
}

#[derive(Debug)]
pub struct TorrentEntry {
    pub info_hash: Id20,
    pub total: u64,
    pub wanted: u64,
    pub left: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub piece_count: u32,
    pub tracker_seeders: u32,
    pub tracker_leechers: u32,
    pub connected_seeders: u32,
    pub connected_leechers: u32,
    pub is_private: bool,
    pub is_paused: bool,
    pub mode: TorrentMode,
    pub state: TorrentState,
    pub rate_window: Vec<f64>,
    events: TorrentEventBus,
}

/// A tagged mutation applied atomically as part of one `apply()` batch.
pub enum Alteration {
    AddDownloaded(u64),
    AddUploaded(u64),
    SubtractLeft(u64),
    /// Like `SubtractLeft`, but for pieces that were skipped (deselected) rather than
    /// downloaded: `N` may legitimately exceed the tracked `left` (a piece can be skipped
    /// after being counted as wanted by a different accounting path), so this saturates
    /// at zero instead of rejecting the batch.
    SubtractLeftOrSkipped(u64),
    SetWanted(u64),
    TrackerReport { seeders: u32, leechers: u32 },
    SetMode(TorrentMode),
    SetPaused(bool),
    /// Resumes a paused torrent, restoring whatever state its `left`/`wanted` imply.
    Continue,
    SetUnknown,
    SetChecking,
    SetWaiting,
    IncConnectedLeecher,
    DecConnectedLeecher,
    IncConnectedSeeder,
    DecConnectedSeeder,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no such torrent {0}")]
    NoSuchTorrent(TorrentId),
    #[error("left would underflow for torrent {0}")]
    LeftUnderflow(TorrentId),
}

/// Shared by `SubtractLeft` and `SubtractLeftOrSkipped`: once `left` hits zero, settle on
/// `paused`/`partial`/`seeding` and fire the leeching-to-seeding event on that transition.
fn settle_left_zero(entry: &mut TorrentEntry) {
    if entry.left != 0 {
        return;
    }
    let was_leeching = matches!(entry.state, TorrentState::Leeching);
    entry.state = if entry.is_paused {
        TorrentState::Paused
    } else if entry.wanted < entry.total {
        TorrentState::Partial
    } else {
        TorrentState::Seeding
    };
    if was_leeching && matches!(entry.state, TorrentState::Seeding) {
        entry.events.seeding_torrent();
    }
}

pub struct Registry {
    inner: RwLock<HashMap<TorrentId, TorrentEntry>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        info_hash: Id20,
        total: u64,
        wanted: u64,
        piece_count: u32,
        is_private: bool,
        session_bus: &crate::events::SessionEventBus,
    ) -> TorrentId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let events = session_bus.new_torrent_bus(id);
        let state = if wanted == total {
            TorrentState::Leeching
        } else {
            TorrentState::Partial
        };
        let entry = TorrentEntry {
            info_hash,
            total,
            wanted,
            left: wanted,
            downloaded: 0,
            uploaded: 0,
            piece_count,
            tracker_seeders: 0,
            tracker_leechers: 0,
            connected_seeders: 0,
            connected_leechers: 0,
            is_private,
            is_paused: false,
            mode: TorrentMode::Progress,
            state,
            rate_window: Vec::with_capacity(RATE_WINDOW_LEN),
            events,
        };
        self.inner.write().insert(id, entry);
        id
    }

    pub fn remove(&self, id: TorrentId) {
        self.inner.write().remove(&id);
    }

    /// Applies a batch of alterations under one write-lock acquisition, so readers never
    /// observe a partially-applied batch.
    pub fn apply(&self, id: TorrentId, alterations: &[Alteration]) -> Result<(), RegistryError> {
        let mut g = self.inner.write();
        let entry = g.get_mut(&id).ok_or(RegistryError::NoSuchTorrent(id))?;

        for alt in alterations {
            match alt {
                Alteration::AddDownloaded(n) => entry.downloaded += n,
                Alteration::AddUploaded(n) => entry.uploaded += n,
                Alteration::SubtractLeft(n) => {
                    entry.left = entry
                        .left
                        .checked_sub(*n)
                        .ok_or(RegistryError::LeftUnderflow(id))?;
                    settle_left_zero(entry);
                }
                Alteration::SubtractLeftOrSkipped(n) => {
                    entry.left = entry.left.saturating_sub(*n);
                    settle_left_zero(entry);
                }
                Alteration::SetWanted(n) => {
                    let was_zero_left = entry.left == 0;
                    entry.wanted = *n;
                    if was_zero_left && entry.wanted > entry.left {
                        entry.state = TorrentState::Leeching;
                    }
                }
                Alteration::TrackerReport { seeders, leechers } => {
                    entry.tracker_seeders = *seeders;
                    entry.tracker_leechers = *leechers;
                }
                Alteration::SetMode(mode) => entry.mode = *mode,
                Alteration::SetPaused(paused) => {
                    entry.is_paused = *paused;
                    if *paused {
                        entry.state = TorrentState::Paused;
                    }
                }
                Alteration::Continue => {
                    entry.is_paused = false;
                    entry.state = if entry.left == 0 {
                        if entry.wanted < entry.total {
                            TorrentState::Partial
                        } else {
                            TorrentState::Seeding
                        }
                    } else {
                        TorrentState::Leeching
                    };
                }
                Alteration::SetUnknown => entry.state = TorrentState::Unknown,
                Alteration::SetChecking => entry.state = TorrentState::Checking,
                Alteration::SetWaiting => entry.state = TorrentState::Waiting,
                Alteration::IncConnectedLeecher => entry.connected_leechers += 1,
                Alteration::DecConnectedLeecher => {
                    entry.connected_leechers = entry.connected_leechers.saturating_sub(1)
                }
                Alteration::IncConnectedSeeder => entry.connected_seeders += 1,
                Alteration::DecConnectedSeeder => {
                    entry.connected_seeders = entry.connected_seeders.saturating_sub(1)
                }
            }
        }
        Ok(())
    }

    /// Drives one torrent's rate sparkline forever: every 60 seconds, sums that torrent's
    /// current receive rate across all connected peers (from [`crate::peer_state::PeerStateTable`])
    /// and pushes the sample. Intended to be spawned as its own task per torrent, matching the
    /// "one task per torrent for registry housekeeping" role in the concurrency model; it never
    /// returns on its own and should be aborted when the torrent is removed.
    pub async fn run_rate_sparkline(
        self: std::sync::Arc<Self>,
        peer_states: std::sync::Arc<crate::peer_state::PeerStateTable>,
        id: TorrentId,
    ) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let rate: f64 = peer_states
                .snapshot_torrent(id)
                .iter()
                .map(|s| s.recv_rate)
                .sum();
            self.push_rate_sample(id, rate);
        }
    }

    /// 60-second tick: push a rate sample, trimming the window once it overflows.
    pub fn push_rate_sample(&self, id: TorrentId, rate: f64) {
        let mut g = self.inner.write();
        let Some(entry) = g.get_mut(&id) else {
            return;
        };
        entry.rate_window.push(rate);
        if entry.rate_window.len() > RATE_WINDOW_LEN {
            let drop = entry.rate_window.len() - RATE_WINDOW_TRIM_TO;
            entry.rate_window.drain(0..drop);
        }
    }

    pub fn is_seeding(&self, id: TorrentId) -> bool {
        self.inner
            .read()
            .get(&id)
            .is_some_and(|e| matches!(e.state, TorrentState::Seeding))
    }

    pub fn state(&self, id: TorrentId) -> Option<TorrentState> {
        self.inner.read().get(&id).map(|e| e.state)
    }

    pub fn mode(&self, id: TorrentId) -> Option<TorrentMode> {
        self.inner.read().get(&id).map(|e| e.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEventBus;

    fn id20() -> Id20 {
        Id20::new([0u8; 20])
    }

    #[test]
    fn subtract_left_to_zero_transitions_to_seeding() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        registry
            .apply(id, &[Alteration::SubtractLeft(100)])
            .unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Seeding));
    }

    #[test]
    fn left_zero_while_paused_does_not_transition_to_seeding() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        registry.apply(id, &[Alteration::SetPaused(true)]).unwrap();
        registry
            .apply(id, &[Alteration::SubtractLeft(100)])
            .unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Paused));
    }

    #[test]
    fn left_zero_with_partial_wanted_transitions_to_partial_not_seeding() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 200, 100, 1, false, &bus);
        registry
            .apply(id, &[Alteration::SubtractLeft(100)])
            .unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Partial));
    }

    #[test]
    fn subtract_left_underflow_is_rejected_and_state_unaffected() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        let err = registry.apply(id, &[Alteration::SubtractLeft(200)]);
        assert!(err.is_err());
        assert_eq!(registry.state(id), Some(TorrentState::Leeching));
    }

    #[test]
    fn rate_window_trims_down_to_twenty_once_it_overflows() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        for i in 0..30 {
            registry.push_rate_sample(id, i as f64);
        }
        let g = registry.inner.read();
        assert_eq!(g.get(&id).unwrap().rate_window.len(), RATE_WINDOW_TRIM_TO + 4);
    }

    #[test]
    fn continue_resumes_a_paused_torrent_to_leeching() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        registry.apply(id, &[Alteration::SetPaused(true)]).unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Paused));

        registry.apply(id, &[Alteration::Continue]).unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Leeching));
    }

    #[test]
    fn continue_after_paused_at_zero_left_resumes_to_seeding() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        registry.apply(id, &[Alteration::SetPaused(true)]).unwrap();
        registry
            .apply(id, &[Alteration::SubtractLeft(100)])
            .unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Paused));

        registry.apply(id, &[Alteration::Continue]).unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Seeding));
    }

    #[test]
    fn lifecycle_alterations_set_unknown_checking_and_waiting() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);

        registry.apply(id, &[Alteration::SetUnknown]).unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Unknown));

        registry.apply(id, &[Alteration::SetChecking]).unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Checking));

        registry.apply(id, &[Alteration::SetWaiting]).unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Waiting));
    }

    #[test]
    fn subtract_left_or_skipped_saturates_instead_of_erroring() {
        let registry = Registry::new();
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);
        registry
            .apply(id, &[Alteration::SubtractLeftOrSkipped(500)])
            .unwrap();
        assert_eq!(registry.state(id), Some(TorrentState::Seeding));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_sparkline_tick_samples_peer_recv_rate_every_minute() {
        use crate::peer_state::PeerStateTable;
        use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

        let registry = std::sync::Arc::new(Registry::new());
        let bus = SessionEventBus::new();
        let id = registry.insert(id20(), 100, 100, 1, false, &bus);

        let peer_states = std::sync::Arc::new(PeerStateTable::new());
        let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        peer_states.insert(id, peer);
        peer_states.with_mut(id, peer, |f| {
            f.note_piece_received(1 << 20, std::time::Instant::now())
        });

        let handle = tokio::spawn(registry.clone().run_rate_sparkline(peer_states, id));
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        handle.abort();

        let g = registry.inner.read();
        assert_eq!(g.get(&id).unwrap().rate_window.len(), 1);
    }
}
