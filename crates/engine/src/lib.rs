//! The peer-swarm engine: drives concurrent peer sessions for a set of torrents, distributes
//! chunk work across them, and enforces tit-for-tat choking.
//!
//! [`Swarm`] is the facade a collaborator (CLI, web UI, whatever parses a config file and a
//! metainfo) is expected to build against: add a torrent, feed it tracker peers, let it run.

pub mod choker;
pub mod chunk_assigner;
pub mod config;
pub mod error;
pub mod events;
pub mod limits;
pub mod listen;
pub mod peer_manager;
pub mod peer_session;
pub mod peer_state;
pub mod registry;
pub mod storage;
pub mod tracker;
pub mod type_aliases;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use core_types::Id20;

use crate::choker::{Choker, ChokerConfig, PeerKind};
use crate::chunk_assigner::ChunkAssigner;
use crate::config::Config;
use crate::events::{SessionEventBus, TorrentEventBus};
use crate::limits::{Limits, LimitsConfig};
use crate::peer_manager::PeerManager;
use crate::peer_session::{PeerSessionContext, PeerSessionTable};
use crate::peer_state::PeerStateTable;
use crate::registry::{Registry, TorrentMode};
use crate::storage::TorrentStorage;
use crate::type_aliases::{PeerHandle, TorrentId};

/// Everything one active torrent needs that isn't shared across the whole process: its chunk
/// assigner, its choker ring, and a handle to its storage collaborator. Owns the background
/// tasks that keep the choker and the rate sparkline moving; dropping it stops both.
pub struct TorrentHandle {
    pub id: TorrentId,
    pub info_hash: Id20,
    pub assigner: Arc<ChunkAssigner>,
    pub choker: Arc<Choker>,
    pub storage: Arc<dyn TorrentStorage>,
    pub events: TorrentEventBus,
    rechoke_task: tokio::task::JoinHandle<()>,
    sparkline_task: tokio::task::JoinHandle<()>,
}

impl Drop for TorrentHandle {
    fn drop(&mut self) {
        self.rechoke_task.abort();
        self.sparkline_task.abort();
    }
}

/// Runs forever: every `round`, takes a rechoke decision for `torrent_id` and delivers it to
/// whichever sessions are still connected. Spawned once per torrent alongside its `Choker`.
async fn rechoke_loop(
    torrent_id: TorrentId,
    choker: Arc<Choker>,
    peer_states: Arc<PeerStateTable>,
    session_handles: Arc<PeerSessionTable>,
    config: ChokerConfig,
    round: std::time::Duration,
) {
    let mut interval = tokio::time::interval(round);
    loop {
        interval.tick().await;
        let decision = choker.rechoke(torrent_id, &peer_states, config, |_| PeerKind::Leecher);
        session_handles.apply_decision(torrent_id, &decision);
    }
}

/// Process-wide engine state: one registry, one peer state table, one peer manager, shared by
/// every torrent and every peer session.
pub struct Swarm {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub peer_states: Arc<PeerStateTable>,
    pub peer_manager: Arc<PeerManager>,
    pub session_handles: Arc<PeerSessionTable>,
    pub event_bus: SessionEventBus,
    pub limits: Arc<Limits>,
    pub our_peer_id: Id20,
}

impl Swarm {
    pub fn new(config: Config) -> Self {
        let limits = LimitsConfig {
            upload_bps: config.max_upload_rate.and_then(std::num::NonZeroU32::new),
            download_bps: config.max_download_rate.and_then(std::num::NonZeroU32::new),
        };
        Self {
            registry: Arc::new(Registry::new()),
            peer_states: Arc::new(PeerStateTable::new()),
            peer_manager: Arc::new(PeerManager::new()),
            session_handles: Arc::new(PeerSessionTable::new()),
            event_bus: SessionEventBus::new(),
            limits: Arc::new(Limits::new(limits)),
            our_peer_id: core_types::peer_id::generate_peer_id(),
            config,
        }
    }

    /// Registers a new torrent and returns its handle plus the registry-assigned id.
    pub fn add_torrent(
        &self,
        info_hash: Id20,
        lengths: core_types::lengths::Lengths,
        total: u64,
        wanted: u64,
        is_private: bool,
        storage: Arc<dyn TorrentStorage>,
    ) -> TorrentHandle {
        let id = self.registry.insert(
            info_hash,
            total,
            wanted,
            lengths.total_pieces(),
            is_private,
            &self.event_bus,
        );
        let torrent_bus = self.event_bus.new_torrent_bus(id);
        let choker = Arc::new(Choker::new());

        let rechoke_task = tokio::spawn(rechoke_loop(
            id,
            choker.clone(),
            self.peer_states.clone(),
            self.session_handles.clone(),
            self.choker_config(),
            self.config.rechoke_round,
        ));
        let sparkline_task = tokio::spawn(
            self.registry
                .clone()
                .run_rate_sparkline(self.peer_states.clone(), id),
        );

        TorrentHandle {
            id,
            info_hash,
            assigner: Arc::new(ChunkAssigner::new(lengths, self.config.endgame_replication_factor)),
            choker,
            storage,
            events: torrent_bus,
            rechoke_task,
            sparkline_task,
        }
    }

    pub fn choker_config(&self) -> ChokerConfig {
        ChokerConfig {
            max_upload_slots: self.config.max_upload_slots,
        }
    }

    pub fn is_endgame(&self, torrent: &TorrentHandle) -> bool {
        matches!(
            torrent.assigner.mode(),
            chunk_assigner::AssignerMode::Endgame
        ) || self.registry.mode(torrent.id) == Some(TorrentMode::Endgame)
    }

    /// Dials `addr`, handshakes, and spawns the peer session trio for it. The returned handle's
    /// join result is this session's final outcome; callers that want to react to disconnection
    /// (feeding the peer manager's bad-peer table, say) should await it.
    pub async fn connect_to_peer(
        &self,
        torrent: &TorrentHandle,
        addr: std::net::SocketAddr,
    ) -> anyhow::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
        let stream = listen::connect(addr).await?;
        self.spawn_peer_session(torrent, addr, stream).await
    }

    /// Handshakes an already-accepted inbound connection and spawns its peer session trio.
    pub async fn accept_peer(
        &self,
        torrent: &TorrentHandle,
        stream: tokio::net::TcpStream,
        addr: std::net::SocketAddr,
    ) -> anyhow::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
        self.spawn_peer_session(torrent, addr, stream).await
    }

    async fn spawn_peer_session(
        &self,
        torrent: &TorrentHandle,
        addr: PeerHandle,
        mut stream: tokio::net::TcpStream,
    ) -> anyhow::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
        peer_session::do_handshake(&mut stream, torrent.info_hash, self.our_peer_id).await?;
        self.peer_manager.mark_connected(torrent.id, addr);
        torrent.choker.peer_joined(addr);
        let (read_half, write_half) = stream.into_split();
        let ctx = PeerSessionContext {
            torrent_id: torrent.id,
            peer: addr,
            info_hash: torrent.info_hash,
            lengths: torrent.assigner.lengths(),
            assigner: torrent.assigner.clone(),
            peer_states: self.peer_states.clone(),
            storage: torrent.storage.clone(),
            limits: self.limits.clone(),
            events: torrent.events.clone(),
        };
        let (handle, control_rx) = peer_session::session_channel();
        self.session_handles.insert(torrent.id, addr, handle);

        let session_handles = self.session_handles.clone();
        let peer_manager = self.peer_manager.clone();
        let choker = torrent.choker.clone();
        let torrent_id = torrent.id;
        Ok(tokio::spawn(async move {
            let result = peer_session::run_session(ctx, read_half, write_half, control_rx).await;
            session_handles.remove(torrent_id, addr);
            peer_manager.mark_disconnected(torrent_id, addr);
            choker.peer_left(addr);
            result
        }))
    }
}

/// The cargo version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
