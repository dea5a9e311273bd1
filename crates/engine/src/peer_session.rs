//! Peer session (§4.5): the control/send/receive trio for one connected peer.
//!
//! The receive task only decodes frames and forwards them as [`PeerEvent`]s; the send task
//! only serializes [`WriterRequest`]s onto the socket, applying the upload limiter and updating
//! the send-rate meter on every byte written. Control owns all session state and is the only
//! task that talks to the chunk assigner, peer state table, and storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use core_types::lengths::{Lengths, ValidPieceIndex};
use core_types::peer_id::generate_peer_id;
use peer_protocol::{Handshake, Message, MessageDeserializeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::chunk_assigner::{Assignment, Chunk, ChunkAssigner};
use crate::events::{TorrentEvent, TorrentEventBus, TorrentEventKind};
use crate::limits::Limits;
use crate::peer_state::PeerStateTable;
use crate::storage::TorrentStorage;
use crate::type_aliases::{PeerHandle, TorrentId};

const HANDSHAKE_LEN: usize = 68;
const PIPELINE_DEPTH: usize = 5;
const SNUB_WATCHDOG: Duration = Duration::from_secs(150);
const DEAD_WATCHDOG: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum WriterRequest {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(ValidPieceIndex),
    Bitfield(Vec<u8>),
    Request(Chunk),
    Cancel(Chunk),
    Piece { piece: ValidPieceIndex, offset: u32, data: Vec<u8> },
    KeepAlive,
    Shutdown,
}

#[derive(Clone)]
pub struct PeerSessionHandle {
    pub tx: mpsc::UnboundedSender<WriterRequest>,
}

impl PeerSessionHandle {
    pub fn choke(&self) {
        let _ = self.tx.send(WriterRequest::Choke);
    }

    pub fn unchoke(&self) {
        let _ = self.tx.send(WriterRequest::Unchoke);
    }
}

/// Builds the inbound control channel a session is spawned with: the handle side is kept by
/// whoever spawns the session (so a rechoke pass can reach it later), the receiver side is
/// handed to [`run_session`].
pub fn session_channel() -> (PeerSessionHandle, mpsc::UnboundedReceiver<WriterRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerSessionHandle { tx }, rx)
}

/// Tracks the live [`PeerSessionHandle`] of every connected `(torrent, peer)`, so a rechoke pass
/// can reach sessions it doesn't otherwise hold a reference to. Mirrors the locking shape of
/// [`crate::peer_state::PeerStateTable`]: one `RwLock` over a plain map.
#[derive(Default)]
pub struct PeerSessionTable {
    inner: parking_lot::RwLock<std::collections::HashMap<(TorrentId, PeerHandle), PeerSessionHandle>>,
}

impl PeerSessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, torrent_id: TorrentId, peer: PeerHandle, handle: PeerSessionHandle) {
        self.inner.write().insert((torrent_id, peer), handle);
    }

    pub fn remove(&self, torrent_id: TorrentId, peer: PeerHandle) {
        self.inner.write().remove(&(torrent_id, peer));
    }

    /// Applies a rechoke [`crate::choker::Decision`] by pushing choke/unchoke onto every session
    /// still in the table; a session that already disconnected is silently skipped.
    pub fn apply_decision(&self, torrent_id: TorrentId, decision: &crate::choker::Decision) {
        let g = self.inner.read();
        for peer in &decision.unchoke {
            if let Some(handle) = g.get(&(torrent_id, *peer)) {
                handle.unchoke();
            }
        }
        for peer in &decision.choke {
            if let Some(handle) = g.get(&(torrent_id, *peer)) {
                handle.choke();
            }
        }
    }
}

pub struct PeerSessionContext {
    pub torrent_id: TorrentId,
    pub peer: PeerHandle,
    pub info_hash: core_types::Id20,
    pub lengths: Lengths,
    pub assigner: Arc<ChunkAssigner>,
    pub peer_states: Arc<PeerStateTable>,
    pub storage: Arc<dyn TorrentStorage>,
    pub limits: Arc<Limits>,
    pub events: TorrentEventBus,
}

/// Performs the handshake on a freshly accepted or connected socket. Returns the remote peer id
/// and the negotiated capability set (bitwise OR of both sides' reserved bytes, per §4.4).
pub async fn do_handshake<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    socket: &mut S,
    info_hash: core_types::Id20,
    our_peer_id: core_types::Id20,
) -> anyhow::Result<(core_types::Id20, u64)> {
    let ours = Handshake::new(info_hash, our_peer_id);
    let mut buf = [0u8; HANDSHAKE_LEN];
    let _ = ours.serialize_unchecked_len(&mut buf);
    socket.write_all(&buf).await.context("writing handshake")?;

    let mut theirs_buf = [0u8; HANDSHAKE_LEN];
    timeout(Duration::from_secs(10), socket.read_exact(&mut theirs_buf))
        .await
        .context("handshake timed out")?
        .context("reading handshake")?;
    let (theirs, _) = Handshake::deserialize(&theirs_buf).context("bad handshake")?;
    if theirs.info_hash != info_hash {
        anyhow::bail!("wrong info hash");
    }
    let capabilities = Handshake::combined_capabilities(ours.reserved, theirs.reserved);
    Ok((theirs.peer_id, capabilities))
}

/// Runs the control loop for one already-handshaken peer until it disconnects or errors.
/// `read_half`/`write_half` are the two directions of the same socket; they're driven by the
/// receive and send tasks respectively, with control bridging the two via channels.
/// `control_rx` is the receiving end of this session's [`PeerSessionHandle`]: a rechoke pass
/// elsewhere in the process pushes `Choke`/`Unchoke` onto it to flip this session's upload gate.
pub async fn run_session<R, W>(
    ctx: PeerSessionContext,
    read_half: R,
    write_half: W,
    mut control_rx: mpsc::UnboundedReceiver<WriterRequest>,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<WriterRequest>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PeerEvent>();
    let mut torrent_events = ctx.events.subscribe();

    let send_task = tokio::spawn(send_loop(write_half, writer_rx, ctx.limits.clone()));
    let recv_task = tokio::spawn(receive_loop(
        read_half,
        event_tx,
        ctx.lengths,
        ctx.limits.clone(),
    ));

    ctx.peer_states.insert(ctx.torrent_id, ctx.peer);
    let mut we_choke_them = true;
    let mut we_interest_them = false;
    let mut they_choke_us = true;
    let mut outstanding: usize = 0;

    let result: anyhow::Result<()> = async {
        loop {
            let event = tokio::select! {
                biased;

                ev = torrent_events.recv() => {
                    match ev {
                        Ok(TorrentEvent { kind: TorrentEventKind::PieceComplete(piece), .. }) => {
                            if let Some(pi) = ctx.lengths.validate_piece_index(piece) {
                                let _ = writer_tx.send(WriterRequest::Have(pi));
                            }
                            continue;
                        }
                        Ok(TorrentEvent { kind: TorrentEventKind::CancelChunk { target, chunk }, .. })
                            if target == ctx.peer =>
                        {
                            let _ = writer_tx.send(WriterRequest::Cancel(chunk));
                            continue;
                        }
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => continue,
                    }
                }

                req = control_rx.recv() => {
                    match req {
                        Some(WriterRequest::Choke) => {
                            we_choke_them = true;
                            ctx.peer_states.set_local_choke(ctx.torrent_id, ctx.peer, true);
                            let _ = writer_tx.send(WriterRequest::Choke);
                        }
                        Some(WriterRequest::Unchoke) => {
                            we_choke_them = false;
                            ctx.peer_states.set_local_choke(ctx.torrent_id, ctx.peer, false);
                            let _ = writer_tx.send(WriterRequest::Unchoke);
                        }
                        _ => {}
                    }
                    continue;
                }

                ev = async {
                    match timeout(SNUB_WATCHDOG, event_rx.recv()).await {
                        Ok(Some(ev)) => Ok(ev),
                        Ok(None) => Err(None),
                        Err(_) => {
                            let _ = writer_tx.send(WriterRequest::KeepAlive);
                            match timeout(DEAD_WATCHDOG, event_rx.recv()).await {
                                Ok(Some(ev)) => Ok(ev),
                                _ => Err(Some(anyhow::anyhow!("peer silent past watchdog"))),
                            }
                        }
                    }
                } => {
                    match ev {
                        Ok(ev) => ev,
                        Err(None) => break,
                        Err(Some(e)) => return Err(e),
                    }
                }
            };

            match event {
                PeerEvent::Bitfield(bytes) => {
                    for idx in 0..ctx.lengths.total_pieces() {
                        if bitfield_bit(&bytes, idx) {
                            if let Some(pi) = ctx.lengths.validate_piece_index(idx) {
                                ctx.assigner.peer_has_piece(pi);
                            }
                        }
                    }
                    if !we_interest_them {
                        we_interest_them = true;
                        let _ = writer_tx.send(WriterRequest::Interested);
                    }
                }
                PeerEvent::Have(piece) => {
                    ctx.assigner.peer_has_piece(piece);
                    if !we_interest_them {
                        we_interest_them = true;
                        let _ = writer_tx.send(WriterRequest::Interested);
                    }
                }
                PeerEvent::Choke => they_choke_us = true,
                PeerEvent::Unchoke => they_choke_us = false,
                PeerEvent::Interested => {
                    ctx.peer_states
                        .with_mut(ctx.torrent_id, ctx.peer, |f| f.remote_interest = true);
                }
                PeerEvent::NotInterested => {
                    ctx.peer_states
                        .with_mut(ctx.torrent_id, ctx.peer, |f| f.remote_interest = false);
                }
                PeerEvent::Piece { piece, offset, data } => {
                    let length = data.len() as u32;
                    ctx.assigner.fetched(piece, offset);
                    ctx.peer_states.with_mut(ctx.torrent_id, ctx.peer, |f| {
                        f.note_piece_received(length as u64, Instant::now())
                    });
                    let file_id = 0; // single-collaborator placeholder; real mapping comes from metadata.
                    let abs_offset = ctx.lengths.piece_offset(piece) + offset as u64;
                    ctx.storage.pwrite_all(file_id, abs_offset, &data)?;
                    outstanding = outstanding.saturating_sub(1);
                    let outcome = ctx.assigner.stored(piece, offset, ctx.peer);
                    let chunk = Chunk { piece, offset, length };
                    for other in outcome.cancel_peers {
                        ctx.events.cancel_chunk(other, chunk);
                    }
                    if outcome.piece_complete {
                        ctx.storage.on_piece_completed(piece)?;
                        ctx.events.piece_complete(piece.get());
                    }
                }
                PeerEvent::Request(chunk) => {
                    if !we_choke_them {
                        let file_id = 0; // single-collaborator placeholder; real mapping comes from metadata.
                        let abs_offset = ctx.lengths.piece_offset(chunk.piece) + chunk.offset as u64;
                        let mut data = vec![0u8; chunk.length as usize];
                        ctx.storage.pread_exact(file_id, abs_offset, &mut data)?;
                        let _ = writer_tx.send(WriterRequest::Piece {
                            piece: chunk.piece,
                            offset: chunk.offset,
                            data,
                        });
                    }
                }
                PeerEvent::Cancel(_chunk) => {
                    // handled by the send task's queue filtering; nothing to do here.
                }
                PeerEvent::Disconnected => break,
            }

            if !they_choke_us && we_interest_them && outstanding < PIPELINE_DEPTH {
                let want = PIPELINE_DEPTH - outstanding;
                let assignment = ctx.assigner.request(want, &|_| true, ctx.peer);
                if let Assignment::Chunks { chunks, .. } = assignment {
                    for c in chunks {
                        outstanding += 1;
                        let _ = writer_tx.send(WriterRequest::Request(c));
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    ctx.assigner.dropped(ctx.peer);
    ctx.peer_states.remove(ctx.torrent_id, ctx.peer);
    let _ = writer_tx.send(WriterRequest::Shutdown);
    recv_task.abort();
    let _ = send_task.await;

    result
}

#[derive(Debug)]
enum PeerEvent {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(ValidPieceIndex),
    Bitfield(Vec<u8>),
    Request(Chunk),
    Piece { piece: ValidPieceIndex, offset: u32, data: Vec<u8> },
    Cancel(Chunk),
    Disconnected,
}

async fn send_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut write_half: W,
    mut rx: mpsc::UnboundedReceiver<WriterRequest>,
    limits: Arc<Limits>,
) -> anyhow::Result<()> {
    while let Some(req) = rx.recv().await {
        let mut buf = vec![0u8; 17 + 16384];
        let msg = match &req {
            WriterRequest::Shutdown => break,
            WriterRequest::Choke => Message::Choke,
            WriterRequest::Unchoke => Message::Unchoke,
            WriterRequest::Interested => Message::Interested,
            WriterRequest::NotInterested => Message::NotInterested,
            WriterRequest::Have(p) => Message::Have(p.get()),
            WriterRequest::KeepAlive => Message::KeepAlive,
            WriterRequest::Bitfield(bytes) => Message::Bitfield(bytes.as_slice().into()),
            WriterRequest::Request(c) => Message::Request(peer_protocol::Request {
                index: c.piece.get(),
                begin: c.offset,
                length: c.length,
            }),
            WriterRequest::Cancel(c) => Message::Cancel(peer_protocol::Request {
                index: c.piece.get(),
                begin: c.offset,
                length: c.length,
            }),
            WriterRequest::Piece { piece, offset, data } => {
                Message::Piece(peer_protocol::Piece::from_data(piece.get(), *offset, data.as_slice()))
            }
        };
        let len = msg.serialize(&mut buf).context("serializing outgoing message")?;
        if let Ok(n) = std::num::NonZeroU32::try_from(len as u32) {
            limits.prepare_for_upload(n).await.ok();
        }
        write_half
            .write_all(&buf[..len])
            .await
            .context("writing message")?;
    }
    Ok(())
}

async fn receive_loop<R: tokio::io::AsyncRead + Unpin>(
    mut read_half: R,
    events: mpsc::UnboundedSender<PeerEvent>,
    lengths: Lengths,
    limits: Arc<Limits>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 17 + 16384];
    let mut filled = 0usize;
    loop {
        let n = read_half.read(&mut buf[filled..]).await?;
        if n == 0 {
            let _ = events.send(PeerEvent::Disconnected);
            return Ok(());
        }
        filled += n;
        loop {
            match Message::deserialize(&buf[..filled]) {
                Ok((msg, consumed)) => {
                    if let Ok(nz) = std::num::NonZeroU32::try_from(consumed as u32) {
                        limits.prepare_for_download(nz).await.ok();
                    }
                    let ev = match msg {
                        Message::Choke => Some(PeerEvent::Choke),
                        Message::Unchoke => Some(PeerEvent::Unchoke),
                        Message::Interested => Some(PeerEvent::Interested),
                        Message::NotInterested => Some(PeerEvent::NotInterested),
                        Message::Have(p) => lengths.validate_piece_index(p).map(PeerEvent::Have),
                        Message::Bitfield(bits) => {
                            Some(PeerEvent::Bitfield(bits.as_ref().to_vec()))
                        }
                        Message::KeepAlive => None,
                        Message::Request(r) => lengths.validate_piece_index(r.index).map(|p| {
                            PeerEvent::Request(Chunk {
                                piece: p,
                                offset: r.begin,
                                length: r.length,
                            })
                        }),
                        Message::Cancel(r) => lengths.validate_piece_index(r.index).map(|p| {
                            PeerEvent::Cancel(Chunk {
                                piece: p,
                                offset: r.begin,
                                length: r.length,
                            })
                        }),
                        Message::Piece(p) => {
                            let offset = p.begin;
                            let data = p.data().to_vec();
                            lengths
                                .validate_piece_index(p.index)
                                .map(|pi| PeerEvent::Piece { piece: pi, offset, data })
                        }
                    };
                    if let Some(ev) = ev {
                        if events.send(ev).is_err() {
                            return Ok(());
                        }
                    }
                    buf.copy_within(consumed..filled, 0);
                    filled -= consumed;
                }
                Err(MessageDeserializeError::NotEnoughData(_, _)) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub fn our_peer_id() -> core_types::Id20 {
    generate_peer_id()
}

/// `Msb0`-ordered bitfield bit test, matching [`crate::type_aliases::BF`]'s bit order.
fn bitfield_bit(bytes: &[u8], piece_index: u32) -> bool {
    let byte_idx = (piece_index / 8) as usize;
    let bit = 7 - (piece_index % 8);
    bytes
        .get(byte_idx)
        .is_some_and(|b| (b >> bit) & 1 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEventBus;
    use crate::limits::LimitsConfig;
    use crate::storage::test_util::InMemoryStorage;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn peer(n: u16) -> PeerHandle {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, n))
    }

    fn info_hash() -> core_types::Id20 {
        core_types::Id20::new([0u8; 20])
    }

    /// Assembles a length-prefixed wire frame by hand rather than pulling in `peer_protocol`'s
    /// `Message`/`ByteBuf` types, which would need `buffers` as a test-only dependency this crate
    /// otherwise has no use for.
    fn frame(msg_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + payload.len());
        out.extend_from_slice(&((payload.len() as u32) + 1).to_be_bytes());
        out.push(msg_id);
        out.extend_from_slice(payload);
        out
    }

    async fn read_frame<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        if len > 0 {
            stream.read_exact(&mut body).await.unwrap();
        }
        body
    }

    /// Keeps reading frames until one with `want_id` shows up, discarding the rest (a session
    /// may interleave `interested`/keepalive frames with the ones a test cares about).
    async fn read_frame_of<S: tokio::io::AsyncRead + Unpin>(stream: &mut S, want_id: u8) -> Vec<u8> {
        loop {
            let body = timeout(Duration::from_secs(5), read_frame(stream))
                .await
                .expect("timed out waiting for expected frame");
            if body.first() == Some(&want_id) {
                return body;
            }
        }
    }

    struct Harness {
        assigner: Arc<ChunkAssigner>,
        peer_states: Arc<PeerStateTable>,
        storage: Arc<InMemoryStorage>,
        limits: Arc<Limits>,
        event_bus: SessionEventBus,
    }

    impl Harness {
        fn new(lengths: Lengths) -> Self {
            Self {
                assigner: Arc::new(ChunkAssigner::new(lengths, 2)),
                peer_states: Arc::new(PeerStateTable::new()),
                storage: Arc::new(InMemoryStorage::default()),
                limits: Arc::new(Limits::new(LimitsConfig::default())),
                event_bus: SessionEventBus::new(),
            }
        }

        fn ctx(&self, lengths: Lengths, peer_addr: PeerHandle) -> PeerSessionContext {
            PeerSessionContext {
                torrent_id: 1,
                peer: peer_addr,
                info_hash: info_hash(),
                lengths,
                assigner: self.assigner.clone(),
                peer_states: self.peer_states.clone(),
                storage: self.storage.clone() as Arc<dyn TorrentStorage>,
                limits: self.limits.clone(),
                events: self.event_bus.new_torrent_bus(1),
            }
        }
    }

    /// E1: a bitfield announcing pieces we want makes the session declare interest.
    #[tokio::test]
    async fn bitfield_triggers_interested() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let h = Harness::new(lengths);
        let (mut test_side, sess_side) = tokio::io::duplex(1 << 16);
        let (read_half, write_half) = tokio::io::split(sess_side);
        let ctx = h.ctx(lengths, peer(1));
        let (_handle, control_rx) = session_channel();
        tokio::spawn(run_session(ctx, read_half, write_half, control_rx));

        test_side
            .write_all(&frame(5, &[0b1000_0000]))
            .await
            .unwrap();

        let body = read_frame_of(&mut test_side, 2).await;
        assert_eq!(body, vec![2]);
    }

    /// E2: once unchoked and interested, the session pipelines exactly one request per
    /// available chunk up to the pipeline depth.
    #[tokio::test]
    async fn unchoke_triggers_pipelined_requests() {
        // 5 pieces of one chunk each so the single-piece pipeline depth (5) is fully exercised.
        let lengths = Lengths::new(16384 * 5, 16384).unwrap();
        let h = Harness::new(lengths);
        let (mut test_side, sess_side) = tokio::io::duplex(1 << 16);
        let (read_half, write_half) = tokio::io::split(sess_side);
        let ctx = h.ctx(lengths, peer(1));
        let (_handle, control_rx) = session_channel();
        tokio::spawn(run_session(ctx, read_half, write_half, control_rx));

        test_side.write_all(&frame(5, &[0b1111_1000])).await.unwrap();
        let _ = read_frame_of(&mut test_side, 2).await; // interested
        test_side.write_all(&frame(1, &[])).await.unwrap(); // unchoke

        let mut seen_pieces = std::collections::HashSet::new();
        for _ in 0..PIPELINE_DEPTH {
            let body = read_frame_of(&mut test_side, 6).await;
            let index = u32::from_be_bytes(body[1..5].try_into().unwrap());
            seen_pieces.insert(index);
        }
        assert_eq!(seen_pieces.len(), PIPELINE_DEPTH);
    }

    /// E3: when one session completes a piece, every other session of the same torrent is
    /// handed a `have` for it, even though it talked to a different remote peer entirely.
    #[tokio::test]
    async fn piece_completion_broadcasts_have_to_sibling_session() {
        let lengths = Lengths::new(16384 * 2, 16384).unwrap();
        let h = Harness::new(lengths);

        let (mut test_a, sess_a) = tokio::io::duplex(1 << 16);
        let (read_a, write_a) = tokio::io::split(sess_a);
        let (_handle_a, control_rx_a) = session_channel();
        tokio::spawn(run_session(h.ctx(lengths, peer(1)), read_a, write_a, control_rx_a));

        let (mut test_b, sess_b) = tokio::io::duplex(1 << 16);
        let (read_b, write_b) = tokio::io::split(sess_b);
        let (_handle_b, control_rx_b) = session_channel();
        tokio::spawn(run_session(h.ctx(lengths, peer(2)), read_b, write_b, control_rx_b));

        test_a
            .write_all(&frame(5, &[0b1100_0000]))
            .await
            .unwrap();
        let _ = read_frame_of(&mut test_a, 2).await; // interested
        test_a.write_all(&frame(1, &[])).await.unwrap(); // unchoke

        let req = read_frame_of(&mut test_a, 6).await;
        let piece_index = u32::from_be_bytes(req[1..5].try_into().unwrap());

        let mut piece_payload = Vec::new();
        piece_payload.extend_from_slice(&piece_index.to_be_bytes());
        piece_payload.extend_from_slice(&0u32.to_be_bytes());
        piece_payload.extend_from_slice(&[0xAB; 16384]);
        test_a.write_all(&frame(7, &piece_payload)).await.unwrap();

        let have = read_frame_of(&mut test_b, 4).await;
        assert_eq!(
            u32::from_be_bytes(have[1..5].try_into().unwrap()),
            piece_index
        );
    }

    /// A session starts choking its peer, so an incoming `request` is ignored until the control
    /// channel delivers an `unchoke`; once unchoked, the reply carries the real storage bytes
    /// rather than a placeholder.
    #[tokio::test]
    async fn unchoke_via_control_channel_serves_real_storage_bytes() {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let h = Harness::new(lengths);
        h.storage.pwrite_all(0, 0, &[0xCD; 16384]).unwrap();

        let (mut test_side, sess_side) = tokio::io::duplex(1 << 16);
        let (read_half, write_half) = tokio::io::split(sess_side);
        let ctx = h.ctx(lengths, peer(1));
        let (handle, control_rx) = session_channel();
        tokio::spawn(run_session(ctx, read_half, write_half, control_rx));

        let mut req_payload = Vec::new();
        req_payload.extend_from_slice(&0u32.to_be_bytes());
        req_payload.extend_from_slice(&0u32.to_be_bytes());
        req_payload.extend_from_slice(&16384u32.to_be_bytes());

        // still choked: this request must go unanswered.
        test_side.write_all(&frame(6, &req_payload)).await.unwrap();

        handle.unchoke();
        test_side.write_all(&frame(6, &req_payload)).await.unwrap();

        let body = read_frame_of(&mut test_side, 7).await;
        assert_eq!(&body[9..], &[0xCD; 16384][..]);
    }
}
