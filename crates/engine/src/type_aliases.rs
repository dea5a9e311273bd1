use std::net::SocketAddr;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub type PeerHandle = SocketAddr;

/// Monotonically assigned per-process torrent identifier.
pub type TorrentId = u64;

pub type PieceIndex = u32;
