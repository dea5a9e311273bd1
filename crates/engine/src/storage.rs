//! The file I/O collaborator interface.
//!
//! On-disk layout, file checking, and readback are out of scope for this crate; a torrent's
//! storage is whatever implements [`TorrentStorage`] and is handed to the session at
//! construction time. The chunk assigner and peer sessions only ever see this trait.

use std::path::Path;

use core_types::lengths::ValidPieceIndex;

/// Builds a [`TorrentStorage`] for a torrent once its metadata is known.
pub trait StorageFactory: Send + Sync {
    fn init_storage(&self, info_hash: &core_types::Id20) -> anyhow::Result<Box<dyn TorrentStorage>>;
}

/// Durable storage for one torrent's files, addressed by `file_id` (index into the torrent's
/// file list) and a byte offset within that file.
pub trait TorrentStorage: Send + Sync {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()>;

    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()>;

    fn remove_file(&self, file_id: usize, filename: &Path) -> anyhow::Result<()>;

    /// Called once a piece's chunks are all stored and the piece hash has verified.
    /// Default implementation does nothing.
    fn on_piece_completed(&self, _piece_index: ValidPieceIndex) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<U: TorrentStorage + ?Sized> TorrentStorage for Box<U> {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        (**self).pread_exact(file_id, offset, buf)
    }

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        (**self).pwrite_all(file_id, offset, buf)
    }

    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()> {
        (**self).ensure_file_length(file_id, length)
    }

    fn remove_file(&self, file_id: usize, filename: &Path) -> anyhow::Result<()> {
        (**self).remove_file(file_id, filename)
    }

    fn on_piece_completed(&self, piece_index: ValidPieceIndex) -> anyhow::Result<()> {
        (**self).on_piece_completed(piece_index)
    }
}
