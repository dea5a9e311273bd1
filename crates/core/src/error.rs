#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("torrent with 0 length is useless")]
    ZeroLengthTorrent,
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),
    #[error("invalid chunk: piece={piece}, offset={offset}, length={length}")]
    InvalidChunk {
        piece: u32,
        offset: u32,
        length: u32,
    },
}
