pub mod compact_ip;
pub mod constants;
mod error;
pub mod group;
pub mod hash_id;
pub mod info_hash;
pub mod lengths;
pub mod peer_id;
pub mod rate_meter;
pub mod spawn_utils;

pub use hash_id::{Id20, Id32};

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
