//! Wire-level constants shared across the engine.

/// Maximum size of a single requested chunk, per convention (BEP-3).
pub const CHUNK_SIZE: u32 = 16384;
