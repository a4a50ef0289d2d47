//! Keyframe-aware write caching.

pub mod ring;
pub mod write_cache;

pub use ring::RingBuffer;
pub use write_cache::{WriteCache, WriteCacheConfig};
