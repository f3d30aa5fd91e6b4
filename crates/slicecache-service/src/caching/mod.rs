//! The in-memory frame cache.
//!
//! The [`CacheStore`] keeps decoded (or still compressed) frame payloads up to a fixed memory
//! budget. When a new payload does not fit, the [`EvictionScorer`] decides which entries have to
//! go: entries that have been idle for a long time, that are rarely read, that are large, and
//! that are far away from the slice currently viewed are evicted first.
//!
//! Payloads are [`Bytes`](bytes::Bytes), so an entry handed out to a caller stays valid even if it
//! is evicted right after.

mod scorer;
mod store;


pub use scorer::{EntryStats, EvictionPolicy, EvictionScorer, ScoreWeights};
pub use store::{CacheEntry, CacheStore, EntryOptions, StoreStats};
