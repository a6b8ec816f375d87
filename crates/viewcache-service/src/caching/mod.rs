//! # Image caching infrastructure
//!
//! A viewer has to show an image the moment it is requested, and it has to go back and forth
//! between recently viewed images without decoding them again. This module contains the caches
//! that make this possible, the [`ImageRecord`] they hold, and the central [`LoadError`] type.
//!
//! ## Cache Layers
//!
//! - The [`Cache`] is a bounded in-memory store of decoded records. It deduplicates concurrent
//!   loads of the same key, and evicts records based on how often they are accessed compared to
//!   their peers.
//! - The [`RaceLoader`] sits in front of a [`Cache`] and fills it by racing a fast, low fidelity
//!   loader against the slow full image loader. The first result is cached and shown right away,
//!   a quick record is later replaced by the full one.
//!
//! Nothing is persisted. Sidecar thumbnails are produced elsewhere and only read by the
//! [`QuickImageLoader`](crate::loaders::QuickImageLoader).
//!
//! A request goes through the following steps:
//! - The key becomes the most recently requested one.
//! - A cached record is returned directly.
//! - If the key is being loaded already, the request waits for that load.
//! - Otherwise both loaders are started, and the first record is stored, returned and sent to the
//!   receiver.
//! - If the quick record was first, the full record replaces it later and is sent to the receiver
//!   again.
//!
//! ### Eviction
//!
//! Each record has a score that starts at `0`. Every successful access raises the score of the
//! accessed record by one and lowers the score of every other resident record by one. When a new
//! key is inserted into a full cache, the record with the lowest score is evicted, the oldest one
//! in case of a tie. Replacing a record does not change any scores.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served from memory.
//! - `caches.channel.hit`: Accesses that joined a running load.
//! - `caches.channel.miss`: Accesses that started a load.
//! - `caches.computation`: Loads being run.
//! - `caches.eviction`: Evicted records.
//! - `caches.replace`: Replaced records.
//! - `race.winner`: Finished races, tagged with the winning `loader`.
//! - `race.discarded`: Quick records that lost a race.
//! - `race.background.failure`: Full loads that failed after a quick record was shown.
//! - `receiver.notify` / `receiver.suppressed`: Records sent to or held back from the receiver.

mod cache_error;
mod memory;
mod record;
mod two_step;

pub use cache_error::{LoadError, LoadResult};
pub use memory::{Cache, CacheIndex, CacheLoader};
pub use record::{DecodedImage, Fidelity, ImageKey, ImageRecord, Rgb};
pub use two_step::RaceLoader;

#[cfg(test)]
mod tests;
