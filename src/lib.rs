#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! An incrementally-rehashed chained hash table: the central index
//! primitive of an in-memory key/value store.
//!
//! The interesting part of [`Dict`] is not that it maps keys to values but
//! *how* it resizes. A resize never happens in one go: the dict keeps two
//! bucket arrays and migrates chains from the old one to the new one a
//! bucket at a time, either a step per lookup/insert/delete or in
//! explicitly bounded batches ([`Dict::rehash_steps`],
//! [`Dict::rehash_ms`]). No call ever stalls on a full-table rehash, and
//! hosts that fork for copy-on-write snapshots can dial migration down
//! ([`ResizePolicy::Avoid`]) so shared pages stay untouched.
//!
//! On top of that sit a stateless full-table [scan][Dict::scan] driven by
//! a reverse-binary cursor (it tolerates the table growing or shrinking
//! between calls and still visits every long-lived entry), randomized
//! [sampling][Dict::random_entry] for eviction-style workloads, and
//! paused-rehash [iteration][DictIterator].
//!
//! Keys and values are opaque to the dict. A [`DictType`] supplied at
//! creation provides hashing and equality (typically seeded SipHash-2-4
//! through [`hash::gen_hash`]) along with optional hooks: an allocation
//! veto, metadata regions, and compact no-value storage for set-like use.
//!
//! # Example
//!
//! ```
//! use kagi::{Dict, DictType, HashSeed};
//!
//! struct Strings {
//!     seed: HashSeed,
//! }
//!
//! impl DictType<String, u64> for Strings {
//!     type Metadata = ();
//!     type EntryMetadata = ();
//!
//!     fn hash(&self, key: &String) -> u64 {
//!         kagi::hash::gen_hash(&self.seed, key.as_bytes())
//!     }
//!
//!     fn key_eq(&self, a: &String, b: &String) -> bool {
//!         a == b
//!     }
//! }
//!
//! let mut dict = Dict::new(Strings {
//!     seed: HashSeed::random(),
//! });
//!
//! dict.insert("apple".to_string(), 1)?;
//! dict.insert("banana".to_string(), 2)?;
//! assert_eq!(dict.get(&"banana".to_string()), Some(&2));
//!
//! dict.remove(&"apple".to_string())?;
//! assert_eq!(dict.len(), 1);
//! # Ok::<(), kagi::Error>(())
//! ```
//!
//! A `Dict` is single-threaded by design: every operation takes
//! `&mut self` (lookups included, since they may perform a rehash step) and
//! callers serialize access. There is no internal locking and no
//! operation blocks.

mod dict;
mod dict_type;
mod error;
pub mod hash;

pub use dict::entry::{DetachedEntry, EntryMut, EntryRef};
pub use dict::iter::DictIterator;
pub use dict::{
    DefragFns, Dict, InsertPosition, InsertSlot, Stats, TableStats, TwoPhaseUnlink,
    FORCE_RESIZE_RATIO, INITIAL_SIZE, STATS_HISTOGRAM_LEN,
};
pub use dict_type::{DictType, ResizePolicy};
pub use error::{Error, Result};
pub use hash::HashSeed;
