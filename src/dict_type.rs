//! The per-dict vtable and the resize policy.

use crate::dict::entry::EntryRef;

/// Controls whether a [`Dict`][crate::Dict] may move entries between bucket
/// arrays on its own.
///
/// The policy matters to hosts that fork for copy-on-write snapshots: while
/// a child process shares pages with the parent, rewriting large bucket
/// arrays touches (and so copies) all of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Grow at load factor 1, shrink on request. The default.
    #[default]
    Enable,
    /// Do not grow or rehash unless the load factor exceeds the force
    /// ratio, at which point chains are long enough that the copy-on-write
    /// cost is worth paying.
    Avoid,
    /// Never grow (beyond the initial table) and never run rehash steps.
    Forbid,
}

/// The vtable describing how a [`Dict`][crate::Dict] treats its keys and
/// values: how keys hash and compare, whether entries carry values or
/// metadata, and the hooks the host may interpose.
///
/// An instance is stored in the dict at creation and consulted on every
/// operation. Implementations are usually zero-sized or hold only a
/// [`HashSeed`][crate::HashSeed].
pub trait DictType<K, V> {
    /// Arbitrary per-dict state, `Default`-initialized at creation and
    /// reachable through [`Dict::metadata`][crate::Dict::metadata].
    type Metadata: Default;

    /// Per-entry state stored alongside key and value in normal entries,
    /// `Default`-initialized on insert. Must be zero-sized when
    /// [`NO_VALUE`][Self::NO_VALUE] is set (asserted at creation).
    type EntryMetadata: Default;

    /// The dict stores no values. `V` must be zero-sized (asserted at
    /// creation); entry value accessors panic.
    const NO_VALUE: bool = false;

    /// Every key can be stored directly in a bucket slot, with no entry
    /// allocation, whenever it terminates its chain.
    ///
    /// Setting this promises that `K` is a `#[repr(transparent)]` wrapper
    /// around a pointer-sized word whose least significant bit is set for
    /// every live value (odd pointers, odd integers). The dict asserts the
    /// size and alignment half of this at creation and the odd bit on every
    /// insert; the transparent-layout half cannot be checked and storing a
    /// key that violates it is undefined behavior. Only meaningful together
    /// with [`NO_VALUE`][Self::NO_VALUE].
    const KEYS_ARE_ODD: bool = false;

    /// Hashes a key to the 64-bit digest bucket indices are derived from.
    fn hash(&self, key: &K) -> u64;

    /// Key equality. Must agree with [`hash`][Self::hash]: equal keys hash
    /// equal.
    fn key_eq(&self, a: &K, b: &K) -> bool;

    /// Veto hook consulted before an automatic expansion. `required_bytes`
    /// is the size of the bucket array about to be allocated and
    /// `load_factor` the current `used / size` ratio. Returning `false`
    /// skips the expansion (the insert still succeeds); a host under memory
    /// pressure can refuse large allocations this way.
    fn expand_allowed(&self, required_bytes: usize, load_factor: f64) -> bool {
        let _ = (required_bytes, load_factor);
        true
    }

    /// Called after a defrag scan relocates an entry allocation, with a
    /// handle to the entry at its new address. Hosts that keep pointers to
    /// entries (for example through entry metadata) must implement this to
    /// fix them up.
    fn after_replace_entry(&self, entry: &EntryRef<'_, K, V, Self::EntryMetadata>) {
        let _ = entry;
    }
}
