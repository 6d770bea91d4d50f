//! The dict core: table pair, hot path, growth policy, incremental rehash
//! engine, and random sampling.

pub(crate) mod entry;
pub(crate) mod iter;
mod random;
mod scan;
mod stats;

use std::marker::PhantomData;
use std::mem;

use quanta::Clock;
use rand::{rngs::SmallRng, SeedableRng};

use crate::dict_type::{DictType, ResizePolicy};
use crate::error::{Error, Result};
use entry::{DetachedEntry, EntryMut, EntryRef, Link};

pub use scan::DefragFns;
pub use stats::{Stats, TableStats, STATS_HISTOGRAM_LEN};

/// Size of the first allocated bucket array.
pub const INITIAL_SIZE: usize = 4;
const INITIAL_EXP: i8 = 2;

/// Load factor past which a grow is forced even under
/// [`ResizePolicy::Avoid`].
pub const FORCE_RESIZE_RATIO: usize = 5;

/// One half of the table pair: a bucket array sized `2^size_exp`
/// (`size_exp == -1` means not allocated) and its live-entry count.
struct Ht {
    table: Option<Box<[Link]>>,
    size_exp: i8,
    used: usize,
}

impl Ht {
    fn new() -> Self {
        Self {
            table: None,
            size_exp: -1,
            used: 0,
        }
    }

    #[inline]
    fn size(&self) -> usize {
        if self.size_exp < 0 {
            0
        } else {
            1usize << self.size_exp
        }
    }

    #[inline]
    fn mask(&self) -> u64 {
        if self.size_exp < 0 {
            0
        } else {
            (1u64 << self.size_exp) - 1
        }
    }
}

/// An in-memory hash table mapping keys to values, with chained buckets,
/// incremental rehashing, randomized sampling, and a resize-tolerant scan.
///
/// A `Dict` owns two bucket arrays. Normally only the first is allocated;
/// while an incremental rehash is in progress both exist and entries
/// migrate from the first to the second a bucket at a time, driven either
/// by explicit [`rehash_steps`][Dict::rehash_steps] /
/// [`rehash_ms`][Dict::rehash_ms] calls or opportunistically by each
/// lookup, insert, and delete. No single operation ever migrates more than
/// a bounded amount, which keeps individual calls cheap and leaves memory
/// pages untouched for hosts that fork for copy-on-write snapshots.
///
/// All behavior that depends on the key and value types (hashing,
/// equality, the expand veto, metadata) is supplied by a [`DictType`]
/// given at creation.
///
/// A `Dict` is single-threaded: it is `Send` when its contents are, but
/// has no interior synchronization, and every operation takes `&mut self`
/// (lookups too, because they may perform a rehash step).
pub struct Dict<K, V, T>
where
    T: DictType<K, V>,
{
    ty: T,
    metadata: T::Metadata,
    ht: [Ht; 2],
    /// Next bucket of `ht[0]` to migrate; -1 when not rehashing.
    rehash_idx: i64,
    /// While positive, lookups and updates skip their opportunistic
    /// rehash step.
    pause_rehash: u32,
    policy: ResizePolicy,
    rng: SmallRng,
    clock: Clock,
    _marker: PhantomData<(K, V)>,
}

/// A vacant insert position produced by
/// [`Dict::find_position_for_insert`]. Must be consumed by
/// [`Dict::insert_at_position`] before any other dict operation.
pub struct InsertSlot {
    idx: usize,
}

/// Outcome of [`Dict::find_position_for_insert`].
pub enum InsertPosition<'d, K, V, M = ()> {
    /// The key is absent; the slot names the bucket the entry belongs in.
    Vacant(InsertSlot),
    /// An entry with an equal key already exists.
    Occupied(EntryRef<'d, K, V, M>),
}

//
// public
//
impl<K, V, T> Dict<K, V, T>
where
    T: DictType<K, V>,
{
    /// Creates an empty dict with the default (enabled) resize policy.
    ///
    /// No bucket array is allocated until the first insert.
    pub fn new(ty: T) -> Self {
        Self::with_resize_policy(ty, ResizePolicy::default())
    }

    /// Creates an empty dict with an explicit resize policy.
    ///
    /// # Panics
    ///
    /// Panics when the type's flags are inconsistent: `NO_VALUE` with a
    /// non-zero-sized `V` or entry metadata, or `KEYS_ARE_ODD` without
    /// `NO_VALUE` or with a key type that is not pointer-sized.
    pub fn with_resize_policy(ty: T, policy: ResizePolicy) -> Self {
        if T::NO_VALUE {
            assert_eq!(
                mem::size_of::<V>(),
                0,
                "a no-value dict cannot store values"
            );
            assert_eq!(
                mem::size_of::<T::EntryMetadata>(),
                0,
                "entry metadata and no-value are mutually exclusive"
            );
        }
        if T::KEYS_ARE_ODD {
            assert!(T::NO_VALUE, "KEYS_ARE_ODD requires NO_VALUE");
            entry::assert_word_key_layout::<K>();
        }
        Self {
            ty,
            metadata: T::Metadata::default(),
            ht: [Ht::new(), Ht::new()],
            rehash_idx: -1,
            pause_rehash: 0,
            policy,
            rng: SmallRng::from_entropy(),
            clock: Clock::new(),
            _marker: PhantomData,
        }
    }

    /// Number of entries stored, across both tables.
    pub fn len(&self) -> usize {
        self.ht[0].used + self.ht[1].used
    }

    /// Whether the dict stores no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets, across both tables.
    pub fn slots(&self) -> usize {
        self.ht[0].size() + self.ht[1].size()
    }

    /// Whether an incremental rehash is in progress.
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    /// The resize policy currently in effect.
    pub fn resize_policy(&self) -> ResizePolicy {
        self.policy
    }

    /// Changes the resize policy. Hosts flip this to
    /// [`ResizePolicy::Avoid`] while a copy-on-write snapshot child is
    /// alive and back afterwards.
    pub fn set_resize_policy(&mut self, policy: ResizePolicy) {
        self.policy = policy;
    }

    /// The type vtable this dict was created with.
    pub fn dict_type(&self) -> &T {
        &self.ty
    }

    /// The dict-level metadata region.
    pub fn metadata(&self) -> &T::Metadata {
        &self.metadata
    }

    /// Mutable access to the dict-level metadata region.
    pub fn metadata_mut(&mut self) -> &mut T::Metadata {
        &mut self.metadata
    }

    /// The hash of `key` under this dict's type.
    pub fn hash_key(&self, key: &K) -> u64 {
        self.ty.hash(key)
    }

    /// Approximate memory used by the dict itself, excluding keys and
    /// values that own further allocations.
    pub fn mem_usage(&self) -> usize {
        self.len() * mem::size_of::<entry::FullEntry<K, V, T::EntryMetadata>>()
            + self.slots() * mem::size_of::<Link>()
    }

    /// Looks up `key`, returning a handle to its entry.
    ///
    /// Performs one opportunistic rehash step when a rehash is in progress
    /// and not paused.
    pub fn find(&mut self, key: &K) -> Option<EntryRef<'_, K, V, T::EntryMetadata>> {
        self.find_link(key).map(EntryRef::new)
    }

    /// Looks up `key`, returning an exclusive handle to its entry.
    pub fn find_mut(&mut self, key: &K) -> Option<EntryMut<'_, K, V, T::EntryMetadata>> {
        self.find_link(key).map(EntryMut::new)
    }

    /// Looks up `key` and returns a reference to its value.
    ///
    /// # Panics
    ///
    /// Panics on a no-value dict; use [`contains_key`][Dict::contains_key].
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let link = self.find_link(key)?;
        assert!(link.is_normal(), "value access on a no-value dict");
        Some(unsafe { &(*entry::full_ptr::<K, V, T::EntryMetadata>(link)).val })
    }

    /// Whether an entry with an equal key is stored.
    pub fn contains_key(&mut self, key: &K) -> bool {
        self.find_link(key).is_some()
    }

    /// Inserts a new entry. Fails with [`Error::AlreadyExists`] when an
    /// entry with an equal key is present, in which case the rejected key
    /// and value are dropped.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        match self.find_position_for_insert(&key)? {
            InsertPosition::Vacant(slot) => {
                self.insert_at_position(key, value, slot);
                Ok(())
            }
            InsertPosition::Occupied(_) => Err(Error::AlreadyExists),
        }
    }

    /// Like [`insert`][Dict::insert], but any bucket-array allocation it
    /// triggers reports failure as [`Error::AllocationFailed`] instead of
    /// aborting the process.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<()> {
        if !self.is_rehashing() {
            if self.ht[0].size() == 0 {
                self.try_expand(INITIAL_SIZE)?;
            } else if self.needs_expand() && self.type_expand_allowed() {
                self.try_expand(self.ht[0].used + 1)?;
            }
        }
        self.insert(key, value)
    }

    /// Inserts a new entry, or overwrites the value of the existing one.
    /// Returns `true` when the key was newly added.
    ///
    /// On overwrite the new value is installed before the old one is
    /// dropped, so a value aliasing the old one (reference counting) stays
    /// live throughout.
    pub fn replace(&mut self, key: K, value: V) -> Result<bool> {
        match self.find_position_for_insert(&key)? {
            InsertPosition::Vacant(slot) => {
                self.insert_at_position(key, value, slot);
                Ok(true)
            }
            InsertPosition::Occupied(existing) => {
                let link = existing.raw();
                assert!(link.is_normal(), "replace on a no-value dict");
                let old = unsafe {
                    mem::replace(&mut (*entry::full_ptr::<K, V, T::EntryMetadata>(link)).val, value)
                };
                drop(old);
                Ok(false)
            }
        }
    }

    /// First half of a two-phase insert: the bucket the key belongs in, or
    /// the existing entry.
    ///
    /// Runs an opportunistic rehash step and grows the table if the load
    /// factor calls for it, so a returned [`InsertSlot`] is valid only
    /// until the next dict operation.
    pub fn find_position_for_insert(
        &mut self,
        key: &K,
    ) -> Result<InsertPosition<'_, K, V, T::EntryMetadata>> {
        let hash = self.ty.hash(key);
        if self.is_rehashing() {
            self.rehash_step();
        }
        self.expand_if_needed()?;
        let mut idx = 0usize;
        for table in 0..2 {
            if self.ht[table].table.is_none() {
                break;
            }
            idx = (hash & self.ht[table].mask()) as usize;
            let mut he = self.ht[table].table.as_ref().unwrap()[idx];
            while !he.is_null() {
                let eq = {
                    let he_key = unsafe { self.key_of(&he) };
                    self.ty.key_eq(key, he_key)
                };
                if eq {
                    return Ok(InsertPosition::Occupied(EntryRef::new(he)));
                }
                he = unsafe { self.next_of(he) };
            }
            if !self.is_rehashing() {
                break;
            }
        }
        // While rehashing, new entries always land in the second table.
        Ok(InsertPosition::Vacant(InsertSlot { idx }))
    }

    /// Second half of a two-phase insert: writes the new entry at the head
    /// of the slot's chain. The caller must have verified the key is
    /// absent via [`find_position_for_insert`][Dict::find_position_for_insert].
    ///
    /// New entries go to the head on the assumption that recently added
    /// keys are accessed more often.
    pub fn insert_at_position(
        &mut self,
        key: K,
        value: V,
        slot: InsertSlot,
    ) -> EntryMut<'_, K, V, T::EntryMetadata> {
        let htidx = usize::from(self.is_rehashing());
        assert!(
            slot.idx < self.ht[htidx].size(),
            "insert position does not belong to the live table"
        );
        let head = self.ht[htidx].table.as_ref().unwrap()[slot.idx];
        let link = if T::NO_VALUE {
            if T::KEYS_ARE_ODD && head.is_null() {
                // The key fits in the bucket slot itself.
                entry::key_into_word(key)
            } else {
                entry::new_no_value_entry(key, head)
            }
        } else {
            entry::new_full_entry::<K, V, T::EntryMetadata>(key, value, head)
        };
        self.ht[htidx].table.as_mut().unwrap()[slot.idx] = link;
        self.ht[htidx].used += 1;
        EntryMut::new(link)
    }

    /// Removes the entry for `key`, dropping its key and value.
    pub fn remove(&mut self, key: &K) -> Result<()> {
        match self.generic_delete(key) {
            Some(link) => {
                unsafe { self.free_link(link) };
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Removes the entry for `key` without releasing it, handing it to the
    /// caller instead. Dropping the returned entry (or passing it to
    /// [`free_detached`][Dict::free_detached]) runs the destructors and
    /// frees the backing allocation.
    pub fn unlink(&mut self, key: &K) -> Option<DetachedEntry<K, V, T::EntryMetadata>> {
        self.generic_delete(key).map(DetachedEntry::new)
    }

    /// Releases an entry returned by [`unlink`][Dict::unlink]. Equivalent
    /// to dropping it.
    pub fn free_detached(&mut self, entry: DetachedEntry<K, V, T::EntryMetadata>) {
        drop(entry);
    }

    /// Finds the entry for `key` and pauses rehashing until the returned
    /// guard is dropped, so the entry can be inspected while the table
    /// stays put. [`TwoPhaseUnlink::free`] unlinks and releases the entry
    /// without a second lookup; merely dropping the guard leaves the entry
    /// in place.
    pub fn two_phase_unlink(&mut self, key: &K) -> Option<TwoPhaseUnlink<'_, K, V, T>> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.ty.hash(key);
        let mut found = None;
        for table in 0..2 {
            if self.ht[table].table.is_none() {
                break;
            }
            let idx = (hash & self.ht[table].mask()) as usize;
            let mut he = self.ht[table].table.as_ref().unwrap()[idx];
            while !he.is_null() {
                let eq = {
                    let he_key = unsafe { self.key_of(&he) };
                    self.ty.key_eq(key, he_key)
                };
                if eq {
                    found = Some((table, idx, he));
                    break;
                }
                he = unsafe { self.next_of(he) };
            }
            if found.is_some() || !self.is_rehashing() {
                break;
            }
        }
        let (table, idx, link) = found?;
        self.pause_rehashing();
        Some(TwoPhaseUnlink {
            dict: self,
            table,
            idx,
            link,
        })
    }

    /// Grows (or initially allocates) the bucket array to hold at least
    /// `size` entries, rounded up to a power of two. Subsequent growths
    /// install the new array as the rehash target and set the migration
    /// in motion.
    pub fn expand(&mut self, size: usize) -> Result<()> {
        self.expand_internal(size, false)
    }

    /// Like [`expand`][Dict::expand], but allocation failure is reported
    /// as [`Error::AllocationFailed`] and leaves the dict unchanged,
    /// instead of aborting the process.
    pub fn try_expand(&mut self, size: usize) -> Result<()> {
        self.expand_internal(size, true)
    }

    /// Shrinks the table to the smallest power of two holding all current
    /// entries (at least [`INITIAL_SIZE`]). Rejected unless the resize
    /// policy is [`ResizePolicy::Enable`] and no rehash is in progress.
    pub fn resize(&mut self) -> Result<()> {
        if self.policy != ResizePolicy::Enable || self.is_rehashing() {
            return Err(Error::ResizeRejected);
        }
        let minimal = self.ht[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    /// Performs up to `n` bucket migrations of an in-progress rehash.
    /// Returns `true` while more work remains.
    ///
    /// Skipping empty buckets is bounded too: at most `10 * n` empty
    /// buckets are visited per call, so a call over a sparse table returns
    /// early with `true` rather than stalling. The pause counter is *not*
    /// consulted here; pausing only suppresses the opportunistic step
    /// embedded in lookups and updates.
    pub fn rehash_steps(&mut self, n: usize) -> bool {
        if self.policy == ResizePolicy::Forbid || !self.is_rehashing() {
            return false;
        }
        let s0 = self.ht[0].size();
        let s1 = self.ht[1].size();
        if self.policy == ResizePolicy::Avoid
            && ((s1 > s0 && s1 / s0 < FORCE_RESIZE_RATIO)
                || (s1 < s0 && s0 / s1 < FORCE_RESIZE_RATIO))
        {
            return false;
        }

        let mut empty_visits = n * 10;
        let mut n = n;
        while n > 0 && self.ht[0].used != 0 {
            n -= 1;
            debug_assert!((self.ht[0].size() as i64) > self.rehash_idx);
            loop {
                let idx = self.rehash_idx as usize;
                if !self.ht[0].table.as_ref().unwrap()[idx].is_null() {
                    break;
                }
                self.rehash_idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }
            let idx = self.rehash_idx as usize;
            let mut de = self.ht[0].table.as_ref().unwrap()[idx];
            while !de.is_null() {
                let next = unsafe { self.next_of(de) };
                let dest = if self.ht[1].size_exp > self.ht[0].size_exp {
                    let hash = {
                        let key = unsafe { self.key_of(&de) };
                        self.ty.hash(key)
                    };
                    (hash & self.ht[1].mask()) as usize
                } else {
                    // Shrinking: all keys of one source bucket share the
                    // destination's low bits, so the source index masks
                    // down directly.
                    (self.rehash_idx as u64 & self.ht[1].mask()) as usize
                };
                let head = self.ht[1].table.as_ref().unwrap()[dest];
                let moved = if T::NO_VALUE {
                    if T::KEYS_ARE_ODD && head.is_null() {
                        // The destination bucket is empty: collapse to an
                        // inline key, freeing the allocated entry if any.
                        if de.is_key() {
                            de
                        } else {
                            let (key, _) = unsafe { entry::take_no_value_entry::<K>(de) };
                            entry::key_into_word(key)
                        }
                    } else if de.is_key() {
                        // An inline key needs a next field now.
                        let key = unsafe { entry::word_into_key::<K>(de) };
                        entry::new_no_value_entry(key, head)
                    } else {
                        debug_assert!(de.is_no_value());
                        unsafe { self.set_next(de, head) };
                        de
                    }
                } else {
                    unsafe { self.set_next(de, head) };
                    de
                };
                self.ht[1].table.as_mut().unwrap()[dest] = moved;
                self.ht[0].used -= 1;
                self.ht[1].used += 1;
                de = next;
            }
            self.ht[0].table.as_mut().unwrap()[idx] = Link::NULL;
            self.rehash_idx += 1;
        }

        if self.ht[0].used == 0 {
            self.ht[0] = mem::replace(&mut self.ht[1], Ht::new());
            self.rehash_idx = -1;
            log::trace!(
                "incremental rehash complete, table is {} buckets",
                self.ht[0].size()
            );
            return false;
        }
        true
    }

    /// Runs `rehash_steps(100)` batches until roughly `ms` milliseconds of
    /// wall time have elapsed or the rehash completes. Returns the number
    /// of steps performed.
    ///
    /// Unlike [`rehash_steps`][Dict::rehash_steps], this honors the pause
    /// counter at entry and does nothing while rehashing is paused.
    pub fn rehash_ms(&mut self, ms: u64) -> usize {
        if self.pause_rehash > 0 {
            return 0;
        }
        let start = self.clock.now();
        let mut steps = 0;
        while self.rehash_steps(100) {
            steps += 100;
            if (self.clock.now() - start).as_millis() as u64 > ms {
                break;
            }
        }
        steps
    }

    /// Suspends the opportunistic rehash step embedded in lookups and
    /// updates. Calls nest; each must be matched by
    /// [`resume_rehashing`][Dict::resume_rehashing].
    pub fn pause_rehashing(&mut self) {
        self.pause_rehash += 1;
    }

    /// Reverses one [`pause_rehashing`][Dict::pause_rehashing] call.
    ///
    /// # Panics
    ///
    /// Panics when rehashing is not paused.
    pub fn resume_rehashing(&mut self) {
        assert!(
            self.pause_rehash > 0,
            "resuming a rehash that was not paused"
        );
        self.pause_rehash -= 1;
    }

    /// Removes every entry from both tables, running key and value
    /// destructors, and resets the rehash state. Bucket arrays are
    /// released; the dict is back to its just-created state.
    pub fn clear(&mut self) {
        self.clear_table(0);
        self.clear_table(1);
        self.rehash_idx = -1;
        self.pause_rehash = 0;
    }
}

//
// private
//
impl<K, V, T> Dict<K, V, T>
where
    T: DictType<K, V>,
{
    #[inline]
    pub(crate) unsafe fn key_of<'a>(&self, link: &'a Link) -> &'a K {
        entry::entry_key::<K, V, T::EntryMetadata>(link)
    }

    #[inline]
    pub(crate) unsafe fn next_of(&self, link: Link) -> Link {
        entry::entry_next::<K, V, T::EntryMetadata>(link)
    }

    #[inline]
    pub(crate) unsafe fn set_next(&self, link: Link, next: Link) {
        entry::set_entry_next::<K, V, T::EntryMetadata>(link, next);
    }

    #[inline]
    pub(crate) unsafe fn free_link(&self, link: Link) {
        entry::free_entry::<K, V, T::EntryMetadata>(link);
    }

    /// One opportunistic rehash step, unless paused.
    #[inline]
    pub(crate) fn rehash_step(&mut self) {
        if self.pause_rehash == 0 {
            self.rehash_steps(1);
        }
    }

    fn find_link(&mut self, key: &K) -> Option<Link> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.ty.hash(key);
        for table in 0..2 {
            if self.ht[table].table.is_none() {
                break;
            }
            let idx = (hash & self.ht[table].mask()) as usize;
            let mut he = self.ht[table].table.as_ref().unwrap()[idx];
            while !he.is_null() {
                let eq = {
                    let he_key = unsafe { self.key_of(&he) };
                    self.ty.key_eq(key, he_key)
                };
                if eq {
                    return Some(he);
                }
                he = unsafe { self.next_of(he) };
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Finds `key`, unlinks its entry from the chain, and returns the raw
    /// link without releasing it.
    fn generic_delete(&mut self, key: &K) -> Option<Link> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = self.ty.hash(key);
        for table in 0..2 {
            if self.ht[table].table.is_none() {
                break;
            }
            let idx = (hash & self.ht[table].mask()) as usize;
            let mut prev = Link::NULL;
            let mut he = self.ht[table].table.as_ref().unwrap()[idx];
            while !he.is_null() {
                let eq = {
                    let he_key = unsafe { self.key_of(&he) };
                    self.ty.key_eq(key, he_key)
                };
                if eq {
                    let next = unsafe { self.next_of(he) };
                    if prev.is_null() {
                        self.ht[table].table.as_mut().unwrap()[idx] = next;
                    } else {
                        unsafe { self.set_next(prev, next) };
                    }
                    self.ht[table].used -= 1;
                    return Some(he);
                }
                prev = he;
                he = unsafe { self.next_of(he) };
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    /// Smallest exponent `e` with `2^e >= max(size, INITIAL_SIZE)`,
    /// saturating below the index type's bit width. `size <= INITIAL_SIZE`
    /// is answered before any leading-zeros computation, which is not
    /// defined for an all-zero argument on every platform.
    fn next_exp(size: usize) -> i8 {
        if size <= INITIAL_SIZE {
            return INITIAL_EXP;
        }
        if size >= isize::MAX as usize {
            return (usize::BITS - 1) as i8;
        }
        (usize::BITS - (size - 1).leading_zeros()) as i8
    }

    fn expand_internal(&mut self, size: usize, try_alloc: bool) -> Result<()> {
        if self.is_rehashing() || self.ht[0].used > size {
            return Err(Error::ResizeRejected);
        }
        let new_exp = Self::next_exp(size);
        let new_size = 1usize << new_exp;
        if new_size < size || new_size.checked_mul(mem::size_of::<Link>()).is_none() {
            return Err(Error::ResizeRejected);
        }
        // Rehashing to the current size is not useful.
        if new_exp == self.ht[0].size_exp {
            return Err(Error::ResizeRejected);
        }

        let table = if try_alloc {
            let mut v: Vec<Link> = Vec::new();
            if v.try_reserve_exact(new_size).is_err() {
                return Err(Error::AllocationFailed);
            }
            v.resize(new_size, Link::NULL);
            v.into_boxed_slice()
        } else {
            vec![Link::NULL; new_size].into_boxed_slice()
        };

        if self.ht[0].table.is_none() {
            // First allocation: install directly, nothing to migrate.
            self.ht[0] = Ht {
                table: Some(table),
                size_exp: new_exp,
                used: 0,
            };
            return Ok(());
        }

        log::trace!(
            "resizing dict from {} to {} buckets",
            self.ht[0].size(),
            new_size
        );
        self.ht[1] = Ht {
            table: Some(table),
            size_exp: new_exp,
            used: 0,
        };
        self.rehash_idx = 0;
        Ok(())
    }

    #[inline]
    fn needs_expand(&self) -> bool {
        let size = self.ht[0].size();
        if size == 0 {
            return true;
        }
        let used = self.ht[0].used;
        (self.policy == ResizePolicy::Enable && used >= size)
            || (self.policy != ResizePolicy::Forbid && used / size > FORCE_RESIZE_RATIO)
    }

    fn expand_if_needed(&mut self) -> Result<()> {
        if self.is_rehashing() {
            return Ok(());
        }
        if self.ht[0].size() == 0 {
            return self.expand(INITIAL_SIZE);
        }
        if self.needs_expand() {
            if !self.type_expand_allowed() {
                return Ok(());
            }
            return self.expand(self.ht[0].used + 1);
        }
        Ok(())
    }

    fn type_expand_allowed(&self) -> bool {
        let next_size = 1usize << Self::next_exp(self.ht[0].used + 1);
        let required = next_size * mem::size_of::<Link>();
        let load = self.ht[0].used as f64 / self.ht[0].size() as f64;
        self.ty.expand_allowed(required, load)
    }

    fn clear_table(&mut self, htidx: usize) {
        if let Some(table) = self.ht[htidx].table.take() {
            for slot in table.iter() {
                let mut he = *slot;
                while !he.is_null() {
                    let next = unsafe { self.next_of(he) };
                    unsafe { self.free_link(he) };
                    he = next;
                }
            }
        }
        self.ht[htidx] = Ht::new();
    }

    /// Digest of the structural state (table addresses, exponents, used
    /// counts), mixed with Thomas Wang's 64-bit integer hash. Captured and
    /// re-checked by unsafe iterators to detect forbidden mutation.
    pub(crate) fn fingerprint(&self) -> u64 {
        let integers = [
            self.ht[0].table.as_ref().map_or(0, |t| t.as_ptr() as u64),
            self.ht[0].size_exp as u64,
            self.ht[0].used as u64,
            self.ht[1].table.as_ref().map_or(0, |t| t.as_ptr() as u64),
            self.ht[1].size_exp as u64,
            self.ht[1].used as u64,
        ];
        let mut hash: u64 = 0;
        for n in integers {
            hash = hash.wrapping_add(n);
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }

    #[cfg(test)]
    fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }
}

impl<K, V, T> Drop for Dict<K, V, T>
where
    T: DictType<K, V>,
{
    fn drop(&mut self) {
        self.clear();
    }
}

/// Guard returned by [`Dict::two_phase_unlink`]: the entry has been found
/// and rehashing is paused, but nothing has been unlinked yet.
pub struct TwoPhaseUnlink<'d, K, V, T>
where
    T: DictType<K, V>,
{
    dict: &'d mut Dict<K, V, T>,
    table: usize,
    idx: usize,
    link: Link,
}

impl<K, V, T> TwoPhaseUnlink<'_, K, V, T>
where
    T: DictType<K, V>,
{
    /// The entry found by the lookup.
    pub fn entry(&self) -> EntryRef<'_, K, V, T::EntryMetadata> {
        EntryRef::new(self.link)
    }

    /// Unlinks and releases the entry, then resumes rehashing.
    pub fn free(self) {
        let link = self.link;
        unsafe {
            let mut slot: *mut Link = {
                let table = self.dict.ht[self.table].table.as_mut().unwrap();
                &mut table[self.idx]
            };
            loop {
                let cur = *slot;
                assert!(!cur.is_null(), "two-phase unlink lost its entry");
                if cur == link {
                    break;
                }
                let next_slot = entry::entry_next_slot::<K, V, T::EntryMetadata>(cur);
                assert!(!next_slot.is_null(), "two-phase unlink lost its entry");
                slot = next_slot;
            }
            *slot = entry::entry_next::<K, V, T::EntryMetadata>(link);
        }
        self.dict.ht[self.table].used -= 1;
        unsafe { entry::free_entry::<K, V, T::EntryMetadata>(link) };
        // Dropping the guard resumes rehashing.
    }
}

impl<K, V, T> Drop for TwoPhaseUnlink<'_, K, V, T>
where
    T: DictType<K, V>,
{
    fn drop(&mut self) {
        self.dict.resume_rehashing();
    }
}
