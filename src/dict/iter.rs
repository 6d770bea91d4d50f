//! Bucket-by-bucket iteration over a dict.

use super::entry::{EntryRef, Link};
use super::Dict;
use crate::dict_type::DictType;

/// A detached iteration cursor over a [`Dict`].
///
/// The cursor does not borrow the dict; each [`next`][DictIterator::next]
/// call takes it explicitly, and the dict may be used in between. The two
/// flavors differ in what they permit there:
///
/// - A plain cursor ([`new`][DictIterator::new]) captures a structural
///   fingerprint of the dict on its first advance and asserts it unchanged
///   at [`release`][DictIterator::release]. Any insert, delete, or resize
///   while iterating is a programming error and panics at release time.
///   Lookups are fine: their opportunistic rehash step is what the
///   fingerprint would catch, so [`Dict::find`] leaves the fingerprint
///   intact only while no rehash is in progress; pair a plain cursor with
///   a fully rehashed dict.
/// - A safe cursor ([`new_safe`][DictIterator::new_safe]) pauses rehashing
///   on its first advance and resumes it at release, so the caller may
///   insert, find, and delete while iterating. Deleting the entry most
///   recently returned is always fine; the following entry was remembered
///   before it was handed out.
///
/// Advancing never trusts remembered entries blindly: the remembered
/// position is located in the live chain before it is dereferenced, so an
/// out-of-contract deletion degrades the visit order rather than touching
/// freed memory.
///
/// Iteration visits table 0 and then, while a rehash is in progress,
/// table 1.
pub struct DictIterator {
    table: usize,
    index: i64,
    safe: bool,
    started: bool,
    current: Link,
    next: Link,
    fingerprint: u64,
}

impl DictIterator {
    /// A plain (fingerprinted) cursor.
    pub fn new() -> Self {
        Self {
            table: 0,
            index: -1,
            safe: false,
            started: false,
            current: Link::NULL,
            next: Link::NULL,
            fingerprint: 0,
        }
    }

    /// A safe cursor: rehashing stays paused for the whole iteration.
    pub fn new_safe() -> Self {
        Self {
            safe: true,
            ..Self::new()
        }
    }

    /// Advances to the next entry, or `None` when iteration is complete.
    pub fn next<'d, K, V, T>(
        &mut self,
        dict: &'d mut Dict<K, V, T>,
    ) -> Option<EntryRef<'d, K, V, T::EntryMetadata>>
    where
        T: DictType<K, V>,
    {
        loop {
            let candidate = if self.current.is_null() {
                if !self.started {
                    self.started = true;
                    if self.safe {
                        dict.pause_rehashing();
                    } else {
                        self.fingerprint = dict.fingerprint();
                    }
                }
                self.index += 1;
                if self.index >= dict.ht[self.table].size() as i64 {
                    if dict.is_rehashing() && self.table == 0 {
                        self.table = 1;
                        self.index = 0;
                    } else {
                        return None;
                    }
                }
                match dict.ht[self.table].table.as_ref() {
                    Some(table) => table[self.index as usize],
                    None => return None,
                }
            } else {
                self.reanchor(dict)
            };
            self.current = candidate;
            if !self.current.is_null() {
                // Remember the follower now: the caller may delete the
                // entry we are about to return.
                self.next = unsafe { dict.next_of(self.current) };
                return Some(EntryRef::new(self.current));
            }
        }
    }

    /// Ends the iteration. A safe cursor resumes rehashing; a plain cursor
    /// re-computes the fingerprint and asserts it unchanged.
    ///
    /// # Panics
    ///
    /// Panics when a plain cursor observed a structural change: the dict
    /// was mutated during iteration.
    pub fn release<K, V, T>(self, dict: &mut Dict<K, V, T>)
    where
        T: DictType<K, V>,
    {
        if !self.started {
            return;
        }
        if self.safe {
            dict.resume_rehashing();
        } else {
            assert!(
                self.fingerprint == dict.fingerprint(),
                "dict was mutated during unsafe iteration"
            );
        }
    }

    /// Walks the current bucket's live chain for the position remembered
    /// by the previous `next` call. If the previously returned entry is
    /// still chained, its present follower is the next entry; if only the
    /// remembered follower is found (the returned entry was deleted), it
    /// is used directly; if neither survives, the bucket is finished.
    fn reanchor<K, V, T>(&self, dict: &Dict<K, V, T>) -> Link
    where
        T: DictType<K, V>,
    {
        let Some(table) = dict.ht[self.table].table.as_ref() else {
            return Link::NULL;
        };
        if self.index as usize >= table.len() {
            return Link::NULL;
        }
        let mut he = table[self.index as usize];
        let mut saw_next = Link::NULL;
        while !he.is_null() {
            if he == self.current {
                return unsafe { dict.next_of(he) };
            }
            if he == self.next {
                saw_next = he;
            }
            he = unsafe { dict.next_of(he) };
        }
        saw_next
    }
}

impl Default for DictIterator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::DictIterator;
    use crate::dict::Dict;
    use crate::dict_type::DictType;

    struct Nums;

    impl DictType<u64, u64> for Nums {
        type Metadata = ();
        type EntryMetadata = ();

        fn hash(&self, key: &u64) -> u64 {
            // splitmix64
            let mut h = key.wrapping_add(0x9e37_79b9_7f4a_7c15);
            h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            h ^ (h >> 31)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    #[test]
    fn plain_iteration_visits_every_entry_once() {
        let mut dict = Dict::new(Nums);
        for i in 0..100u64 {
            dict.insert(i, i * 10).unwrap();
        }
        while dict.is_rehashing() {
            dict.rehash_steps(100);
        }

        let mut seen = vec![false; 100];
        let mut it = DictIterator::new();
        while let Some(e) = it.next(&mut dict) {
            let k = *e.key() as usize;
            assert!(!seen[k], "entry {k} visited twice");
            seen[k] = true;
            assert_eq!(*e.value(), *e.key() * 10);
        }
        it.release(&mut dict);
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn iteration_covers_both_tables_mid_rehash() {
        let mut dict = Dict::new(Nums);
        for i in 0..64u64 {
            dict.insert(i, i).unwrap();
        }
        // Trigger a grow, then stop half way.
        dict.insert(64, 64).unwrap();
        for _ in 0..4 {
            dict.rehash_steps(1);
        }
        assert!(dict.is_rehashing());

        let mut count = 0;
        let mut it = DictIterator::new();
        while it.next(&mut dict).is_some() {
            count += 1;
        }
        it.release(&mut dict);
        assert_eq!(count, 65);
    }

    #[test]
    #[should_panic(expected = "mutated during unsafe iteration")]
    fn mutation_during_plain_iteration_panics_at_release() {
        let mut dict = Dict::new(Nums);
        for i in 0..50u64 {
            dict.insert(i, i).unwrap();
        }
        while dict.is_rehashing() {
            dict.rehash_steps(100);
        }

        let mut it = DictIterator::new();
        for _ in 0..10 {
            it.next(&mut dict).unwrap();
        }
        dict.insert(1000, 1000).unwrap();
        it.release(&mut dict);
    }

    #[test]
    fn safe_iteration_allows_deleting_returned_entries() {
        let mut dict = Dict::new(Nums);
        for i in 0..100u64 {
            dict.insert(i, i).unwrap();
        }

        let mut it = DictIterator::new_safe();
        let mut visited = 0u64;
        loop {
            let Some(e) = it.next(&mut dict) else { break };
            let k = *e.key();
            visited += 1;
            if k % 2 == 0 {
                dict.remove(&k).unwrap();
            }
        }
        it.release(&mut dict);
        assert_eq!(visited, 100);
        assert_eq!(dict.len(), 50);
        for i in 0..100u64 {
            assert_eq!(dict.contains_key(&i), i % 2 == 1);
        }
    }

    #[test]
    fn safe_iteration_pauses_rehashing() {
        let mut dict = Dict::new(Nums);
        for i in 0..65u64 {
            dict.insert(i, i).unwrap();
        }
        assert!(dict.is_rehashing());

        let mut it = DictIterator::new_safe();
        it.next(&mut dict).unwrap();
        // Lookups no longer perform their opportunistic step.
        let idx_before = dict.rehash_idx;
        for i in 0..65u64 {
            dict.find(&i).unwrap();
        }
        assert_eq!(dict.rehash_idx, idx_before);
        // Explicit steps still work.
        dict.rehash_steps(1);
        assert!(dict.rehash_idx > idx_before || !dict.is_rehashing());
        it.release(&mut dict);
    }

    #[test]
    fn release_before_first_advance_is_a_no_op() {
        let mut dict = Dict::new(Nums);
        dict.insert(1, 1).unwrap();
        let it = DictIterator::new_safe();
        it.release(&mut dict);
        let it = DictIterator::new();
        it.release(&mut dict);
    }
}
