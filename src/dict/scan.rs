//! Stateless full-table scan with a reverse-binary cursor.
//!
//! The cursor is incremented from its high-order bits: set the bits above
//! the table mask, reverse the word, add one, reverse back. Buckets are
//! therefore visited in an order that survives table growth and shrinkage
//! between calls: a bucket's expansions in a larger table are visited
//! with it, so nothing already emitted needs revisiting after a resize and
//! nothing pending is skipped. While a rehash is in progress each call
//! emits one bucket of the smaller table plus every bucket of the larger
//! table that projects onto it.

use std::ptr;

use super::entry::{self, EntryRef, Link, ENTRY_PTR_MASK};
use super::Dict;
use crate::dict_type::DictType;

/// Relocation hooks for [`Dict::scan_defrag`].
///
/// `entry` receives the address of each visited entry allocation and
/// returns `true` when the allocation should move; `key` and `value`
/// receive the stored key or value and return it, possibly moved into a
/// fresh allocation of its own. Hooks must not panic: a panic unwinds out
/// of a half-updated bucket.
pub struct DefragFns<K, V> {
    /// Decides whether an entry allocation should be moved.
    pub entry: Option<fn(*const u8) -> bool>,
    /// Re-allocates the storage owned by a key.
    pub key: Option<fn(K) -> K>,
    /// Re-allocates the storage owned by a value.
    pub value: Option<fn(V) -> V>,
}

impl<K, V> DefragFns<K, V> {
    /// Hooks that relocate every entry allocation and leave keys and
    /// values alone.
    pub fn entries_only() -> Self {
        Self {
            entry: Some(|_| true),
            key: None,
            value: None,
        }
    }
}

impl<K, V> Default for DefragFns<K, V> {
    fn default() -> Self {
        Self {
            entry: None,
            key: None,
            value: None,
        }
    }
}

impl<K, V, T> Dict<K, V, T>
where
    T: DictType<K, V>,
{
    /// Performs one step of a full-table scan, invoking `f` for every
    /// entry in the buckets the cursor selects, and returns the next
    /// cursor. Start with cursor 0; the scan is complete when 0 comes
    /// back.
    ///
    /// Guarantees: every entry present in the dict for the whole duration
    /// of the scan is emitted at least once. Entries added mid-scan may or
    /// may not be emitted, and an entry may be emitted more than once when
    /// the table is resized between calls; callers must tolerate
    /// duplicates. Rehashing is paused while a call runs.
    pub fn scan<F>(&mut self, cursor: u64, f: F) -> u64
    where
        F: FnMut(EntryRef<'_, K, V, T::EntryMetadata>),
    {
        self.scan_inner(cursor, None, f)
    }

    /// Like [`scan`][Dict::scan], additionally offering every visited
    /// bucket's entries, keys, and values to the relocation hooks. When an
    /// entry allocation moves, the bucket chain is rewritten to the new
    /// address and the type's
    /// [`after_replace_entry`][DictType::after_replace_entry] hook runs.
    pub fn scan_defrag<F>(&mut self, cursor: u64, fns: &DefragFns<K, V>, f: F) -> u64
    where
        F: FnMut(EntryRef<'_, K, V, T::EntryMetadata>),
    {
        self.scan_inner(cursor, Some(fns), f)
    }

    fn scan_inner<F>(&mut self, mut v: u64, fns: Option<&DefragFns<K, V>>, mut f: F) -> u64
    where
        F: FnMut(EntryRef<'_, K, V, T::EntryMetadata>),
    {
        if self.len() == 0 {
            return 0;
        }

        // Keep the tables stable underneath the emitted buckets.
        self.pause_rehashing();

        if !self.is_rehashing() {
            let m0 = self.ht[0].mask();
            let idx = (v & m0) as usize;
            if let Some(fns) = fns {
                self.defrag_bucket(0, idx, fns);
            }
            self.emit_bucket(0, idx, &mut f);

            // Set the bits above the mask so the reverse increment
            // operates on the masked bits only.
            v |= !m0;
            v = v.reverse_bits();
            v = v.wrapping_add(1);
            v = v.reverse_bits();
        } else {
            let (mut t0, mut t1) = (0, 1);
            if self.ht[t0].size() > self.ht[t1].size() {
                std::mem::swap(&mut t0, &mut t1);
            }
            let m0 = self.ht[t0].mask();
            let m1 = self.ht[t1].mask();

            let idx = (v & m0) as usize;
            if let Some(fns) = fns {
                self.defrag_bucket(t0, idx, fns);
            }
            self.emit_bucket(t0, idx, &mut f);

            // Visit every index of the larger table that projects down to
            // the bucket just emitted from the smaller one.
            loop {
                let idx = (v & m1) as usize;
                if let Some(fns) = fns {
                    self.defrag_bucket(t1, idx, fns);
                }
                self.emit_bucket(t1, idx, &mut f);

                v |= !m1;
                v = v.reverse_bits();
                v = v.wrapping_add(1);
                v = v.reverse_bits();

                if v & (m0 ^ m1) == 0 {
                    break;
                }
            }
        }

        self.resume_rehashing();
        v
    }

    fn emit_bucket<F>(&mut self, table: usize, idx: usize, f: &mut F)
    where
        F: FnMut(EntryRef<'_, K, V, T::EntryMetadata>),
    {
        let mut de = self.ht[table].table.as_ref().unwrap()[idx];
        while !de.is_null() {
            let next = unsafe { self.next_of(de) };
            f(EntryRef::new(de));
            de = next;
        }
    }

    fn defrag_bucket(&mut self, table: usize, idx: usize, fns: &DefragFns<K, V>) {
        let mut slot: *mut Link = {
            let table = self.ht[table].table.as_mut().unwrap();
            &mut table[idx]
        };
        unsafe {
            loop {
                let de = *slot;
                if de.is_null() {
                    break;
                }
                if de.is_key() {
                    if let Some(fk) = fns.key {
                        let key = entry::word_into_key::<K>(de);
                        *slot = entry::key_into_word::<K>(fk(key));
                    }
                    // Inline keys terminate their chain.
                    break;
                }
                if let Some(fk) = fns.key {
                    let key_slot = entry::entry_key_slot::<K, V, T::EntryMetadata>(de);
                    ptr::write(key_slot, fk(ptr::read(key_slot)));
                }
                if let Some(fv) = fns.value {
                    if de.is_normal() {
                        let val_slot =
                            &mut (*entry::full_ptr::<K, V, T::EntryMetadata>(de)).val as *mut V;
                        ptr::write(val_slot, fv(ptr::read(val_slot)));
                    }
                }
                let mut cur = de;
                if let Some(fe) = fns.entry {
                    if fe((de.0 & !ENTRY_PTR_MASK) as *const u8) {
                        cur = entry::relocate_entry::<K, V, T::EntryMetadata>(de);
                        *slot = cur;
                        self.ty.after_replace_entry(&EntryRef::new(cur));
                    }
                }
                slot = entry::entry_next_slot::<K, V, T::EntryMetadata>(cur);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::DefragFns;
    use crate::dict::Dict;
    use crate::dict_type::DictType;

    struct Nums;

    impl DictType<u64, u64> for Nums {
        type Metadata = ();
        type EntryMetadata = ();

        fn hash(&self, key: &u64) -> u64 {
            let mut h = key.wrapping_add(0x9e37_79b9_7f4a_7c15);
            h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            h ^ (h >> 31)
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    fn populated(n: u64) -> Dict<u64, u64, Nums> {
        let mut dict = Dict::new(Nums);
        for i in 0..n {
            dict.insert(i, i).unwrap();
        }
        dict
    }

    #[test]
    fn reverse_cursor_visits_every_bucket_once() {
        // The reverse increment over an 8-bit mask starts 0 -> 0x80 and
        // reaches all 256 cursors before coming back to 0.
        let mask: u64 = 0xff;
        let mut v: u64 = 0;
        let mut seen = [false; 256];
        for step in 0..256usize {
            assert!(!seen[(v & mask) as usize]);
            seen[(v & mask) as usize] = true;
            v |= !mask;
            v = v.reverse_bits();
            v = v.wrapping_add(1);
            v = v.reverse_bits();
            if step == 0 {
                assert_eq!(v, 0x80);
            }
        }
        assert_eq!(v & mask, 0);
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn scan_visits_every_entry_of_a_static_dict() {
        for n in [1u64, 7, 64, 500] {
            let mut dict = populated(n);
            let mut counts: HashMap<u64, usize> = HashMap::new();
            let mut cursor = 0;
            loop {
                cursor = dict.scan(cursor, |e| {
                    *counts.entry(*e.key()).or_default() += 1;
                });
                if cursor == 0 {
                    break;
                }
            }
            for i in 0..n {
                assert!(counts.contains_key(&i), "key {i} missed with n = {n}");
            }
        }
    }

    #[test]
    fn scan_visits_every_entry_mid_rehash() {
        let mut dict = populated(64);
        dict.insert(64, 64).unwrap();
        dict.rehash_steps(2);
        assert!(dict.is_rehashing());

        let mut counts: HashMap<u64, usize> = HashMap::new();
        let mut cursor = 0;
        loop {
            cursor = dict.scan(cursor, |e| {
                *counts.entry(*e.key()).or_default() += 1;
            });
            if cursor == 0 {
                break;
            }
        }
        assert!(dict.is_rehashing(), "scan must not advance the rehash");
        for i in 0..=64u64 {
            assert!(counts.contains_key(&i), "key {i} missed");
        }
    }

    #[test]
    fn scan_terminates_from_any_cursor() {
        let mut dict = populated(100);
        for start in [0u64, 1, 5, 63, 0x8000_0000_0000_0001, u64::MAX] {
            let mut cursor = start;
            let mut rounds = 0;
            loop {
                cursor = dict.scan(cursor, |_| {});
                rounds += 1;
                if cursor == 0 {
                    break;
                }
                assert!(rounds < 10_000, "scan from {start:#x} did not terminate");
            }
        }
    }

    #[test]
    fn all_ones_cursor_on_a_size_one_mask_wraps_to_zero() {
        // Tables never shrink below INITIAL_SIZE, but the cursor
        // arithmetic itself must finish an all-ones cursor over a size-1
        // mask in a single step.
        let mask: u64 = 0;
        let mut v = u64::MAX;
        v |= !mask;
        v = v.reverse_bits();
        v = v.wrapping_add(1);
        v = v.reverse_bits();
        assert_eq!(v, 0);
    }

    #[test]
    fn scan_defrag_relocates_entries_and_keeps_them_findable() {
        let mut dict = populated(50);
        while dict.is_rehashing() {
            dict.rehash_steps(100);
        }

        let fns = DefragFns::entries_only();
        let mut cursor = 0;
        let mut emitted = 0;
        loop {
            cursor = dict.scan_defrag(cursor, &fns, |_| {
                emitted += 1;
            });
            if cursor == 0 {
                break;
            }
        }
        assert!(emitted >= 50);
        assert_eq!(dict.len(), 50);
        for i in 0..50u64 {
            assert_eq!(dict.get(&i), Some(&i));
        }
    }

    #[test]
    fn scan_defrag_rewrites_values_in_place() {
        let mut dict = populated(20);
        let fns = DefragFns {
            entry: None,
            key: None,
            value: Some(|v: u64| v + 1000),
        };
        let mut cursor = 0;
        loop {
            cursor = dict.scan_defrag(cursor, &fns, |_| {});
            if cursor == 0 {
                break;
            }
        }
        for i in 0..20u64 {
            assert_eq!(dict.get(&i), Some(&(i + 1000)));
        }
    }

    #[test]
    fn empty_dict_scan_returns_zero() {
        let mut dict: Dict<u64, u64, Nums> = Dict::new(Nums);
        assert_eq!(dict.scan(12345, |_| panic!("no entries to emit")), 0);
    }
}
