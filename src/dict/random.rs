//! Randomized entry sampling, for eviction policies and randomized
//! algorithms layered on the dict.

use rand::{Rng, RngCore};
use smallvec::{smallvec, SmallVec};

use super::entry::{EntryRef, Link};
use super::Dict;
use crate::dict_type::DictType;

/// Sample size backing [`Dict::fair_random_entry`].
const GETFAIR_NUM_ENTRIES: usize = 15;

impl<K, V, T> Dict<K, V, T>
where
    T: DictType<K, V>,
{
    /// Returns one randomly chosen entry, or `None` when the dict is
    /// empty.
    ///
    /// The choice picks a random non-empty bucket and then a random entry
    /// of its chain, so entries on short chains are somewhat more likely
    /// than entries on long ones. Good enough for eviction sampling; use
    /// [`fair_random_entry`][Dict::fair_random_entry] when the bias
    /// matters.
    pub fn random_entry(&mut self) -> Option<EntryRef<'_, K, V, T::EntryMetadata>> {
        if self.len() == 0 {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let he = if self.is_rehashing() {
            let s0 = self.ht[0].size() as u64;
            let slots = self.slots() as u64;
            let base = self.rehash_idx as u64;
            loop {
                // Buckets of table 0 below the rehash index are empty.
                let h = base + (self.rng.next_u64() % (slots - base));
                let link = if h >= s0 {
                    self.ht[1].table.as_ref().unwrap()[(h - s0) as usize]
                } else {
                    self.ht[0].table.as_ref().unwrap()[h as usize]
                };
                if !link.is_null() {
                    break link;
                }
            }
        } else {
            let mask = self.ht[0].mask();
            loop {
                let h = self.rng.next_u64() & mask;
                let link = self.ht[0].table.as_ref().unwrap()[h as usize];
                if !link.is_null() {
                    break link;
                }
            }
        };

        // A chain, not a single entry: count it and index uniformly.
        let mut len = 0usize;
        let mut cur = he;
        while !cur.is_null() {
            cur = unsafe { self.next_of(cur) };
            len += 1;
        }
        let mut pick = self.rng.gen_range(0..len);
        let mut he = he;
        while pick > 0 {
            he = unsafe { self.next_of(he) };
            pick -= 1;
        }
        Some(EntryRef::new(he))
    }

    /// Collects up to `count` entries from random locations, sweeping
    /// buckets linearly from a random start and jumping elsewhere when it
    /// runs into long empty stretches. Work is bounded by `count * 10`
    /// sweep steps, so fewer than `count` entries may come back; past the
    /// first `count`, reservoir sampling keeps the selection honest for
    /// chains longer than the remaining room.
    ///
    /// Duplicates are not filtered. Not suitable when a uniform
    /// distribution is required.
    pub fn some_entries(&mut self, count: usize) -> Vec<EntryRef<'_, K, V, T::EntryMetadata>> {
        self.sample_links(count)
            .into_iter()
            .map(EntryRef::new)
            .collect()
    }

    /// Returns one randomly chosen entry with a distribution less biased
    /// by chain length than [`random_entry`][Dict::random_entry]: a linear
    /// sample of 15 entries is drawn and one of them picked uniformly.
    /// Falls back to `random_entry` when the sample comes back empty.
    pub fn fair_random_entry(&mut self) -> Option<EntryRef<'_, K, V, T::EntryMetadata>> {
        let sample = self.sample_links(GETFAIR_NUM_ENTRIES);
        if sample.is_empty() {
            return self.random_entry();
        }
        let pick = self.rng.gen_range(0..sample.len());
        Some(EntryRef::new(sample[pick]))
    }

    fn sample_links(&mut self, mut count: usize) -> SmallVec<[Link; GETFAIR_NUM_ENTRIES]> {
        if count > self.len() {
            count = self.len();
        }
        if count == 0 {
            return SmallVec::new();
        }
        let mut maxsteps = count * 10;

        // Put in rehashing work proportional to the sample size.
        for _ in 0..count {
            if self.is_rehashing() {
                self.rehash_step();
            } else {
                break;
            }
        }

        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut maxsizemask = self.ht[0].mask();
        if tables > 1 && self.ht[1].mask() > maxsizemask {
            maxsizemask = self.ht[1].mask();
        }

        let mut i = self.rng.next_u64() & maxsizemask;
        let mut emptylen = 0usize;
        let mut stored = 0usize;
        let mut des: SmallVec<[Link; GETFAIR_NUM_ENTRIES]> = smallvec![Link::NULL; count];

        'sweep: while stored < count && maxsteps > 0 {
            maxsteps -= 1;
            for j in 0..tables {
                // Buckets of table 0 below the rehash index were migrated
                // already.
                if tables == 2 && j == 0 && i < self.rehash_idx as u64 {
                    // Shrinking can leave the cursor past the second
                    // table's end while still below the rehash index, in
                    // which case both tables are empty up to that index.
                    if i >= self.ht[1].size() as u64 {
                        i = self.rehash_idx as u64;
                    } else {
                        continue;
                    }
                }
                if i >= self.ht[j].size() as u64 {
                    continue;
                }
                let mut he = self.ht[j].table.as_ref().unwrap()[i as usize];

                if he.is_null() {
                    emptylen += 1;
                    if emptylen >= 5 && emptylen > count {
                        i = self.rng.next_u64() & maxsizemask;
                        emptylen = 0;
                    }
                } else {
                    emptylen = 0;
                    while !he.is_null() {
                        if stored < count {
                            des[stored] = he;
                        } else {
                            let r = self.rng.gen_range(0..stored as u64 + 1) as usize;
                            if r < count {
                                des[r] = he;
                            }
                        }
                        he = unsafe { self.next_of(he) };
                        stored += 1;
                    }
                    if stored >= count {
                        break 'sweep;
                    }
                }
            }
            i = (i + 1) & maxsizemask;
        }

        des.truncate(stored.min(count));
        des
    }
}
