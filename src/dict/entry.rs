//! Entry link encoding and the public entry handles.
//!
//! A bucket slot (and an entry's `next` field) is one machine word. The
//! three least significant bits say what the word points at:
//!
//! - `xx1`: the word *is* the key, stored inline with no allocation.
//!   Available only to no-value dicts whose keys always carry a set low
//!   bit, and only for the last entry of a chain.
//! - `010`: pointer to a [`NoValueEntry`], `{key, next}`.
//! - `000`: pointer to a [`FullEntry`], `{key, value, next, metadata}`.
//!
//! Entry allocations are aligned to 8 so the tag bits of a real pointer
//! are always zero. All reads of a link dispatch on the tag through the
//! helpers in this module; nothing outside the crate ever sees a raw tag.

use std::marker::PhantomData;
use std::mem;

pub(crate) const ENTRY_PTR_MASK: usize = 7; /* 111 */
pub(crate) const ENTRY_PTR_NORMAL: usize = 0; /* 000 */
pub(crate) const ENTRY_PTR_NO_VALUE: usize = 2; /* 010 */

/// A tagged link: null, an inline key word, or a tagged entry pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct Link(pub(crate) usize);

impl Link {
    pub(crate) const NULL: Link = Link(0);

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The word is an inline key rather than an allocated entry.
    #[inline]
    pub(crate) fn is_key(self) -> bool {
        self.0 & 1 == 1
    }

    #[inline]
    pub(crate) fn is_normal(self) -> bool {
        self.0 & ENTRY_PTR_MASK == ENTRY_PTR_NORMAL
    }

    #[inline]
    pub(crate) fn is_no_value(self) -> bool {
        self.0 & ENTRY_PTR_MASK == ENTRY_PTR_NO_VALUE
    }
}

#[repr(align(8))]
pub(crate) struct FullEntry<K, V, M> {
    pub(crate) key: K,
    pub(crate) val: V,
    pub(crate) next: Link,
    pub(crate) meta: M,
}

#[repr(align(8))]
pub(crate) struct NoValueEntry<K> {
    pub(crate) key: K,
    pub(crate) next: Link,
}

pub(crate) fn new_full_entry<K, V, M: Default>(key: K, val: V, next: Link) -> Link {
    let ptr = Box::into_raw(Box::new(FullEntry {
        key,
        val,
        next,
        meta: M::default(),
    })) as usize;
    debug_assert_eq!(ptr & ENTRY_PTR_MASK, ENTRY_PTR_NORMAL);
    Link(ptr)
}

pub(crate) fn new_no_value_entry<K>(key: K, next: Link) -> Link {
    let ptr = Box::into_raw(Box::new(NoValueEntry { key, next })) as usize;
    debug_assert_eq!(ptr & ENTRY_PTR_MASK, 0);
    Link(ptr | ENTRY_PTR_NO_VALUE)
}

/// Asserts the checkable half of the `KEYS_ARE_ODD` layout contract.
pub(crate) fn assert_word_key_layout<K>() {
    assert_eq!(
        mem::size_of::<K>(),
        mem::size_of::<usize>(),
        "KEYS_ARE_ODD requires a pointer-sized key type"
    );
    assert!(
        mem::align_of::<K>() <= mem::align_of::<usize>(),
        "KEYS_ARE_ODD requires a word-aligned key type"
    );
}

/// Moves a key into an inline link word.
pub(crate) fn key_into_word<K>(key: K) -> Link {
    let word: usize = unsafe { mem::transmute_copy(&key) };
    mem::forget(key);
    assert!(word & 1 == 1, "inline key stored with a clear low bit");
    Link(word)
}

/// Reborrows an inline key word as the key it is.
#[inline]
pub(crate) unsafe fn word_as_key<K>(link: &Link) -> &K {
    debug_assert!(link.is_key());
    &*(link as *const Link as *const K)
}

/// Moves an inline key word back out into a key.
pub(crate) unsafe fn word_into_key<K>(link: Link) -> K {
    debug_assert!(link.is_key());
    mem::transmute_copy(&link.0)
}

#[inline]
pub(crate) unsafe fn full_ptr<K, V, M>(link: Link) -> *mut FullEntry<K, V, M> {
    debug_assert!(!link.is_null() && link.is_normal());
    link.0 as *mut FullEntry<K, V, M>
}

#[inline]
pub(crate) unsafe fn no_value_ptr<K>(link: Link) -> *mut NoValueEntry<K> {
    debug_assert!(link.is_no_value());
    (link.0 & !ENTRY_PTR_MASK) as *mut NoValueEntry<K>
}

/// Returns the key stored in a non-null link.
#[inline]
pub(crate) unsafe fn entry_key<'a, K, V, M>(link: &'a Link) -> &'a K {
    if link.is_key() {
        word_as_key(link)
    } else if link.is_no_value() {
        &(*no_value_ptr::<K>(*link)).key
    } else {
        &(*full_ptr::<K, V, M>(*link)).key
    }
}

/// Returns the `next` field of a non-null link. Inline keys terminate
/// their chain, so their next is null.
#[inline]
pub(crate) unsafe fn entry_next<K, V, M>(link: Link) -> Link {
    if link.is_key() {
        Link::NULL
    } else if link.is_no_value() {
        (*no_value_ptr::<K>(link)).next
    } else {
        (*full_ptr::<K, V, M>(link)).next
    }
}

/// Rewrites the `next` field of a non-null link. Inline keys have no next
/// field; callers must have upgraded them first.
#[inline]
pub(crate) unsafe fn set_entry_next<K, V, M>(link: Link, next: Link) {
    assert!(!link.is_key(), "an inline key has no next field");
    if link.is_no_value() {
        (*no_value_ptr::<K>(link)).next = next;
    } else {
        (*full_ptr::<K, V, M>(link)).next = next;
    }
}

/// Returns the address of the `next` field of a non-null link, or null
/// for an inline key (which has none).
#[inline]
pub(crate) unsafe fn entry_next_slot<K, V, M>(link: Link) -> *mut Link {
    if link.is_key() {
        std::ptr::null_mut()
    } else if link.is_no_value() {
        &mut (*no_value_ptr::<K>(link)).next
    } else {
        &mut (*full_ptr::<K, V, M>(link)).next
    }
}

/// Returns the address of the key stored in an allocated (non-inline)
/// entry.
#[inline]
pub(crate) unsafe fn entry_key_slot<K, V, M>(link: Link) -> *mut K {
    debug_assert!(!link.is_key());
    if link.is_no_value() {
        &mut (*no_value_ptr::<K>(link)).key
    } else {
        &mut (*full_ptr::<K, V, M>(link)).key
    }
}

/// Releases a non-null link: key and value destructors run, the backing
/// allocation (if any) is freed.
pub(crate) unsafe fn free_entry<K, V, M>(link: Link) {
    if link.is_key() {
        drop(word_into_key::<K>(link));
    } else if link.is_no_value() {
        drop(Box::from_raw(no_value_ptr::<K>(link)));
    } else {
        drop(Box::from_raw(full_ptr::<K, V, M>(link)));
    }
}

/// Consumes a no-value entry, returning its key and next without running
/// the key destructor.
pub(crate) unsafe fn take_no_value_entry<K>(link: Link) -> (K, Link) {
    let entry = Box::from_raw(no_value_ptr::<K>(link));
    let NoValueEntry { key, next } = *entry;
    (key, next)
}

/// Moves an allocated entry into a fresh allocation, preserving the tag.
/// Inline keys have no allocation to move.
pub(crate) unsafe fn relocate_entry<K, V, M>(link: Link) -> Link {
    if link.is_key() {
        link
    } else if link.is_no_value() {
        let old = Box::from_raw(no_value_ptr::<K>(link));
        let ptr = Box::into_raw(Box::new(*old)) as usize;
        debug_assert_eq!(ptr & ENTRY_PTR_MASK, 0);
        Link(ptr | ENTRY_PTR_NO_VALUE)
    } else {
        let old = Box::from_raw(full_ptr::<K, V, M>(link));
        let ptr = Box::into_raw(Box::new(*old)) as usize;
        debug_assert_eq!(ptr & ENTRY_PTR_MASK, 0);
        Link(ptr)
    }
}

/// A shared handle to an entry stored in a [`Dict`][crate::Dict].
///
/// Handles are produced by lookups, iteration, sampling, and scan
/// callbacks. Field access goes through the accessors below; the entry's
/// physical representation is not observable.
pub struct EntryRef<'d, K, V, M = ()> {
    link: Link,
    _marker: PhantomData<(&'d (), *const K, *const V, *const M)>,
}

impl<K, V, M> Clone for EntryRef<'_, K, V, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V, M> Copy for EntryRef<'_, K, V, M> {}

impl<'d, K, V, M> EntryRef<'d, K, V, M> {
    pub(crate) fn new(link: Link) -> Self {
        debug_assert!(!link.is_null());
        Self {
            link,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> Link {
        self.link
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        unsafe { entry_key::<K, V, M>(&self.link) }
    }

    /// The entry's value.
    ///
    /// # Panics
    ///
    /// Panics if the entry has no value field (no-value dicts).
    pub fn value(&self) -> &V {
        assert!(self.link.is_normal(), "value access on a no-value entry");
        unsafe { &(*full_ptr::<K, V, M>(self.link)).val }
    }

    /// The entry's metadata.
    ///
    /// # Panics
    ///
    /// Panics if the entry has no metadata (no-value dicts).
    pub fn metadata(&self) -> &M {
        assert!(self.link.is_normal(), "metadata access on a no-value entry");
        unsafe { &(*full_ptr::<K, V, M>(self.link)).meta }
    }

    /// Whether the entry carries a value field.
    pub fn has_value(&self) -> bool {
        self.link.is_normal()
    }
}

/// An exclusive handle to an entry, allowing value and metadata updates.
pub struct EntryMut<'d, K, V, M = ()> {
    link: Link,
    _marker: PhantomData<(&'d mut (), *const K, *const V, *const M)>,
}

impl<'d, K, V, M> EntryMut<'d, K, V, M> {
    pub(crate) fn new(link: Link) -> Self {
        debug_assert!(!link.is_null());
        Self {
            link,
            _marker: PhantomData,
        }
    }

    /// The entry's key.
    pub fn key(&self) -> &K {
        unsafe { entry_key::<K, V, M>(&self.link) }
    }

    /// The entry's value.
    ///
    /// # Panics
    ///
    /// Panics if the entry has no value field.
    pub fn value(&self) -> &V {
        assert!(self.link.is_normal(), "value access on a no-value entry");
        unsafe { &(*full_ptr::<K, V, M>(self.link)).val }
    }

    /// Mutable access to the entry's value.
    ///
    /// # Panics
    ///
    /// Panics if the entry has no value field.
    pub fn value_mut(&mut self) -> &mut V {
        assert!(self.link.is_normal(), "value access on a no-value entry");
        unsafe { &mut (*full_ptr::<K, V, M>(self.link)).val }
    }

    /// Installs a new value, returning the old one. The new value is in
    /// place before the old one is released, so a value that aliases the
    /// old one (reference counting) stays live throughout.
    pub fn set_value(&mut self, val: V) -> V {
        mem::replace(self.value_mut(), val)
    }

    /// Mutable access to the entry's metadata.
    ///
    /// # Panics
    ///
    /// Panics if the entry has no metadata.
    pub fn metadata_mut(&mut self) -> &mut M {
        assert!(self.link.is_normal(), "metadata access on a no-value entry");
        unsafe { &mut (*full_ptr::<K, V, M>(self.link)).meta }
    }

    /// Downgrades to a shared handle.
    pub fn into_ref(self) -> EntryRef<'d, K, V, M> {
        EntryRef::new(self.link)
    }
}

/// An entry unlinked from its dict but not yet released.
///
/// Returned by [`Dict::unlink`][crate::Dict::unlink]. Dropping it runs the
/// key and value destructors and frees the backing allocation;
/// [`into_parts`][Self::into_parts] hands both back to the caller instead.
pub struct DetachedEntry<K, V, M = ()> {
    link: Link,
    _marker: PhantomData<(K, V, M)>,
}

impl<K, V, M> DetachedEntry<K, V, M> {
    pub(crate) fn new(link: Link) -> Self {
        debug_assert!(!link.is_null());
        Self {
            link,
            _marker: PhantomData,
        }
    }

    /// The detached entry's key.
    pub fn key(&self) -> &K {
        unsafe { entry_key::<K, V, M>(&self.link) }
    }

    /// The detached entry's value, if it has a value field.
    pub fn value(&self) -> Option<&V> {
        if self.link.is_normal() {
            Some(unsafe { &(*full_ptr::<K, V, M>(self.link)).val })
        } else {
            None
        }
    }

    /// Consumes the entry, returning its key and value.
    pub fn into_parts(self) -> (K, Option<V>) {
        let link = self.link;
        mem::forget(self);
        unsafe {
            if link.is_key() {
                (word_into_key::<K>(link), None)
            } else if link.is_no_value() {
                let (key, _) = take_no_value_entry::<K>(link);
                (key, None)
            } else {
                let entry = Box::from_raw(full_ptr::<K, V, M>(link));
                let FullEntry { key, val, .. } = *entry;
                (key, Some(val))
            }
        }
    }
}

impl<K, V, M> Drop for DetachedEntry<K, V, M> {
    fn drop(&mut self) {
        unsafe { free_entry::<K, V, M>(self.link) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    #[test]
    fn normal_entry_round_trip() {
        let link = new_full_entry::<_, _, ()>("alpha", 7u64, Link::NULL);
        assert!(link.is_normal() && !link.is_key() && !link.is_no_value());
        assert_eq!(link.0 & ENTRY_PTR_MASK, ENTRY_PTR_NORMAL);
        unsafe {
            assert_eq!(*entry_key::<&str, u64, ()>(&link), "alpha");
            assert_eq!((*full_ptr::<&str, u64, ()>(link)).val, 7);
            assert!(entry_next::<&str, u64, ()>(link).is_null());
            free_entry::<&str, u64, ()>(link);
        }
    }

    #[test]
    fn no_value_entry_round_trip() {
        let tail = new_no_value_entry("tail", Link::NULL);
        let head = new_no_value_entry("head", tail);
        assert!(head.is_no_value());
        assert_eq!(head.0 & ENTRY_PTR_MASK, ENTRY_PTR_NO_VALUE);
        unsafe {
            assert_eq!(*entry_key::<&str, (), ()>(&head), "head");
            assert_eq!(entry_next::<&str, (), ()>(head), tail);
            free_entry::<&str, (), ()>(head);
            free_entry::<&str, (), ()>(tail);
        }
    }

    #[test]
    fn inline_key_round_trip() {
        let key = NonZeroUsize::new(0x1001).unwrap();
        let link = key_into_word(key);
        assert!(link.is_key());
        unsafe {
            assert_eq!(word_as_key::<NonZeroUsize>(&link).get(), 0x1001);
            assert_eq!(word_into_key::<NonZeroUsize>(link).get(), 0x1001);
        }
        assert!(entry_next_is_null(link));
    }

    fn entry_next_is_null(link: Link) -> bool {
        unsafe { entry_next::<NonZeroUsize, (), ()>(link).is_null() }
    }

    #[test]
    #[should_panic(expected = "clear low bit")]
    fn even_inline_key_is_rejected() {
        key_into_word(NonZeroUsize::new(0x1000).unwrap());
    }

    #[test]
    fn relocation_preserves_contents_and_tag() {
        let link = new_full_entry::<_, _, ()>(String::from("k"), 9i32, Link::NULL);
        let moved = unsafe { relocate_entry::<String, i32, ()>(link) };
        assert_ne!(moved, link);
        assert!(moved.is_normal());
        unsafe {
            assert_eq!(entry_key::<String, i32, ()>(&moved), "k");
            assert_eq!((*full_ptr::<String, i32, ()>(moved)).val, 9);
            free_entry::<String, i32, ()>(moved);
        }

        let link = new_no_value_entry(String::from("n"), Link::NULL);
        let moved = unsafe { relocate_entry::<String, (), ()>(link) };
        assert!(moved.is_no_value());
        unsafe {
            assert_eq!(entry_key::<String, (), ()>(&moved), "n");
            free_entry::<String, (), ()>(moved);
        }
    }

    #[test]
    fn detached_entry_releases_parts() {
        let link = new_full_entry::<_, _, ()>(String::from("k"), String::from("v"), Link::NULL);
        let detached = DetachedEntry::<String, String>::new(link);
        assert_eq!(detached.key(), "k");
        assert_eq!(detached.value().map(String::as_str), Some("v"));
        let (k, v) = detached.into_parts();
        assert_eq!(k, "k");
        assert_eq!(v.as_deref(), Some("v"));
    }
}
