// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address arithmetic and user-memory access checking for the two-level page
//! table, separated from the kernel so it can be tested on the host without
//! any kernel types.

// Allow std-y things to be used in test. Note that this attribute is a bit of a
// trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;
/// Size of a page, in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Bytes of virtual address space covered by one directory entry.
pub const DIR_SPAN: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Index into the page directory for `addr` (bits 22..32).
#[inline(always)]
pub const fn dir_index(addr: usize) -> usize {
    (addr >> 22) & 0x3FF
}

/// Index into the page table for `addr` (bits 12..22).
#[inline(always)]
pub const fn table_index(addr: usize) -> usize {
    (addr >> PAGE_SHIFT) & 0x3FF
}

/// Offset of `addr` within its page.
#[inline(always)]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Reassembles a virtual address from directory and table indices.
#[inline(always)]
pub const fn page_addr(dir: usize, table: usize) -> usize {
    (dir << 22) | (table << PAGE_SHIFT)
}

#[inline(always)]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to a page boundary, or `None` if that would wrap.
#[inline(always)]
pub const fn page_round_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(a) => Some(page_round_down(a)),
        None => None,
    }
}

/// Returns the page-aligned range `[start, end)` covering `size` bytes at
/// `base`, or `None` if the range wraps the address space.
pub fn page_span(base: usize, size: usize) -> Option<(usize, usize)> {
    let end = page_round_up(base.checked_add(size)?)?;
    Some((page_round_down(base), end))
}

/// Describes types that act as "slices" (in the very abstract sense) referenced
/// by processes in syscalls.
///
/// This is not the same thing as a Rust slice in the kernel, because this is
/// just a base-length pair --- taken by itself, it doesn't let you actually
/// _access_ the memory.
///
/// # Invariants
///
/// `s.is_empty()` implies `s.base_addr() == s.end_addr()`, and vice versa.
///
/// `s.base_addr() <= s.end_addr()` must hold.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes. Empty slices are opted out of
    /// access checking to allow user code to pass null buffers with a zero
    /// length.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice, past the
    /// end.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Iterator over the pieces of a user slice that fall within a single page.
///
/// Yields `(address, length)` pairs in ascending order. Concatenating them
/// gives back the original slice.
#[derive(Clone, Debug)]
pub struct PageChunks {
    next: usize,
    end: usize,
}

impl Iterator for PageChunks {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let page_end = page_round_down(self.next).saturating_add(PAGE_SIZE);
        let chunk_end = usize::min(page_end, self.end);
        let chunk = (self.next, chunk_end - self.next);
        self.next = chunk_end;
        Some(chunk)
    }
}

/// Splits `slice` at page boundaries.
pub fn page_chunks(slice: impl UserSlice) -> PageChunks {
    PageChunks {
        next: slice.base_addr(),
        end: slice.end_addr(),
    }
}

/// Generic version of the kernel slice access checking code.
///
/// Determines whether a process can access the memory described by `slice`,
/// given a way to look up the leaf page-table entry for a page. `lookup` is
/// called with the page-aligned address of each page the slice touches and
/// returns `None` when no entry (or no page table) exists. `page_ok` decides
/// whether an existing entry grants the access being asked for.
///
/// The exact entry type `E` is left unspecified here, to avoid needing to rely
/// on kernel-internal types.
///
/// # Returns
///
/// `true` if every page touched by `slice` has an entry that satisfies
/// `page_ok`, or if `slice` is empty.
///
/// `false` otherwise.
#[must_use]
pub fn can_access<S, E>(
    slice: S,
    mut lookup: impl FnMut(usize) -> Option<E>,
    page_ok: impl Fn(&E) -> bool,
) -> bool
where
    S: UserSlice,
{
    if slice.is_empty() {
        // Empty slices confer no authority, so we don't look at their
        // (frequently nonsense) base address at all.
        return true;
    }

    page_chunks(slice).all(|(addr, _)| {
        lookup(page_round_down(addr)).is_some_and(|e| page_ok(&e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct TestSlice {
        base: usize,
        size: usize,
    }

    impl UserSlice for TestSlice {
        fn is_empty(&self) -> bool {
            self.size == 0
        }

        fn base_addr(&self) -> usize {
            self.base
        }

        fn end_addr(&self) -> usize {
            self.base + self.size
        }
    }

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Perm {
        ReadOnly,
        ReadWrite,
    }

    fn make_fake_page_map() -> BTreeMap<usize, Perm> {
        let mut map = BTreeMap::new();
        // Three contiguous writable pages, a hole, then a read-only page.
        map.insert(0x4000_1000, Perm::ReadWrite);
        map.insert(0x4000_2000, Perm::ReadWrite);
        map.insert(0x4000_3000, Perm::ReadWrite);
        map.insert(0x4000_5000, Perm::ReadOnly);
        map
    }

    fn writable(p: &Perm) -> bool {
        *p == Perm::ReadWrite
    }

    #[test]
    fn index_helpers_split_an_address() {
        let addr = 0x4000_8123;
        assert_eq!(dir_index(addr), 0x100);
        assert_eq!(table_index(addr), 0x8);
        assert_eq!(page_offset(addr), 0x123);
        assert_eq!(
            page_addr(dir_index(addr), table_index(addr)) + page_offset(addr),
            addr
        );
    }

    #[test]
    fn rounding_is_idempotent_on_aligned_addresses() {
        for addr in [0, 0x1000, 0x4000_8000] {
            assert_eq!(page_round_down(addr), addr);
            assert_eq!(page_round_up(addr), Some(addr));
        }
        assert_eq!(page_round_up(0x1001), Some(0x2000));
        assert_eq!(page_round_up(usize::MAX), None);
    }

    #[test]
    fn page_span_covers_partial_pages_at_both_ends() {
        assert_eq!(page_span(0x4000_0ff0, 0x20), Some((0x4000_0000, 0x4000_2000)));
        assert_eq!(page_span(0x4000_0000, 0x1000), Some((0x4000_0000, 0x4000_1000)));
        assert_eq!(page_span(0x4000_0000, 0), Some((0x4000_0000, 0x4000_0000)));
        assert_eq!(page_span(usize::MAX - 4, 16), None);
    }

    #[test]
    fn chunks_never_cross_a_page_boundary() {
        let chunks: Vec<_> = page_chunks(TestSlice {
            base: 0x4000_1ff0,
            size: 0x1020,
        })
        .collect();
        assert_eq!(
            chunks,
            vec![(0x4000_1ff0, 0x10), (0x4000_2000, 0x1000), (0x4000_3000, 0x10)]
        );
        for (i, (addr, len)) in chunks.iter().enumerate() {
            assert_eq!(
                page_round_down(*addr),
                page_round_down(addr + len - 1),
                "chunk {i} crosses a page"
            );
        }
    }

    #[test]
    fn can_access_slice_spanning_contiguous_good_pages() {
        let map = make_fake_page_map();
        assert!(
            can_access(
                TestSlice {
                    base: 0x4000_1800,
                    size: 0x2000,
                },
                |page| map.get(&page).copied(),
                writable,
            ),
            "should be able to write across three mapped pages but cannot",
        );
    }

    #[test]
    fn cannot_access_across_a_hole() {
        let map = make_fake_page_map();
        assert!(
            // load-bearing tiny punctuation character:
            !can_access(
                TestSlice {
                    base: 0x4000_3ff0,
                    size: 0x20,
                },
                |page| map.get(&page).copied(),
                |_| true,
            ),
            "should NOT be able to access a slice running into unmapped memory",
        );
    }

    #[test]
    fn cannot_write_read_only_page() {
        let map = make_fake_page_map();
        let slice = || TestSlice {
            base: 0x4000_5000,
            size: 4,
        };
        assert!(can_access(slice(), |page| map.get(&page).copied(), |_| true));
        assert!(
            !can_access(slice(), |page| map.get(&page).copied(), writable),
            "should NOT be able to write a read-only page but can",
        );
    }

    #[test]
    fn empty_slices_are_always_ok() {
        assert!(can_access(
            TestSlice { base: 0, size: 0 },
            |_| None::<Perm>,
            |_| false,
        ));
    }
}
