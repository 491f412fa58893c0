// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two-level i386 page tables.
//!
//! An `AddressSpace` is a page directory frame. Each present directory entry
//! names a page table frame, and each present table entry names the frame
//! backing one 4 KiB page. All of these are reached through the frame
//! allocator's physical memory capability, so the kernel can edit any address
//! space, not just the active one.
//!
//! The kernel half (the identity map of physical memory) is built once into the
//! kernel directory and its directory entries are copied verbatim into every
//! other address space. Those entries never carry `USER`, and everything that
//! walks an address space to copy or free it skips them.

use core::fmt;

use kerncore::{
    dir_index, page_addr, page_offset, table_index, ENTRIES_PER_TABLE,
    PAGE_SIZE,
};

use crate::arch;
use crate::fail;
use crate::frame::{FrameAllocator, FrameId};

bitflags::bitflags! {
    /// Bits of a directory or table entry that the kernel uses.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Software-defined: the page is shared copy-on-write. Always paired
        /// with `WRITABLE` being clear.
        const COW = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Permissions requested when mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
    }
}

impl From<MapFlags> for PteFlags {
    fn from(m: MapFlags) -> Self {
        let mut f = PteFlags::PRESENT;
        f.set(PteFlags::WRITABLE, m.contains(MapFlags::WRITE));
        f.set(PteFlags::USER, m.contains(MapFlags::USER));
        f
    }
}

/// One directory or table entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    const FRAME_MASK: u32 = 0xFFFF_F000;

    pub fn new(frame: FrameId, flags: PteFlags) -> Self {
        Self(frame.paddr() | flags.bits())
    }

    pub fn frame(self) -> FrameId {
        FrameId::containing(self.0 & Self::FRAME_MASK)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Same frame, different flags.
    pub fn with_flags(self, flags: PteFlags) -> Self {
        Self::new(self.frame(), flags)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PteFlags::USER)
    }

    pub fn is_cow(self) -> bool {
        self.flags().contains(PteFlags::COW)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

fn entry(frames: &FrameAllocator, table: FrameId, i: usize) -> PageTableEntry {
    PageTableEntry(frames.words(table)[i])
}

fn set_entry(
    frames: &mut FrameAllocator,
    table: FrameId,
    i: usize,
    e: PageTableEntry,
) {
    frames.words_mut(table)[i] = e.0;
}

/// Page-aligned addresses covering `size` bytes from `start`.
fn pages(start: u32, size: usize) -> impl Iterator<Item = u32> {
    let span = kerncore::page_span(start as usize, size)
        .filter(|&(_, hi)| hi as u64 <= 1 << 32);
    let Some((lo, hi)) = span else {
        fail::die(format_args!(
            "region {start:#x}+{size:#x} wraps the address space"
        ));
    };
    (lo..hi).step_by(PAGE_SIZE).map(|va| va as u32)
}

/// Handle to a page directory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressSpace {
    dir: FrameId,
}

impl AddressSpace {
    /// Builds the kernel's own directory, identity-mapping physical memory
    /// from the second page up to `phys_top` as supervisor read/write. Page 0
    /// stays unmapped so that null dereferences fault.
    pub fn new_kernel(frames: &mut FrameAllocator, phys_top: u32) -> Self {
        let space = Self {
            dir: frames.allocate(),
        };
        let base = PAGE_SIZE as u32;
        if phys_top > base {
            space.map_region(
                frames,
                base,
                base,
                (phys_top - base) as usize,
                MapFlags::WRITE,
            );
        }
        space
    }

    /// Builds an empty user address space sharing `kernel`'s kernel half.
    pub fn new_user(frames: &mut FrameAllocator, kernel: AddressSpace) -> Self {
        let space = Self {
            dir: frames.allocate(),
        };
        space.copy_kernel_half(frames, kernel);
        space
    }

    pub fn directory(&self) -> FrameId {
        self.dir
    }

    fn copy_kernel_half(&self, frames: &mut FrameAllocator, from: AddressSpace) {
        for di in 0..ENTRIES_PER_TABLE {
            let pde = entry(frames, from.dir, di);
            if pde.is_present() && !pde.is_user() {
                set_entry(frames, self.dir, di, pde);
            }
        }
    }

    /// Finds the page table covering `va`, allocating it if the directory
    /// entry is absent.
    fn table_for_mapping(
        &self,
        frames: &mut FrameAllocator,
        va: usize,
        user: bool,
    ) -> FrameId {
        let di = dir_index(va);
        let pde = entry(frames, self.dir, di);
        if pde.is_present() {
            if user && !pde.is_user() {
                fail::die(format_args!(
                    "user mapping at {va:#x} inside the kernel half"
                ));
            }
            return pde.frame();
        }
        let table = frames.allocate();
        let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
        flags.set(PteFlags::USER, user);
        set_entry(frames, self.dir, di, PageTableEntry::new(table, flags));
        table
    }

    /// Maps the page containing `vaddr` to `frame`.
    ///
    /// Mapping over a present entry is a kernel bug and stops the kernel;
    /// callers unmap first. A user mapping counts as a reference to `frame`.
    pub fn map_page(
        &self,
        frames: &mut FrameAllocator,
        vaddr: u32,
        frame: FrameId,
        flags: MapFlags,
    ) {
        let va = vaddr as usize;
        let user = flags.contains(MapFlags::USER);
        let table = self.table_for_mapping(frames, va, user);
        let ti = table_index(va);
        if entry(frames, table, ti).is_present() {
            fail::die(format_args!("remapping present page at {vaddr:#x}"));
        }
        set_entry(frames, table, ti, PageTableEntry::new(frame, flags.into()));
        if user {
            frames.add_user_ref(frame);
        }
    }

    /// Maps `size` bytes starting at `start` (widened to page boundaries) to
    /// freshly allocated, zeroed frames.
    pub fn map_region_alloc(
        &self,
        frames: &mut FrameAllocator,
        start: u32,
        size: usize,
        flags: MapFlags,
    ) {
        for va in pages(start, size) {
            let frame = frames.allocate();
            self.map_page(frames, va, frame, flags);
        }
    }

    /// Maps `size` bytes of virtual space at `vstart` onto the physical range
    /// at `pstart`, both widened to page boundaries.
    pub fn map_region(
        &self,
        frames: &mut FrameAllocator,
        vstart: u32,
        pstart: u32,
        size: usize,
        flags: MapFlags,
    ) {
        let pbase = pstart & !(PAGE_SIZE as u32 - 1);
        let vbase = vstart & !(PAGE_SIZE as u32 - 1);
        for va in pages(vstart, size) {
            let pa = pbase.wrapping_add(va - vbase);
            self.map_page(frames, va, FrameId::containing(pa), flags);
        }
    }

    /// Returns the present leaf entry mapping `vaddr`, if there is one.
    pub fn leaf(
        &self,
        frames: &FrameAllocator,
        vaddr: u32,
    ) -> Option<PageTableEntry> {
        let va = vaddr as usize;
        let pde = entry(frames, self.dir, dir_index(va));
        if !pde.is_present() {
            return None;
        }
        let pte = entry(frames, pde.frame(), table_index(va));
        pte.is_present().then_some(pte)
    }

    /// Overwrites the leaf entry for `vaddr`. The covering page table must
    /// exist.
    pub fn set_leaf(
        &self,
        frames: &mut FrameAllocator,
        vaddr: u32,
        e: PageTableEntry,
    ) {
        let va = vaddr as usize;
        let pde = entry(frames, self.dir, dir_index(va));
        if !pde.is_present() {
            fail::die(format_args!("no page table covers {vaddr:#x}"));
        }
        set_entry(frames, pde.frame(), table_index(va), e);
    }

    /// Produces a new address space with the same user contents.
    ///
    /// With `use_cow` clear every user page is copied into a fresh frame. With
    /// it set, every user page is shared: writable entries become read-only
    /// and copy-on-write in _both_ spaces, and each shared frame gains one
    /// reference for the new space.
    pub fn clone_address_space(
        &self,
        frames: &mut FrameAllocator,
        use_cow: bool,
    ) -> AddressSpace {
        let child = AddressSpace {
            dir: frames.allocate(),
        };
        child.copy_kernel_half(frames, *self);

        for di in 0..ENTRIES_PER_TABLE {
            let pde = entry(frames, self.dir, di);
            if !pde.is_present() || !pde.is_user() {
                continue;
            }
            let parent_table = pde.frame();
            let child_table = frames.allocate();
            set_entry(
                frames,
                child.dir,
                di,
                PageTableEntry::new(child_table, pde.flags()),
            );

            for ti in 0..ENTRIES_PER_TABLE {
                let pte = entry(frames, parent_table, ti);
                if !pte.is_present() || !pte.is_user() {
                    continue;
                }
                let copy = if use_cow {
                    let shared = if pte.is_writable() {
                        let f = (pte.flags() - PteFlags::WRITABLE) | PteFlags::COW;
                        let e = pte.with_flags(f);
                        set_entry(frames, parent_table, ti, e);
                        e
                    } else {
                        pte
                    };
                    frames.add_user_ref(pte.frame());
                    shared
                } else {
                    let fresh = frames.allocate();
                    frames.copy_frame(pte.frame(), fresh);
                    frames.add_user_ref(fresh);
                    PageTableEntry::new(fresh, pte.flags())
                };
                set_entry(frames, child_table, ti, copy);
            }
        }

        // The parent's entries may have lost WRITABLE.
        if use_cow {
            arch::flush_tlb();
        }
        child
    }

    /// Tears down the user half, dropping one reference on every mapped user
    /// frame, then frees the page tables and the directory. Kernel entries are
    /// left alone; they belong to every address space.
    pub fn release_address_space(self, frames: &mut FrameAllocator) {
        for di in 0..ENTRIES_PER_TABLE {
            let pde = entry(frames, self.dir, di);
            if !pde.is_present() || !pde.is_user() {
                continue;
            }
            let table = pde.frame();
            for ti in 0..ENTRIES_PER_TABLE {
                let pte = entry(frames, table, ti);
                if pte.is_present() && pte.is_user() {
                    frames.release_user_ref(pte.frame());
                }
            }
            frames.free(table);
        }
        frames.free(self.dir);
    }

    /// Copies `src` into this address space at `vaddr`, regardless of page
    /// permissions. Every page touched must already be mapped.
    pub fn write_bytes(&self, frames: &mut FrameAllocator, vaddr: u32, src: &[u8]) {
        let mut done = 0;
        for (addr, len) in kerncore::page_chunks(KernelRange(vaddr, src.len())) {
            let Some(pte) = self.leaf(frames, addr as u32) else {
                fail::die(format_args!("kernel write to unmapped {addr:#x}"));
            };
            let off = page_offset(addr);
            frames.bytes_mut(pte.frame())[off..off + len]
                .copy_from_slice(&src[done..done + len]);
            done += len;
        }
    }

    /// Copies bytes out of this address space at `vaddr`, regardless of page
    /// permissions. Every page touched must already be mapped.
    pub fn read_bytes(&self, frames: &FrameAllocator, vaddr: u32, dst: &mut [u8]) {
        let mut done = 0;
        for (addr, len) in kerncore::page_chunks(KernelRange(vaddr, dst.len())) {
            let Some(pte) = self.leaf(frames, addr as u32) else {
                fail::die(format_args!("kernel read of unmapped {addr:#x}"));
            };
            let off = page_offset(addr);
            dst[done..done + len]
                .copy_from_slice(&frames.bytes(pte.frame())[off..off + len]);
            done += len;
        }
    }

    /// Walks every present mapping, merging runs of pages that are contiguous
    /// and carry identical permissions.
    pub fn mapped_ranges<'a>(&self, frames: &'a FrameAllocator) -> MappedRanges<'a> {
        MappedRanges {
            frames,
            dir: self.dir,
            next_page: 0,
        }
    }
}

/// Kernel-side byte range, for reusing the page chunking in `kerncore`.
struct KernelRange(u32, usize);

impl kerncore::UserSlice for KernelRange {
    fn is_empty(&self) -> bool {
        self.1 == 0
    }

    fn base_addr(&self) -> usize {
        self.0 as usize
    }

    fn end_addr(&self) -> usize {
        self.0 as usize + self.1
    }
}

/// A run of mapped pages with the same effective permissions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappedRange {
    pub start: u32,
    pub pages: u32,
    /// Effective permissions: `USER` only if both levels grant it.
    pub flags: PteFlags,
}

impl MappedRange {
    /// First address past the range. May be 2^32.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.pages) * PAGE_SIZE as u64
    }
}

impl fmt::Display for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let user = if self.flags.contains(PteFlags::USER) { "u" } else { "" };
        let access = if self.flags.contains(PteFlags::WRITABLE) {
            "rw"
        } else {
            "r"
        };
        write!(f, "{:#010x}-{:#010x} {user}{access}", self.start, self.end())?;
        if self.flags.contains(PteFlags::COW) {
            write!(f, " cow")?;
        }
        Ok(())
    }
}

const PAGES_IN_SPACE: usize = ENTRIES_PER_TABLE * ENTRIES_PER_TABLE;

pub struct MappedRanges<'a> {
    frames: &'a FrameAllocator,
    dir: FrameId,
    next_page: usize,
}

impl Iterator for MappedRanges<'_> {
    type Item = MappedRange;

    fn next(&mut self) -> Option<MappedRange> {
        let mut run: Option<MappedRange> = None;
        while self.next_page < PAGES_IN_SPACE {
            let di = self.next_page / ENTRIES_PER_TABLE;
            let ti = self.next_page % ENTRIES_PER_TABLE;
            let pde = entry(self.frames, self.dir, di);
            if !pde.is_present() {
                if run.is_some() {
                    return run;
                }
                self.next_page = (di + 1) * ENTRIES_PER_TABLE;
                continue;
            }
            let pte = entry(self.frames, pde.frame(), ti);
            if !pte.is_present() {
                self.next_page += 1;
                if run.is_some() {
                    return run;
                }
                continue;
            }

            let mut flags = pte.flags()
                & (PteFlags::PRESENT
                    | PteFlags::WRITABLE
                    | PteFlags::USER
                    | PteFlags::COW);
            if !pde.is_user() {
                flags.remove(PteFlags::USER);
            }
            if let Some(r) = run.as_mut() {
                if r.flags != flags {
                    return run;
                }
                r.pages += 1;
            } else {
                run = Some(MappedRange {
                    start: page_addr(di, ti) as u32,
                    pages: 1,
                    flags,
                });
            }
            self.next_page += 1;
        }
        run
    }
}
