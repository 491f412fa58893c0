// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical frame allocator.
//!
//! Frames are identified by number; the physical base address of frame `n` is
//! `n * PAGE_SIZE`. Free frames are chained through a metadata table indexed
//! by frame number, so the allocator never stores anything inside the memory it
//! manages. The same table carries each frame's user reference count, which is
//! what makes copy-on-write sharing work.
//!
//! The allocator also owns the `PhysMemory` capability, since handing out a
//! frame and reading or writing its contents are the same concern.

use crate::arch::PhysMemory;
use crate::fail;

/// Number of 32-bit words in a frame. Page tables and directories are viewed
/// this way.
pub const WORDS_PER_FRAME: usize = abi::PAGE_SIZE / 4;

/// Names one physical frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct FrameId(u32);

impl FrameId {
    pub const fn from_number(n: u32) -> Self {
        Self(n)
    }

    /// Frame containing physical address `paddr`.
    pub const fn containing(paddr: u32) -> Self {
        Self(paddr >> kerncore::PAGE_SHIFT)
    }

    pub const fn number(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Physical base address.
    pub const fn paddr(self) -> u32 {
        self.0 << kerncore::PAGE_SHIFT
    }
}

const NO_FRAME: u32 = u32::MAX;

/// Per-frame bookkeeping.
#[derive(Copy, Clone, Debug)]
pub struct FrameMeta {
    /// Next frame on the free list, or `NO_FRAME`. Meaningless unless `free`.
    next_free: u32,
    /// Present user-accessible leaf entries pointing at this frame, across all
    /// address spaces.
    refcount_user: u32,
    free: bool,
}

impl FrameMeta {
    pub const EMPTY: Self = Self {
        next_free: NO_FRAME,
        refcount_user: 0,
        free: false,
    };
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::EMPTY
    }
}

pub struct FrameAllocator {
    mem: PhysMemory,
    meta: &'static mut [FrameMeta],
    /// First frame that may ever be handed out. Everything below holds the
    /// kernel image and boot data.
    first_usable: u32,
    free_head: u32,
    free_count: usize,
}

impl FrameAllocator {
    /// Builds an allocator over `mem`, using `meta` (one entry per frame) for
    /// bookkeeping. Frames below `reserved` are never handed out; frame 0 is
    /// always treated as reserved.
    pub fn new(
        mem: PhysMemory,
        meta: &'static mut [FrameMeta],
        reserved: usize,
    ) -> Self {
        let total = mem.frame_count();
        uassert!(meta.len() >= total);
        uassert!(total < NO_FRAME as usize);
        let first_usable = reserved.clamp(1, total);

        let mut this = Self {
            mem,
            meta,
            first_usable: first_usable as u32,
            free_head: NO_FRAME,
            free_count: 0,
        };
        for m in this.meta.iter_mut() {
            *m = FrameMeta::EMPTY;
        }
        // Push in descending order so that allocation hands out low frames
        // first, which keeps dumps readable.
        for n in (first_usable..total).rev() {
            this.push_free(n as u32);
        }
        this
    }

    /// Total frames in physical memory, reserved ones included.
    pub fn frame_count(&self) -> usize {
        self.mem.frame_count()
    }

    /// Removes a frame from the free set and returns it, zero-filled.
    ///
    /// Running out of frames stops the kernel.
    pub fn allocate(&mut self) -> FrameId {
        let Some(frame) = self.try_allocate() else {
            fail::die("out of physical frames");
        };
        frame
    }

    fn try_allocate(&mut self) -> Option<FrameId> {
        if self.free_head == NO_FRAME {
            return None;
        }
        let n = self.free_head;
        let m = &mut self.meta[n as usize];
        uassert!(m.free && m.refcount_user == 0);
        self.free_head = m.next_free;
        m.next_free = NO_FRAME;
        m.free = false;
        self.free_count -= 1;

        let frame = FrameId(n);
        self.mem.words_mut(frame).fill(0);
        Some(frame)
    }

    /// Returns `frame` to the free set.
    ///
    /// The frame must be allocated, unreferenced by any user mapping, and not
    /// reserved; anything else means kernel state is corrupt and stops the
    /// kernel.
    pub fn free(&mut self, frame: FrameId) {
        let n = frame.number();
        if n < self.first_usable || frame.index() >= self.frame_count() {
            fail::die(format_args!("freeing reserved frame {n:#x}"));
        }
        let m = &self.meta[frame.index()];
        if m.free {
            fail::die(format_args!("double free of frame {n:#x}"));
        }
        if m.refcount_user != 0 {
            fail::die(format_args!(
                "freeing frame {n:#x} with {} user references",
                m.refcount_user
            ));
        }
        self.push_free(n);
    }

    fn push_free(&mut self, n: u32) {
        let m = &mut self.meta[n as usize];
        m.free = true;
        m.next_free = self.free_head;
        self.free_head = n;
        self.free_count += 1;
    }

    /// Counts the free set by walking it.
    ///
    /// This is a diagnostic; it also cross-checks the running count.
    pub fn available_count(&self) -> usize {
        let mut count = 0;
        let mut n = self.free_head;
        while n != NO_FRAME {
            let m = &self.meta[n as usize];
            uassert!(m.free);
            count += 1;
            uassert!(count <= self.frame_count());
            n = m.next_free;
        }
        uassert!(count == self.free_count);
        count
    }

    pub fn is_free(&self, frame: FrameId) -> bool {
        self.meta[frame.index()].free
    }

    pub fn user_refcount(&self, frame: FrameId) -> u32 {
        self.meta[frame.index()].refcount_user
    }

    /// Records one more user mapping of `frame`.
    pub fn add_user_ref(&mut self, frame: FrameId) {
        let m = &mut self.meta[frame.index()];
        uassert!(!m.free);
        m.refcount_user += 1;
    }

    /// Drops one user mapping of `frame`, freeing the frame when that was the
    /// last one. Returns the remaining count.
    pub fn release_user_ref(&mut self, frame: FrameId) -> u32 {
        let m = &mut self.meta[frame.index()];
        if m.refcount_user == 0 {
            fail::die(format_args!(
                "unbalanced release of frame {:#x}",
                frame.number()
            ));
        }
        m.refcount_user -= 1;
        let remaining = m.refcount_user;
        if remaining == 0 {
            self.free(frame);
        }
        remaining
    }

    pub fn words(&self, frame: FrameId) -> &[u32; WORDS_PER_FRAME] {
        self.mem.words(frame)
    }

    pub fn words_mut(&mut self, frame: FrameId) -> &mut [u32; WORDS_PER_FRAME] {
        self.mem.words_mut(frame)
    }

    pub fn bytes(&self, frame: FrameId) -> &[u8] {
        self.mem.bytes(frame)
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        self.mem.bytes_mut(frame)
    }

    /// Copies the whole of `from` over `to`.
    pub fn copy_frame(&mut self, from: FrameId, to: FrameId) {
        uassert!(from != to);
        let contents = *self.mem.words(from);
        *self.mem.words_mut(to) = contents;
    }
}
