// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! The kernel never dereferences a user address. Everything here checks the
//! process's page tables first and then goes through the frame allocator's view
//! of physical memory, one page at a time.

use core::marker::PhantomData;

use abi::{FaultInfo, FaultSource, UsageError};
use kerncore::{page_offset, PAGE_SIZE};

use crate::fault;
use crate::frame::FrameAllocator;
use crate::paging::{AddressSpace, PageTableEntry};

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` is passed into the kernel by a process, and is intended to refer
/// to memory that process controls -- for instance, as a place where the kernel
/// can deposit a result. However, the `USlice` type itself simply represents an
/// _allegation_ from the process that a section of address space is suitable;
/// it does _not_ demonstrate that the process has access to that memory. It
/// could point into the kernel half, at nothing, etc.
///
/// Having a `USlice<T>` tells you the following:
///
/// - Some process has claimed it has access to a section of address space
///   (delimited by the `USlice`).
/// - The base of the section is correctly aligned for type `T`.
/// - The section does not wrap around the end of the 32-bit address space.
///
/// To actually access the memory referred to by a `USlice`, hand it to
/// `copy_from_user` or `copy_to_user`, which check the page tables.
pub struct USlice<T> {
    /// Base address of the slice.
    base_address: usize,
    /// Number of `T` elements in the slice.
    length: usize,
    /// since we don't actually use T...
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not overlap or touch the
    /// top of the address space, and if `base_address` is correctly aligned for
    /// `T`.
    ///
    /// This method will categorically reject zero-sized T.
    pub fn from_raw(base_address: u32, length: u32) -> Result<Self, UsageError> {
        // NOTE: the properties checked here are critical for the correctness of
        // this type. Think carefully before loosening any of them, or adding a
        // second way to construct a USlice.

        // ZST check, should resolve at compile time:
        uassert!(core::mem::size_of::<T>() != 0);

        let base_address = base_address as usize;
        let length = length as usize;
        if base_address % core::mem::align_of::<T>() != 0 {
            return Err(UsageError::InvalidSlice);
        }
        // Check that a slice of `length` `T`s can even exist starting at
        // `base_address`, without wrapping around. The arithmetic is done in
        // the user's 32-bit address space even when the kernel's `usize` is
        // wider.
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>())
            .filter(|&n| n <= u32::MAX as usize)
            .ok_or(UsageError::InvalidSlice)?;
        let highest_possible_base = u32::MAX as usize - size_in_bytes;
        if base_address <= highest_possible_base {
            Ok(Self {
                base_address,
                length,
                _marker: PhantomData,
            })
        } else {
            Err(UsageError::InvalidSlice)
        }
    }

    /// Returns `true` if this slice is zero-length, `false` otherwise.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns the bottom address of this slice as a `usize`.
    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    /// Returns the end address of the slice, which is the address one past its
    /// final byte -- or its base address if it's empty.
    pub fn end_addr(&self) -> usize {
        // Overflow was ruled out at construction.
        self.base_address + self.length * core::mem::size_of::<T>()
    }

    fn size_in_bytes(&self) -> usize {
        self.length * core::mem::size_of::<T>()
    }
}

impl<T> Clone for USlice<T> {
    fn clone(&self) -> Self {
        Self {
            base_address: self.base_address,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

/// Can't `derive(Debug)` for `USlice` because that puts a `Debug` requirement
/// on `T`, and that's silly.
impl<T> core::fmt::Debug for USlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("USlice")
            .field("base_address", &self.base_address)
            .field("length", &self.length)
            .finish()
    }
}

/// Compatibility with the generic portable algorithms in `kerncore`.
impl<T> kerncore::UserSlice for USlice<T> {
    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn base_addr(&self) -> usize {
        self.base_addr()
    }

    fn end_addr(&self) -> usize {
        self.end_addr()
    }
}

fn access_fault(address: usize) -> FaultInfo {
    FaultInfo::MemoryAccess {
        address: address as u32,
        source: FaultSource::Kernel,
    }
}

fn user_readable(e: &PageTableEntry) -> bool {
    e.is_user()
}

/// Copy-on-write pages count as writable: the copy breaks the sharing first.
fn user_writable(e: &PageTableEntry) -> bool {
    e.is_user() && (e.is_writable() || e.is_cow())
}

fn check_access<T>(
    frames: &FrameAllocator,
    space: AddressSpace,
    slice: &USlice<T>,
    page_ok: impl Fn(&PageTableEntry) -> bool,
) -> Result<(), FaultInfo> {
    let ok = kerncore::can_access(
        slice,
        |page| space.leaf(frames, page as u32),
        page_ok,
    );
    if ok {
        Ok(())
    } else {
        Err(access_fault(slice.base_addr()))
    }
}

/// Tests whether `space` lets the kernel write all of `slice`
/// on its behalf.
#[must_use]
pub fn is_user_writable<T>(
    frames: &FrameAllocator,
    space: AddressSpace,
    slice: &USlice<T>,
) -> bool {
    check_access(frames, space, slice, user_writable).is_ok()
}

/// Hands the bytes of `src` to `f`, one page-sized (or smaller) piece at a
/// time, after checking that the whole slice is user-readable. If any of it is
/// not, `f` is never called.
pub fn read_user_chunks<T>(
    frames: &FrameAllocator,
    space: AddressSpace,
    src: &USlice<T>,
    mut f: impl FnMut(&[u8]),
) -> Result<(), FaultInfo> {
    check_access(frames, space, src, user_readable)?;
    for (addr, len) in kerncore::page_chunks(src) {
        let Some(pte) = space.leaf(frames, addr as u32) else {
            return Err(access_fault(addr));
        };
        let off = page_offset(addr);
        f(&frames.bytes(pte.frame())[off..off + len]);
    }
    Ok(())
}

/// Copies the contents of user slice `src` into `dst`, which must be the same
/// size.
pub fn copy_from_user(
    frames: &FrameAllocator,
    space: AddressSpace,
    src: &USlice<u8>,
    dst: &mut [u8],
) -> Result<(), FaultInfo> {
    uassert!(dst.len() == src.size_in_bytes());
    let mut done = 0;
    read_user_chunks(frames, space, src, |chunk| {
        dst[done..done + chunk.len()].copy_from_slice(chunk);
        done += chunk.len();
    })
}

/// Copies `src` into user slice `dst`, which must be the same size.
///
/// Either every byte is written or none is. Copy-on-write pages in the
/// destination get their own frame first, exactly as if the process had
/// written to them itself.
pub fn copy_to_user(
    frames: &mut FrameAllocator,
    space: AddressSpace,
    dst: &USlice<u8>,
    src: &[u8],
) -> Result<(), FaultInfo> {
    uassert!(src.len() == dst.size_in_bytes());
    check_access(frames, space, dst, user_writable)?;
    for (addr, _) in kerncore::page_chunks(dst) {
        let page = addr as u32;
        if space.leaf(frames, page).is_some_and(|e| e.is_cow()) {
            fault::break_cow(frames, space, page);
        }
    }
    space.write_bytes(frames, dst.base_addr() as u32, src);
    Ok(())
}

/// Reads a NUL-terminated string starting at user address `addr` into `buf`.
///
/// Returns the string's length (excluding the NUL), or `None` if `buf` fills
/// up before a NUL turns up. Pages past the terminator are never touched.
pub fn read_user_cstr(
    frames: &FrameAllocator,
    space: AddressSpace,
    addr: u32,
    buf: &mut [u8],
) -> Result<Option<usize>, FaultInfo> {
    let mut n = 0;
    let mut addr = addr as usize;
    while n < buf.len() {
        let Some(pte) = space
            .leaf(frames, addr as u32)
            .filter(|e| user_readable(e))
        else {
            return Err(access_fault(addr));
        };
        let off = page_offset(addr);
        let avail = usize::min(PAGE_SIZE - off, buf.len() - n);
        let bytes = &frames.bytes(pte.frame())[off..off + avail];
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            buf[n..n + nul].copy_from_slice(&bytes[..nul]);
            return Ok(Some(n + nul));
        }
        buf[n..n + avail].copy_from_slice(bytes);
        n += avail;
        addr += avail;
        if addr > u32::MAX as usize {
            return Err(access_fault(addr - 1));
        }
    }
    Ok(None)
}
