// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page fault resolution.
//!
//! The only fault this kernel resolves is a write to a copy-on-write page.
//! Everything else is reported back to the dispatcher, which stops the kernel.

use abi::{FaultInfo, FaultSource};
use kerncore::page_round_down;

use crate::arch;
use crate::fail;
use crate::frame::FrameAllocator;
use crate::kernel::Kernel;
use crate::paging::{AddressSpace, PageTableEntry, PteFlags};

bitflags::bitflags! {
    /// Error code the processor pushes for a page fault.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFaultCode: u32 {
        /// The page was present (a protection violation); clear means not
        /// present.
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// The access came from ring 3.
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        const INSTRUCTION = 1 << 4;
    }
}

impl Kernel {
    /// Attempts to resolve a fault at `address` in the current process.
    pub fn resolve_page_fault(
        &mut self,
        address: u32,
        code: PageFaultCode,
    ) -> Result<(), FaultInfo> {
        let unresolved = FaultInfo::MemoryAccess {
            address,
            source: if code.contains(PageFaultCode::USER) {
                FaultSource::User
            } else {
                FaultSource::Kernel
            },
        };
        let space = self
            .current
            .and_then(|pid| self.procs[pid].space())
            .ok_or(unresolved)?;
        let page = page_round_down(address as usize) as u32;
        match space.leaf(&self.frames, page) {
            Some(e) if e.is_user() && e.is_cow() && !e.is_writable() => {
                break_cow(&mut self.frames, space, page);
                Ok(())
            }
            _ => Err(unresolved),
        }
    }
}

/// Gives `space` a private, writable copy of the copy-on-write page at
/// `page`.
///
/// If nobody else shares the frame any more it is simply made writable again;
/// otherwise its contents move to a fresh frame and the shared one loses a
/// reference.
pub fn break_cow(frames: &mut FrameAllocator, space: AddressSpace, page: u32) {
    let Some(e) = space.leaf(frames, page) else {
        fail::die(format_args!("breaking sharing of unmapped {page:#x}"));
    };
    uassert!(e.is_cow());
    let flags = (e.flags() - PteFlags::COW) | PteFlags::WRITABLE;
    let shared = e.frame();
    if frames.user_refcount(shared) == 1 {
        space.set_leaf(frames, page, e.with_flags(flags));
    } else {
        let copy = frames.allocate();
        frames.copy_frame(shared, copy);
        frames.release_user_ref(shared);
        frames.add_user_ref(copy);
        space.set_leaf(frames, page, PageTableEntry::new(copy, flags));
    }
    arch::invalidate_page(page);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::MapFlags;

    const PAGE: u32 = 0x4000_8000;

    fn forked() -> (Kernel, usize, usize) {
        let mut k = Kernel::for_test(256);
        let parent = k.create(&[0xAB; 64]).unwrap();
        let child = k.clone_process(parent, true);
        (k, parent, child)
    }

    fn leaf(k: &Kernel, pid: usize, va: u32) -> PageTableEntry {
        k.process(pid).space().unwrap().leaf(k.frames(), va).unwrap()
    }

    #[test]
    fn last_sharer_gets_its_frame_back_writable() {
        let (mut k, parent, child) = forked();
        let shared = leaf(&k, parent, PAGE).frame();

        k.current = Some(child);
        let code = PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER;
        k.resolve_page_fault(PAGE + 0x10, code).unwrap();
        let c = leaf(&k, child, PAGE);
        assert_ne!(c.frame(), shared, "first writer should get a copy");
        assert_eq!(k.frames().user_refcount(shared), 1);

        k.current = Some(parent);
        k.resolve_page_fault(PAGE, code).unwrap();
        let p = leaf(&k, parent, PAGE);
        assert_eq!(p.frame(), shared, "last sharer should keep the frame");
        assert!(p.is_writable() && !p.is_cow());
        assert_eq!(k.frames().user_refcount(shared), 1);
    }

    #[test]
    fn copies_carry_the_page_contents() {
        let (mut k, _, child) = forked();
        k.current = Some(child);
        k.resolve_page_fault(PAGE, PageFaultCode::WRITE).unwrap();
        let mut buf = [0; 4];
        k.process(child)
            .space()
            .unwrap()
            .read_bytes(k.frames(), PAGE, &mut buf);
        assert_eq!(buf, [0xAB; 4]);
    }

    #[test]
    fn ordinary_faults_are_not_resolved() {
        let (mut k, parent, _) = forked();
        k.current = Some(parent);
        // Nothing mapped here.
        assert_eq!(
            k.resolve_page_fault(0x7000_0000, PageFaultCode::USER),
            Err(FaultInfo::MemoryAccess {
                address: 0x7000_0000,
                source: FaultSource::User,
            })
        );
        // Read-only but not shared.
        let space = k.process(parent).space().unwrap();
        space.map_region_alloc(&mut k.frames, 0x5000_0000, 1, MapFlags::USER);
        assert!(k
            .resolve_page_fault(0x5000_0000, PageFaultCode::WRITE)
            .is_err());
        // Kernel half.
        assert!(k.resolve_page_fault(0x1000, PageFaultCode::WRITE).is_err());
    }

    #[test]
    fn faults_without_a_current_process_are_not_resolved() {
        let (mut k, _, _) = forked();
        assert!(k.resolve_page_fault(PAGE, PageFaultCode::WRITE).is_err());
    }
}
