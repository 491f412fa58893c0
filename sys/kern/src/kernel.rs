// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state object.
//!
//! Everything the kernel mutates lives in one `Kernel`: the frame allocator,
//! the process table, the scheduler cursor and the handler tables that
//! collaborators bind into. Operations on it are spread across the modules
//! that own each concern (`process`, `loader`, `sched`, `fault`, `trap`,
//! `syscalls`).

use core::fmt::Write;

use abi::{Sysnum, PAGE_SIZE, SYSCALL_COUNT, USER_SPACE_BASE};

use crate::arch::{self, Console, PhysMemory};
use crate::config::MAX_PROCESSES;
use crate::err::UserError;
use crate::frame::{FrameAllocator, FrameMeta};
use crate::paging::AddressSpace;
use crate::process::{NextTask, Process};
use crate::time::Timestamp;

/// Shape of a syscall implementation. Handlers get the caller's pid, read
/// arguments from its saved state and write results back there.
pub type SyscallHandler = fn(&mut Kernel, usize) -> Result<NextTask, UserError>;

/// Shape of a device interrupt handler; the argument is the vector.
pub type IrqHandler = fn(u8);

/// Number of hardware IRQ lines behind the pair of interrupt controllers.
pub const IRQ_LINES: usize = 16;

pub struct Kernel {
    pub(crate) frames: FrameAllocator,
    pub(crate) kernel_space: AddressSpace,
    /// Directory currently loaded in the MMU.
    pub(crate) active_space: AddressSpace,
    pub(crate) procs: [Process; MAX_PROCESSES],
    pub(crate) current: Option<usize>,
    pub(crate) ticks: Timestamp,
    pub(crate) syscalls: [Option<SyscallHandler>; SYSCALL_COUNT],
    pub(crate) irqs: [Option<IrqHandler>; IRQ_LINES],
    pub(crate) console: Console,
}

impl Kernel {
    /// Brings up the memory core over `mem`: frames below `reserved` are left
    /// alone, the kernel directory identity-maps the rest and is activated,
    /// and the core syscalls are bound.
    pub fn new(
        mem: PhysMemory,
        meta: &'static mut [FrameMeta],
        reserved: usize,
        console: Console,
    ) -> Self {
        let mut frames = FrameAllocator::new(mem, meta, reserved);
        let phys_top = usize::min(
            frames.frame_count() * PAGE_SIZE,
            USER_SPACE_BASE as usize,
        ) as u32;
        let kernel_space = AddressSpace::new_kernel(&mut frames, phys_top);
        klog!(
            "kern: {} frames, {} free after the kernel map",
            frames.frame_count(),
            frames.available_count()
        );
        arch::set_page_directory(kernel_space.directory());

        let mut k = Self {
            frames,
            kernel_space,
            active_space: kernel_space,
            procs: core::array::from_fn(|_| Process::default()),
            current: None,
            ticks: Timestamp::default(),
            syscalls: [None; SYSCALL_COUNT],
            irqs: [None; IRQ_LINES],
            console,
        };
        crate::syscalls::bind_core(&mut k);
        k
    }

    /// A kernel over `frames` frames of simulated memory.
    #[cfg(not(target_os = "none"))]
    pub fn for_test(frames: usize) -> Self {
        let meta = vec![FrameMeta::EMPTY; frames].leak();
        Self::new(PhysMemory::new(frames), meta, 1, Console::default())
    }

    pub fn process(&self, pid: usize) -> &Process {
        &self.procs[pid]
    }

    pub fn process_mut(&mut self, pid: usize) -> &mut Process {
        &mut self.procs[pid]
    }

    pub fn processes(&self) -> &[Process] {
        &self.procs
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Ticks since boot.
    pub fn now(&self) -> Timestamp {
        self.ticks
    }

    /// Installs `handler` for syscall `nr`, replacing whatever was there.
    pub fn bind_syscall(&mut self, nr: Sysnum, handler: SyscallHandler) {
        self.syscalls[nr as usize] = Some(handler);
    }

    /// Installs `handler` for hardware interrupt `vector`, which must be one
    /// of the remapped IRQ vectors.
    pub fn bind_irq(&mut self, vector: u8, handler: IrqHandler) {
        uassert!((abi::vector::IRQ_BASE..abi::vector::IRQ_LIMIT).contains(&vector));
        self.irqs[usize::from(vector - abi::vector::IRQ_BASE)] = Some(handler);
    }

    pub(crate) fn irq_handler(&self, vector: u8) -> Option<IrqHandler> {
        let line = vector.checked_sub(abi::vector::IRQ_BASE)?;
        self.irqs.get(usize::from(line)).copied().flatten()
    }

    /// Loads `space`'s directory into the MMU.
    pub(crate) fn activate(&mut self, space: AddressSpace) {
        self.active_space = space;
        arch::set_page_directory(space.directory());
    }

    /// Writes every mapping of `pid`'s address space, or of the kernel's if
    /// `pid` is `None`, to the console.
    pub fn dump_address_space(&mut self, pid: Option<usize>) {
        let Self {
            frames,
            kernel_space,
            procs,
            console,
            ..
        } = self;
        let space = match pid {
            Some(pid) => match procs[pid].space() {
                Some(space) => space,
                None => {
                    let _ = writeln!(console, "process {pid} has no address space");
                    return;
                }
            },
            None => *kernel_space,
        };
        let _ = writeln!(console, "address space of {pid:?}:");
        for range in space.mapped_ranges(frames) {
            let _ = writeln!(console, "  {range}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_handler(_: u8) {}

    #[test]
    fn fresh_kernel_has_nothing_to_run() {
        let k = Kernel::for_test(64);
        assert_eq!(k.current(), None);
        assert!(k.processes().iter().all(|p| !p.is_live()));
        assert_eq!(k.now(), Timestamp::default());
    }

    #[test]
    fn core_syscalls_are_bound_and_collaborator_ones_are_not() {
        let k = Kernel::for_test(64);
        for nr in [Sysnum::Write, Sysnum::Exit, Sysnum::Fork, Sysnum::ChDir] {
            assert!(k.syscalls[nr as usize].is_some(), "{nr:?} should be bound");
        }
        for nr in [Sysnum::Open, Sysnum::Pipe, Sysnum::RmDir] {
            assert!(k.syscalls[nr as usize].is_none(), "{nr:?} should be free");
        }
        assert!(k.syscalls[0].is_none());
    }

    #[test]
    fn irq_handlers_are_indexed_by_line() {
        let mut k = Kernel::for_test(64);
        k.bind_irq(abi::vector::KEYBOARD, tick_handler);
        assert!(k.irq_handler(abi::vector::KEYBOARD).is_some());
        assert!(k.irq_handler(abi::vector::TIMER).is_none());
        assert!(k.irq_handler(abi::vector::SYSCALL).is_none());
        assert!(k.irq_handler(3).is_none());
    }

    #[test]
    fn address_space_dump_lists_user_mappings() {
        let mut k = Kernel::for_test(256);
        let parent = k.create(&[0x90; 16]).unwrap();
        let _ = k.clone_process(parent, true);

        k.dump_address_space(Some(parent));
        let out = String::from_utf8(k.console().output().to_vec()).unwrap();
        assert!(out.starts_with("address space of Some(1):\n"), "{out}");
        assert!(out.contains("  0x40001000-"), "stack missing from\n{out}");
        assert!(out.contains(" ur cow\n"), "shared pages missing from\n{out}");
        assert!(!out.contains(" urw"), "fork left a writable page in\n{out}");
    }

    #[test]
    fn address_space_dump_of_a_free_slot_says_so() {
        let mut k = Kernel::for_test(64);
        k.dump_address_space(Some(3));
        assert_eq!(k.console().output(), b"process 3 has no address space\n");
    }

    #[test]
    fn kernel_address_space_dump_skips_page_zero() {
        let mut k = Kernel::for_test(64);
        k.dump_address_space(None);
        let out = String::from_utf8(k.console().output().to_vec()).unwrap();
        assert!(out.contains("  0x00001000-0x00040000 rw\n"), "{out}");
    }

    #[test]
    #[should_panic]
    fn binding_a_non_irq_vector_is_a_bug() {
        let mut k = Kernel::for_test(64);
        k.bind_irq(abi::vector::SYSCALL, tick_handler);
    }
}
