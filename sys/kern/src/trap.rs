// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single entry point from hardware traps.
//!
//! Arch entry code saves the interrupted context, calls `handle_trap`, and
//! then does what the returned `Transfer` says. It never gets control back
//! from a process it resumes except through another trap.

use abi::{vector, FaultInfo};

use crate::arch;
use crate::fail;
use crate::fault::PageFaultCode;
use crate::kernel::Kernel;

/// What the arch layer does once the kernel is finished with a trap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Transfer {
    /// Restore the saved context of this process.
    Resume(usize),
    /// Return to whatever was interrupted, untouched.
    Return,
    /// Nothing exists to run; enter the interactive shell.
    Idle,
}

/// Everything the entry stub learned about a trap besides the registers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapInfo {
    pub vector: u8,
    /// Pushed by the processor for some exceptions, zero otherwise.
    pub error_code: u32,
    /// Faulting linear address (CR2), for page faults.
    pub fault_address: u32,
}

/// Classification of a trap vector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trap {
    Exception(u8),
    PageFault,
    Timer,
    DiskIrq(u8),
    Irq(u8),
    Syscall,
    Spurious,
    Unknown(u8),
}

impl From<u8> for Trap {
    fn from(v: u8) -> Self {
        match v {
            vector::PAGE_FAULT => Self::PageFault,
            0..vector::EXCEPTION_LIMIT => Self::Exception(v),
            vector::TIMER => Self::Timer,
            vector::PRIMARY_DISK | vector::SECONDARY_DISK => Self::DiskIrq(v),
            vector::IRQ_BASE..vector::IRQ_LIMIT => Self::Irq(v),
            vector::SYSCALL => Self::Syscall,
            vector::SPURIOUS => Self::Spurious,
            _ => Self::Unknown(v),
        }
    }
}

impl Kernel {
    /// Handles one trap. `snapshot` is the context the trap interrupted; if a
    /// process was running it becomes that process's saved state.
    pub fn handle_trap(
        &mut self,
        info: TrapInfo,
        snapshot: &arch::SavedState,
    ) -> Transfer {
        if let Some(pid) = self.current {
            self.procs[pid].set_save(snapshot.clone());
        }

        match Trap::from(info.vector) {
            Trap::Exception(vector) => {
                let fault = FaultInfo::Exception {
                    vector,
                    error_code: info.error_code,
                };
                fail::die(format_args!("process {:?}: {fault:?}", self.current))
            }
            Trap::PageFault => {
                let Some(pid) = self.current else {
                    fail::die(format_args!(
                        "kernel page fault at {:#x} (error {:#x})",
                        info.fault_address, info.error_code
                    ));
                };
                let code = PageFaultCode::from_bits_truncate(info.error_code);
                match self.resolve_page_fault(info.fault_address, code) {
                    Ok(()) => Transfer::Resume(pid),
                    Err(f) => {
                        self.dump_address_space(Some(pid));
                        fail::die(format_args!("process {pid}: {f:?} ({code:?})"))
                    }
                }
            }
            Trap::Timer => {
                self.ticks = self.ticks.next();
                arch::end_of_interrupt(info.vector);
                self.schedule()
            }
            Trap::Irq(v) => {
                if let Some(handler) = self.irq_handler(v) {
                    handler(v);
                }
                arch::end_of_interrupt(v);
                Transfer::Return
            }
            Trap::DiskIrq(v) => {
                arch::end_of_interrupt(v);
                Transfer::Return
            }
            Trap::Syscall => self.dispatch_syscall(),
            Trap::Spurious => Transfer::Return,
            Trap::Unknown(v) => fail::die(format_args!("unexpected vector {v}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ArchState;

    use std::sync::atomic::{AtomicU8, Ordering};

    fn trap(vector: u8) -> TrapInfo {
        TrapInfo {
            vector,
            ..TrapInfo::default()
        }
    }

    #[test]
    fn vectors_classify_as_expected() {
        assert_eq!(Trap::from(0), Trap::Exception(0));
        assert_eq!(Trap::from(13), Trap::Exception(13));
        assert_eq!(Trap::from(14), Trap::PageFault);
        assert_eq!(Trap::from(31), Trap::Exception(31));
        assert_eq!(Trap::from(32), Trap::Timer);
        assert_eq!(Trap::from(33), Trap::Irq(33));
        assert_eq!(Trap::from(46), Trap::DiskIrq(46));
        assert_eq!(Trap::from(47), Trap::DiskIrq(47));
        assert_eq!(Trap::from(48), Trap::Syscall);
        assert_eq!(Trap::from(49), Trap::Unknown(49));
        assert_eq!(Trap::from(255), Trap::Spurious);
    }

    #[test]
    fn timer_ticks_and_rotates() {
        let mut k = Kernel::for_test(256);
        let a = k.create(&[0x90; 4]).unwrap();
        let b = k.create(&[0x90; 4]).unwrap();
        assert_eq!(k.schedule(), Transfer::Resume(a));

        let snap = k.process(a).save().clone();
        assert_eq!(k.handle_trap(trap(vector::TIMER), &snap), Transfer::Resume(b));
        assert_eq!(u64::from(k.now()), 1);
    }

    #[test]
    fn timer_with_an_empty_table_idles() {
        let mut k = Kernel::for_test(64);
        let snap = arch::SavedState::default();
        assert_eq!(k.handle_trap(trap(vector::TIMER), &snap), Transfer::Idle);
        assert_eq!(u64::from(k.now()), 1);
    }

    #[test]
    fn timer_picks_up_a_loaded_process_when_none_is_running() {
        let mut k = Kernel::for_test(128);
        let a = k.create(&[0x90; 4]).unwrap();
        assert_eq!(k.current(), None);
        let snap = arch::SavedState::default();
        assert_eq!(k.handle_trap(trap(vector::TIMER), &snap), Transfer::Resume(a));
        assert_eq!(k.current(), Some(a));
        // The kernel context that was interrupted is not the process's.
        assert_eq!(k.process(a).save().pc(), abi::USER_LOAD_BASE);
    }

    #[test]
    fn trap_snapshot_becomes_the_saved_state() {
        let mut k = Kernel::for_test(128);
        let a = k.create(&[0x90; 4]).unwrap();
        let _ = k.schedule();
        let mut snap = k.process(a).save().clone();
        snap.eip += 2;
        let _ = k.handle_trap(trap(vector::SPURIOUS), &snap);
        assert_eq!(k.process(a).save().pc(), snap.eip);
    }

    static KEYS: AtomicU8 = AtomicU8::new(0);

    fn keyboard(v: u8) {
        KEYS.store(v, Ordering::Relaxed);
    }

    #[test]
    fn device_irqs_go_to_the_bound_driver() {
        let mut k = Kernel::for_test(64);
        k.bind_irq(vector::KEYBOARD, keyboard);
        let snap = arch::SavedState::default();
        assert_eq!(k.handle_trap(trap(vector::KEYBOARD), &snap), Transfer::Return);
        assert_eq!(KEYS.load(Ordering::Relaxed), vector::KEYBOARD);
        // Unbound lines are acknowledged and otherwise ignored.
        assert_eq!(k.handle_trap(trap(40), &snap), Transfer::Return);
        assert_eq!(
            k.handle_trap(trap(vector::PRIMARY_DISK), &snap),
            Transfer::Return
        );
    }

    #[test]
    #[should_panic(expected = "Exception { vector: 13, error_code: 0 }")]
    fn cpu_exceptions_are_fatal() {
        let mut k = Kernel::for_test(64);
        let _ = k.handle_trap(trap(13), &arch::SavedState::default());
    }

    #[test]
    #[should_panic(expected = "MemoryAccess")]
    fn unresolvable_page_faults_are_fatal() {
        let mut k = Kernel::for_test(128);
        let a = k.create(&[0x90; 4]).unwrap();
        let _ = k.schedule();
        let snap = k.process(a).save().clone();
        let info = TrapInfo {
            vector: vector::PAGE_FAULT,
            error_code: (PageFaultCode::WRITE | PageFaultCode::USER).bits(),
            fault_address: 0x9000_0000,
        };
        let _ = k.handle_trap(info, &snap);
    }

    #[test]
    #[should_panic(expected = "unexpected vector")]
    fn unknown_vectors_are_fatal() {
        let mut k = Kernel::for_test(64);
        let _ = k.handle_trap(trap(100), &arch::SavedState::default());
    }
}
