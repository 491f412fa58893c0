// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and user programs.
//!
//! Everything in here is visible to user code one way or another: syscall
//! numbers and registers, the fixed virtual address layout, the trap vector
//! assignments, and the record the kernel leaves on a fresh process's stack.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of a page (and of a physical frame), in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Start of the user half of every address space. Everything below this is the
/// kernel's identity map of physical memory and is never user-accessible.
pub const USER_SPACE_BASE: u32 = 0x4000_0000;

/// First address past the user half.
pub const USER_SPACE_END: u32 = 0xC000_0000;

/// Lowest mapped stack address. The page between `USER_SPACE_BASE` and this is
/// left unmapped so that running off the bottom of the stack faults.
pub const USER_STACK_BASE: u32 = 0x4000_1000;

/// Number of pages in a user stack.
pub const USER_STACK_PAGES: usize = 7;

/// Initial stack pointer of a fresh process, before the kernel pushes the
/// entry hand-off (see `AppInitState`).
pub const USER_STACK_TOP: u32 =
    USER_STACK_BASE + (USER_STACK_PAGES * PAGE_SIZE) as u32;

/// Fixed load address for program images. Entry points below this are
/// rejected.
pub const USER_LOAD_BASE: u32 = 0x4000_8000;

/// Longest path (including the terminating NUL) the kernel will accept or hand
/// back.
pub const MAX_PATH: usize = 256;

/// Code segment selector for ring 3.
pub const USER_CODE_SELECTOR: u32 = 24 | 3;
/// Data/stack segment selector for ring 3.
pub const USER_DATA_SELECTOR: u32 = 32 | 3;
/// Initial flags register for user code: only IF (interrupts enabled).
pub const USER_INITIAL_EFLAGS: u32 = 0x200;

/// Value returned in the result register by syscalls that fail gracefully.
/// Reads as `-1` from C.
pub const SYSCALL_FAILED: u32 = !0;

/// Trap vector assignments.
pub mod vector {
    /// Vectors below this are CPU exceptions.
    pub const EXCEPTION_LIMIT: u8 = 32;
    pub const PAGE_FAULT: u8 = 14;
    /// First vector the interrupt controllers are remapped to.
    pub const IRQ_BASE: u8 = 32;
    pub const TIMER: u8 = 32;
    pub const KEYBOARD: u8 = 33;
    pub const PRIMARY_DISK: u8 = 46;
    pub const SECONDARY_DISK: u8 = 47;
    /// One past the last hardware IRQ vector.
    pub const IRQ_LIMIT: u8 = 48;
    /// Software interrupt used for syscalls. Its gate is callable from ring 3.
    pub const SYSCALL: u8 = 48;
    pub const SPURIOUS: u8 = 255;
}

/// Enumeration of syscall numbers.
///
/// The number travels in `eax`, the arguments in `ebx`, `ecx`, `edx`, `esi`,
/// and `edi`, and the result comes back in `eax`. Number 0 is never bound.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Write = 1,
    Exit = 2,
    DumbFork = 3,
    Fork = 4,
    GetPid = 5,
    Open = 6,
    Read = 7,
    Close = 8,
    WaitPid = 9,
    Spawn = 10,
    ReadDir = 11,
    MkDir = 12,
    GetCwd = 13,
    ChDir = 14,
    Pipe = 15,
    Unlink = 16,
    RmDir = 17,
}

/// Size of the kernel's syscall table, i.e. one past the highest number.
pub const SYSCALL_COUNT: usize = 18;

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Write),
            2 => Ok(Self::Exit),
            3 => Ok(Self::DumbFork),
            4 => Ok(Self::Fork),
            5 => Ok(Self::GetPid),
            6 => Ok(Self::Open),
            7 => Ok(Self::Read),
            8 => Ok(Self::Close),
            9 => Ok(Self::WaitPid),
            10 => Ok(Self::Spawn),
            11 => Ok(Self::ReadDir),
            12 => Ok(Self::MkDir),
            13 => Ok(Self::GetCwd),
            14 => Ok(Self::ChDir),
            15 => Ok(Self::Pipe),
            16 => Ok(Self::Unlink),
            17 => Ok(Self::RmDir),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Access mode of an open file. Must agree with `O_RDONLY`/`O_WRONLY` in
    /// the C library; both bits set means read-write.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Record the kernel places at the initial stack pointer of a new process.
///
/// The program's startup code runs the `init_fn_count` function pointers at
/// `init_fn_table` (static initializers, copied out of the image's
/// `.init_array`) and then calls `main(argc, argv)`. The table, the `argv`
/// pointer array and the argument strings all live on the stack just above
/// this record.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    Immutable, KnownLayout,
)]
#[repr(C)]
pub struct AppInitState {
    pub init_fn_table: u32,
    pub init_fn_count: u32,
    pub argc: u32,
    pub argv: u32,
}

/// A record describing a fault taken by a process.
///
/// In this kernel a fault that the kernel cannot resolve stops the machine, so
/// these end up in the epitaph rather than in a process's state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultInfo {
    /// The process touched memory it has no business touching, either directly
    /// (`source` `User`) or by asking the kernel to touch it (`source`
    /// `Kernel`).
    MemoryAccess {
        /// Problematic virtual address.
        address: u32,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// A CPU exception other than a page fault, with the vector number and the
    /// error code the processor pushed (zero if it pushes none).
    Exception { vector: u8, error_code: u32 },
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a user process behaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A program used a syscall number outside the table.
    BadSyscallNumber,
    /// A program used a syscall number that nothing has bound a handler to.
    UnboundSyscall,
    /// A program specified a slice as a syscall argument, but the slice is
    /// patently invalid: it is either unaligned for its type, or it is
    /// expressed such that it would wrap around the end of the address space.
    InvalidSlice,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}
