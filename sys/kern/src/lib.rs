// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual-memory and process-execution core of a small single-CPU kernel for
//! 32-bit x86.
//!
//! The pieces, leaves first:
//!
//! - `frame`: the physical frame pool and per-frame user reference counts.
//! - `paging`: two-level page tables, cloning (deep or copy-on-write) and
//!   teardown.
//! - `fault`: copy-on-write page fault resolution.
//! - `process` and `loader`: the fixed process table and program loading.
//! - `sched`: round-robin selection and completion of blocked waits.
//! - `trap` and `syscalls`: the single entry point from hardware traps.
//!
//! All mutable kernel state lives in one `kernel::Kernel` value, which the arch
//! entry code borrows for the duration of each trap.
//!
//! Code outside of the `arch` module is portable; it runs on the host against
//! `arch::sim` for testing.
//!
//! # Design principles
//!
//! 1. Static configuration. The number of processes, the amount of physical
//!    memory and the tick rate are fixed at compile time.
//! 2. A strong preference for safe code where reasonable. Physical memory is
//!    reached through a capability rather than through raw pointers.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//! 4. Corrupted kernel state stops the machine. There is no attempt at
//!    recovery from a broken invariant.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod config;
pub mod err;
pub mod fail;
pub mod fault;
pub mod frame;
pub mod kernel;
pub mod loader;
pub mod paging;
pub mod process;
pub mod sched;
#[cfg(target_os = "none")]
pub mod startup;
pub mod syscalls;
pub mod time;
pub mod trap;
pub mod umem;
