// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of processes.
//!
//! A process is a slot in the kernel's fixed table, identified by its index
//! (the pid). Slot 0 is never handed out. The lifecycle is
//!
//! ```text
//! Free -> Live -> Zombie -> Free
//!              \----------/
//! ```
//!
//! where the zombie stage is only entered if the process's parent is still
//! alive to collect the status.

use abi::{OpenFlags, MAX_PATH};
use zerocopy::IntoBytes;

use crate::arch;
use crate::config::MAX_OPEN_FILES;
use crate::err::UserError;
use crate::fail;
use crate::kernel::Kernel;
use crate::trap::Transfer;
use crate::umem::{self, USlice};

/// Where a process is in its lifecycle.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ProcessState {
    /// Slot available.
    #[default]
    Free,
    /// Runnable, or blocked in `waitpid` if it has a wait record.
    Live,
    /// Exited, with `status` waiting for the parent to collect it.
    Zombie { status: i32 },
}

/// A process blocked in `waitpid`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitRecord {
    pub child: usize,
    /// User address for the exit status, or 0 to discard it.
    pub status_addr: u32,
}

/// What an open descriptor refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenFile {
    Console,
    /// Something owned by a collaborator (a file, a pipe end); `handle` is its
    /// name for it.
    External { handle: u32, flags: OpenFlags },
}

/// Per-process descriptor table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FdTable {
    slots: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl Default for FdTable {
    fn default() -> Self {
        Self {
            slots: [None; MAX_OPEN_FILES],
        }
    }
}

impl FdTable {
    /// A table with stdin, stdout and stderr on the console.
    pub fn with_console() -> Self {
        let mut t = Self::default();
        for slot in &mut t.slots[..3] {
            *slot = Some(OpenFile::Console);
        }
        t
    }

    pub fn get(&self, fd: u32) -> Option<OpenFile> {
        self.slots.get(fd as usize).copied().flatten()
    }

    /// Installs `file` at the lowest free descriptor, or returns `None` if the
    /// table is full.
    pub fn allocate(&mut self, file: OpenFile) -> Option<u32> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(file);
        Some(fd as u32)
    }

    /// Removes descriptor `fd`, handing back what it referred to so the owner
    /// can release it.
    pub fn close(&mut self, fd: u32) -> Option<OpenFile> {
        self.slots.get_mut(fd as usize)?.take()
    }

    pub fn clear(&mut self) {
        self.slots = [None; MAX_OPEN_FILES];
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, OpenFile)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, f)| f.map(|f| (fd as u32, f)))
    }
}

/// Internal representation of a process.
///
/// The fields are private to this module so that the lifecycle invariants
/// (a wait record only on a live process, an address space exactly when live)
/// stay in one place.
#[derive(Clone, Debug)]
pub struct Process {
    /// Saved machine state of the user program.
    save: arch::SavedState,
    state: ProcessState,
    parent: Option<usize>,
    space: Option<crate::paging::AddressSpace>,
    fds: FdTable,
    cwd: heapless::String<MAX_PATH>,
    wait: Option<WaitRecord>,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            save: arch::SavedState::default(),
            state: ProcessState::Free,
            parent: None,
            space: None,
            fds: FdTable::default(),
            cwd: heapless::String::new(),
            wait: None,
        }
    }
}

impl Process {
    /// A freshly allocated process: live, console descriptors, cwd `/`.
    fn fresh() -> Self {
        let mut cwd = heapless::String::new();
        // One byte always fits.
        let _ = cwd.push('/');
        Self {
            state: ProcessState::Live,
            fds: FdTable::with_console(),
            cwd,
            ..Self::default()
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == ProcessState::Live
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, ProcessState::Zombie { .. })
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn space(&self) -> Option<crate::paging::AddressSpace> {
        self.space
    }

    pub fn save(&self) -> &arch::SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut arch::SavedState {
        &mut self.save
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    pub fn fds_mut(&mut self) -> &mut FdTable {
        &mut self.fds
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Replaces the working directory. Returns `false` if `path` doesn't fit.
    pub fn set_cwd(&mut self, path: &str) -> bool {
        let mut cwd = heapless::String::new();
        if cwd.push_str(path).is_err() {
            return false;
        }
        self.cwd = cwd;
        true
    }

    pub fn wait(&self) -> Option<WaitRecord> {
        self.wait
    }

    pub(crate) fn set_wait(&mut self, w: WaitRecord) {
        uassert!(self.is_live());
        self.wait = Some(w);
    }

    pub(crate) fn set_space(&mut self, space: crate::paging::AddressSpace) {
        self.space = Some(space);
    }

    pub(crate) fn set_save(&mut self, save: arch::SavedState) {
        self.save = save;
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to process state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX` and `retX` functions plus
/// `syscall_number`, and the rest of the trait (such as the argument proxies)
/// will just work.
pub trait ArchState: Default + Clone {
    /// Register state for the first instruction of a new program.
    fn for_user_entry(entry: u32, stack: u32) -> Self;

    fn pc(&self) -> u32;
    fn stack_pointer(&self) -> u32;

    /// Reads the syscall number.
    fn syscall_number(&self) -> u32;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u32;

    /// Writes syscall return register 0.
    fn ret0(&mut self, _: u32);

    /// Reads back syscall return register 0.
    fn return_value(&self) -> u32;

    /// Interprets arguments as for the `write` syscall and returns the results.
    fn as_write_args(&self) -> WriteArgs {
        WriteArgs {
            fd: self.arg0(),
            buffer: USlice::from_raw(self.arg1(), self.arg2()),
        }
    }

    /// Interprets arguments as for the `exit` syscall and returns the results.
    fn as_exit_args(&self) -> ExitArgs {
        ExitArgs {
            status: self.arg0() as i32,
        }
    }

    /// Interprets arguments as for the `waitpid` syscall and returns the
    /// results.
    fn as_waitpid_args(&self) -> WaitPidArgs {
        WaitPidArgs {
            pid: self.arg0() as i32,
            status_addr: self.arg1(),
        }
    }

    fn as_getcwd_args(&self) -> GetCwdArgs {
        GetCwdArgs {
            buffer: self.arg0(),
            len: self.arg1(),
        }
    }

    fn as_chdir_args(&self) -> ChDirArgs {
        ChDirArgs { path: self.arg0() }
    }

    /// Sets a recoverable error code using the generic ABI.
    fn set_error_response(&mut self, resp: u32) {
        self.ret0(resp);
    }
}

/// Decoded arguments for the `write` syscall.
#[derive(Clone, Debug)]
pub struct WriteArgs {
    pub fd: u32,
    pub buffer: Result<USlice<u8>, abi::UsageError>,
}

/// Decoded arguments for the `exit` syscall.
#[derive(Clone, Debug)]
pub struct ExitArgs {
    pub status: i32,
}

/// Decoded arguments for the `waitpid` syscall.
#[derive(Clone, Debug)]
pub struct WaitPidArgs {
    pub pid: i32,
    pub status_addr: u32,
}

/// Decoded arguments for the `getcwd` syscall.
#[derive(Clone, Debug)]
pub struct GetCwdArgs {
    pub buffer: u32,
    pub len: u32,
}

/// Decoded arguments for the `chdir` syscall.
#[derive(Clone, Debug)]
pub struct ChDirArgs {
    pub path: u32,
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever process we were just running.
    Same,
    /// We need to switch processes, but this routine has not concluded which
    /// one should now run. The scheduler needs to figure it out.
    Other,
}

impl Kernel {
    /// Claims the lowest free slot (never slot 0) and resets it to a fresh
    /// live process with no address space yet. A full table is fatal.
    pub fn allocate_process(&mut self) -> usize {
        let Some(pid) = (1..self.procs.len()).find(|&i| {
            self.procs[i].state == ProcessState::Free
        }) else {
            fail::die("process table full");
        };
        self.procs[pid] = Process::fresh();
        pid
    }

    /// Makes a copy of `parent` in a new slot: registers, descriptors, cwd and
    /// (deeply or copy-on-write) its address space.
    pub fn clone_process(&mut self, parent: usize, use_cow: bool) -> usize {
        let Some(space) = self.procs[parent].space else {
            fail::die(format_args!("process {parent} has no address space"));
        };
        let child = self.allocate_process();
        let child_space = space.clone_address_space(&mut self.frames, use_cow);

        let p = &self.procs[parent];
        let copy = Process {
            save: p.save.clone(),
            fds: p.fds.clone(),
            cwd: p.cwd.clone(),
            space: Some(child_space),
            parent: Some(parent),
            ..Process::fresh()
        };
        self.procs[child] = copy;
        child
    }

    /// Does the bookkeeping for `pid` exiting with `status`, leaving no
    /// current process.
    ///
    /// The address space goes, children are orphaned (zombie ones are freed
    /// outright since nobody can collect them now), and `pid` itself becomes a
    /// zombie if its parent is still around to `waitpid`.
    pub fn retire(&mut self, pid: usize, status: i32) {
        uassert!(self.procs[pid].is_live());
        if let Some(space) = self.procs[pid].space.take() {
            if self.active_space == space {
                self.activate(self.kernel_space);
            }
            space.release_address_space(&mut self.frames);
        }
        self.procs[pid].fds.clear();
        self.procs[pid].wait = None;

        for i in 0..self.procs.len() {
            if self.procs[i].parent != Some(pid) {
                continue;
            }
            if self.procs[i].is_zombie() {
                self.procs[i] = Process::default();
            } else {
                self.procs[i].parent = None;
            }
        }

        let parent_live = self.procs[pid]
            .parent
            .is_some_and(|p| self.procs[p].is_live());
        if parent_live {
            self.procs[pid].state = ProcessState::Zombie { status };
        } else {
            self.procs[pid] = Process::default();
        }
        klog!("kern: process {} exited with status {}", pid, status);
        self.current = None;
    }

    /// Ends process `pid` and picks what runs next.
    pub fn terminate(&mut self, pid: usize, status: i32) -> Transfer {
        self.retire(pid, status);
        self.schedule()
    }

    /// Finishes `waiter`'s pending `waitpid` on a zombie child: delivers the
    /// status, frees the child and makes the child's pid the syscall result.
    pub(crate) fn complete_wait(&mut self, waiter: usize) {
        let Some(w) = self.procs[waiter].wait.take() else {
            fail::die(format_args!("process {waiter} is not waiting"));
        };
        let ProcessState::Zombie { status } = self.procs[w.child].state else {
            fail::die(format_args!("child {} is not a zombie", w.child));
        };
        if w.status_addr != 0 {
            if let Err(f) = self.write_status(waiter, w.status_addr, status) {
                fail::die(format_args!("process {waiter}: {f:?}"));
            }
        }
        self.procs[w.child] = Process::default();
        self.procs[waiter].save.ret0(w.child as u32);
    }

    /// Stores an exit status at `addr` in `pid`'s memory. Anything short of
    /// a user-writable word there is a recoverable error.
    pub(crate) fn write_status(
        &mut self,
        pid: usize,
        addr: u32,
        status: i32,
    ) -> Result<(), UserError> {
        let space = self.procs[pid].space.ok_or(UserError::FAILED)?;
        let slice = USlice::<u8>::from_raw(addr, 4)
            .map_err(|_| UserError::FAILED)?;
        umem::copy_to_user(&mut self.frames, space, &slice, status.as_bytes())
            .map_err(|_| UserError::FAILED)
    }

    /// Checks, without writing, that `write_status` would succeed.
    pub(crate) fn check_status_addr(
        &self,
        pid: usize,
        addr: u32,
    ) -> Result<(), UserError> {
        let space = self.procs[pid].space.ok_or(UserError::FAILED)?;
        let slice = USlice::<u8>::from_raw(addr, 4)
            .map_err(|_| UserError::FAILED)?;
        if umem::is_user_writable(&self.frames, space, &slice) {
            Ok(())
        } else {
            Err(UserError::FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::MapFlags;
    use crate::process::ArchState;

    #[test]
    fn fd_table_hands_out_the_lowest_free_descriptor() {
        let mut t = FdTable::with_console();
        let ext = OpenFile::External {
            handle: 9,
            flags: OpenFlags::READ,
        };
        assert_eq!(t.allocate(ext), Some(3));
        assert_eq!(t.close(1), Some(OpenFile::Console));
        assert_eq!(t.allocate(ext), Some(1), "closed slot should be reused");
        assert_eq!(t.get(1), Some(ext));
        assert_eq!(t.close(1), Some(ext));
        assert_eq!(t.close(1), None);
        assert_eq!(t.get(1000), None);
    }

    #[test]
    fn fd_table_reports_exhaustion() {
        let mut t = FdTable::with_console();
        for i in 3..MAX_OPEN_FILES {
            assert_eq!(t.allocate(OpenFile::Console), Some(i as u32));
        }
        assert_eq!(t.allocate(OpenFile::Console), None);
        assert_eq!(t.iter().count(), MAX_OPEN_FILES);
    }

    #[test]
    fn allocation_skips_slot_zero_and_resets_the_slot() {
        let mut k = Kernel::for_test(128);
        let pid = k.allocate_process();
        assert_eq!(pid, 1);
        let p = k.process(pid);
        assert!(p.is_live());
        assert_eq!(p.cwd(), "/");
        assert_eq!(p.parent(), None);
        assert_eq!(p.fds().get(2), Some(OpenFile::Console));
    }

    #[test]
    #[should_panic(expected = "process table full")]
    fn full_table_stops_the_kernel() {
        let mut k = Kernel::for_test(128);
        for _ in 0..crate::config::MAX_PROCESSES {
            let _ = k.allocate_process();
        }
    }

    #[test]
    fn retire_makes_a_zombie_only_for_a_live_parent() {
        let mut k = Kernel::for_test(256);
        let parent = k.create(&[0x90; 16]).unwrap();
        let child = k.clone_process(parent, true);
        let orphan_to_be = k.clone_process(child, true);

        k.retire(child, 3);
        assert_eq!(k.process(child).state(), ProcessState::Zombie { status: 3 });
        assert_eq!(k.process(orphan_to_be).parent(), None);
        assert_eq!(k.current(), None);

        k.retire(parent, 0);
        assert_eq!(k.process(parent).state(), ProcessState::Free);
        assert_eq!(
            k.process(child).state(),
            ProcessState::Free,
            "zombie child of an exiting process should be freed"
        );

        // Nobody is left to collect the orphan's status.
        assert!(k.process(orphan_to_be).is_live());
        let before = k.frames().available_count();
        k.retire(orphan_to_be, 9);
        assert_eq!(k.process(orphan_to_be).state(), ProcessState::Free);
        assert!(k.process(orphan_to_be).space().is_none());
        assert!(k.frames().available_count() > before);
        assert!(k.processes().iter().all(|p| p.state() == ProcessState::Free));
    }

    #[test]
    fn clone_copies_descriptors_and_cwd() {
        let mut k = Kernel::for_test(256);
        let parent = k.create(&[0x90; 16]).unwrap();
        assert!(k.process_mut(parent).set_cwd("/bin"));
        let fd = k.process_mut(parent).fds_mut().close(0);
        assert_eq!(fd, Some(OpenFile::Console));

        let child = k.clone_process(parent, false);
        let c = k.process(child);
        assert_eq!(c.cwd(), "/bin");
        assert_eq!(c.fds().get(0), None);
        assert_eq!(c.parent(), Some(parent));
        assert_ne!(c.space(), k.process(parent).space());
    }

    #[test]
    fn write_status_refuses_read_only_memory() {
        let mut k = Kernel::for_test(256);
        let pid = k.create(&[0x90; 16]).unwrap();
        let space = k.process(pid).space().unwrap();
        space.map_region_alloc(
            &mut k.frames,
            0x5000_0000,
            abi::PAGE_SIZE,
            MapFlags::USER,
        );
        assert_eq!(k.check_status_addr(pid, 0x5000_0000), Err(UserError::FAILED));
        assert_eq!(
            k.write_status(pid, 0x5000_0000, 7),
            Err(UserError::FAILED)
        );
        // The stack is fine.
        let sp = k.process(pid).save().stack_pointer();
        assert_eq!(k.check_status_addr(pid, sp - 4), Ok(()));
    }
}
