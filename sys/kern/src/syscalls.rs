// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! # Syscall implementations
//!
//! Syscalls are implemented by functions with the signature:
//!
//! ```ignore
//! fn syscall(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError>;
//! ```
//!
//! `caller` is the pid of the process that trapped. On return, a `NextTask`
//! indicates success with a possible scheduling hint, while a `UserError`
//! indicates a condition that needs to either be returned as a response code
//! or treated as fatal. A common wrapper (`dispatch_syscall`) takes care of
//! the final side effects, reducing code in each syscall.
//!
//! Arguments to syscalls need to be read from the caller's saved state. Each
//! syscall has an *argument proxy* to make this easy, e.g.
//! `save().as_write_args()`. See the `process::ArchState` trait for details.
//!
//! The kernel only implements the calls that concern processes and memory.
//! The file and directory calls are bound at boot by whoever provides the
//! filesystem, through `Kernel::bind_syscall`.

use abi::{Sysnum, UsageError, MAX_PATH};

use crate::err::UserError;
use crate::fail;
use crate::kernel::{Kernel, SyscallHandler};
use crate::process::{ArchState, NextTask, OpenFile, WaitRecord};
use crate::trap::Transfer;
use crate::umem::{self, USlice};

/// Installs the syscalls the kernel implements itself.
pub(crate) fn bind_core(k: &mut Kernel) {
    k.bind_syscall(Sysnum::Write, write);
    k.bind_syscall(Sysnum::Exit, exit);
    k.bind_syscall(Sysnum::DumbFork, dumbfork);
    k.bind_syscall(Sysnum::Fork, fork);
    k.bind_syscall(Sysnum::GetPid, getpid);
    k.bind_syscall(Sysnum::WaitPid, waitpid);
    k.bind_syscall(Sysnum::GetCwd, getcwd);
    k.bind_syscall(Sysnum::ChDir, chdir);
}

impl Kernel {
    fn syscall_handler(&self, nr: u32) -> Result<SyscallHandler, UserError> {
        let nr = Sysnum::try_from(nr).map_err(|()| UsageError::BadSyscallNumber)?;
        Ok(self.syscalls[nr as usize].ok_or(UsageError::UnboundSyscall)?)
    }

    /// Runs the syscall the current process asked for and decides who runs
    /// next.
    pub(crate) fn dispatch_syscall(&mut self) -> Transfer {
        let Some(caller) = self.current else {
            fail::die("syscall with no current process");
        };
        let nr = self.procs[caller].save().syscall_number();
        let res = self.syscall_handler(nr).and_then(|h| h(self, caller));
        let hint = match res {
            Ok(nt) => nt,
            Err(UserError::Recoverable(code, hint)) => {
                self.procs[caller].save_mut().set_error_response(code);
                hint
            }
            Err(UserError::Unrecoverable(fault)) => fail::die(format_args!(
                "process {caller}: syscall {nr}: {fault:?}"
            )),
        };
        match hint {
            NextTask::Same => Transfer::Resume(caller),
            NextTask::Other => self.schedule(),
        }
    }
}

/// `write(fd, buf, len)`: console descriptors only; returns `len`.
fn write(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let args = k.procs[caller].save().as_write_args();
    let Some(OpenFile::Console) = k.procs[caller].fds().get(args.fd) else {
        return Err(UserError::FAILED);
    };
    let buffer = args.buffer.map_err(|_| UserError::FAILED)?;
    let space = k.procs[caller].space().ok_or(UserError::FAILED)?;
    umem::read_user_chunks(&k.frames, space, &buffer, |chunk| {
        k.console.write(chunk)
    })
    .map_err(|_| UserError::FAILED)?;
    k.procs[caller].save_mut().ret0(buffer.len() as u32);
    Ok(NextTask::Same)
}

/// `exit(status)`: never returns to the caller.
fn exit(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let args = k.procs[caller].save().as_exit_args();
    k.retire(caller, args.status);
    Ok(NextTask::Other)
}

fn dumbfork(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    Ok(do_fork(k, caller, false))
}

fn fork(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    Ok(do_fork(k, caller, true))
}

/// The child sees 0, the parent sees the child's pid.
fn do_fork(k: &mut Kernel, caller: usize, use_cow: bool) -> NextTask {
    let child = k.clone_process(caller, use_cow);
    k.procs[child].save_mut().ret0(0);
    k.procs[caller].save_mut().ret0(child as u32);
    NextTask::Same
}

fn getpid(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    k.procs[caller].save_mut().ret0(caller as u32);
    Ok(NextTask::Same)
}

/// `waitpid(pid, status_ptr)`: collects a child's exit status, blocking until
/// it exits. A null `status_ptr` discards the status.
fn waitpid(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let args = k.procs[caller].save().as_waitpid_args();
    let child = usize::try_from(args.pid)
        .ok()
        .filter(|&c| c != 0 && c < k.procs.len())
        .ok_or(UserError::FAILED)?;
    if k.procs[child].parent() != Some(caller) {
        return Err(UserError::FAILED);
    }
    if args.status_addr != 0 {
        k.check_status_addr(caller, args.status_addr)?;
    }

    k.procs[caller].set_wait(WaitRecord {
        child,
        status_addr: args.status_addr,
    });
    if k.procs[child].is_zombie() {
        k.complete_wait(caller);
        Ok(NextTask::Same)
    } else {
        Ok(NextTask::Other)
    }
}

/// `getcwd(buf, len)`: copies the NUL-terminated working directory into
/// `buf`, which must have room for all of it.
fn getcwd(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let args = k.procs[caller].save().as_getcwd_args();
    let mut bytes = [0; MAX_PATH + 1];
    let cwd = k.procs[caller].cwd().as_bytes();
    let n = cwd.len() + 1;
    if (args.len as usize) < n {
        return Err(UserError::FAILED);
    }
    bytes[..cwd.len()].copy_from_slice(cwd);

    let dst = USlice::from_raw(args.buffer, n as u32)
        .map_err(|_| UserError::FAILED)?;
    let space = k.procs[caller].space().ok_or(UserError::FAILED)?;
    umem::copy_to_user(&mut k.frames, space, &dst, &bytes[..n])
        .map_err(|_| UserError::FAILED)?;
    k.procs[caller].save_mut().ret0(0);
    Ok(NextTask::Same)
}

/// `chdir(path)`: sets the working directory to the absolute `path`, after
/// normalization. Nothing checks that the directory exists.
fn chdir(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let args = k.procs[caller].save().as_chdir_args();
    let space = k.procs[caller].space().ok_or(UserError::FAILED)?;
    let mut buf = [0; MAX_PATH];
    let len = umem::read_user_cstr(&k.frames, space, args.path, &mut buf)
        .map_err(|_| UserError::FAILED)?
        .ok_or(UserError::FAILED)?;
    let path = core::str::from_utf8(&buf[..len]).map_err(|_| UserError::FAILED)?;
    let normal = normalize_path(path).ok_or(UserError::FAILED)?;
    if !k.procs[caller].set_cwd(&normal) {
        return Err(UserError::FAILED);
    }
    k.procs[caller].save_mut().ret0(0);
    Ok(NextTask::Same)
}

/// Resolves `.`, `..` and repeated separators in an absolute path. Returns
/// `None` for relative paths, or if the result plus its NUL would not fit in
/// `MAX_PATH`.
pub fn normalize_path(path: &str) -> Option<heapless::String<MAX_PATH>> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts: heapless::Vec<&str, { MAX_PATH / 2 }> = heapless::Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p).ok()?,
        }
    }

    let mut out = heapless::String::new();
    if parts.is_empty() {
        out.push('/').ok()?;
    }
    for p in &parts {
        out.push('/').ok()?;
        out.push_str(p).ok()?;
    }
    if out.len() >= MAX_PATH {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::PageFaultCode;
    use crate::process::ProcessState;
    use crate::trap::TrapInfo;
    use abi::{vector, SYSCALL_FAILED, USER_STACK_BASE};

    const SCRATCH: u32 = USER_STACK_BASE;

    fn booted() -> (Kernel, usize) {
        let mut k = Kernel::for_test(256);
        let pid = k.create(&[0x90; 32]).unwrap();
        assert_eq!(k.schedule(), Transfer::Resume(pid));
        (k, pid)
    }

    fn syscall(k: &mut Kernel, nr: u32, args: [u32; 5]) -> Transfer {
        let pid = k.current().unwrap();
        let snap = k.process(pid).save().clone().with_syscall(nr, args);
        let info = TrapInfo {
            vector: vector::SYSCALL,
            ..TrapInfo::default()
        };
        k.handle_trap(info, &snap)
    }

    fn ret(k: &Kernel, pid: usize) -> u32 {
        k.process(pid).save().return_value()
    }

    fn poke(k: &mut Kernel, pid: usize, addr: u32, bytes: &[u8]) {
        let space = k.process(pid).space().unwrap();
        space.write_bytes(&mut k.frames, addr, bytes);
    }

    fn peek<const N: usize>(k: &Kernel, pid: usize, addr: u32) -> [u8; N] {
        let mut buf = [0; N];
        let space = k.process(pid).space().unwrap();
        space.read_bytes(k.frames(), addr, &mut buf);
        buf
    }

    #[test]
    fn getpid_returns_the_slot() {
        let (mut k, pid) = booted();
        assert_eq!(syscall(&mut k, 5, [0; 5]), Transfer::Resume(pid));
        assert_eq!(ret(&k, pid), pid as u32);
    }

    #[test]
    fn write_copies_to_the_console() {
        let (mut k, pid) = booted();
        poke(&mut k, pid, SCRATCH, b"hello");
        let _ = syscall(&mut k, 1, [1, SCRATCH, 5, 0, 0]);
        assert_eq!(ret(&k, pid), 5);
        assert_eq!(k.console().output(), b"hello");
    }

    #[test]
    fn write_fails_gracefully() {
        let (mut k, pid) = booted();
        // Descriptor not open.
        let _ = syscall(&mut k, 1, [7, SCRATCH, 5, 0, 0]);
        assert_eq!(ret(&k, pid), SYSCALL_FAILED);
        // Buffer in the kernel half.
        let _ = syscall(&mut k, 1, [1, 0x1000, 5, 0, 0]);
        assert_eq!(ret(&k, pid), SYSCALL_FAILED);
        // Buffer wrapping the address space.
        let _ = syscall(&mut k, 1, [1, 0xFFFF_FFF0, 0x20, 0, 0]);
        assert_eq!(ret(&k, pid), SYSCALL_FAILED);
        assert!(k.console().output().is_empty());
    }

    #[test]
    fn fork_returns_twice() {
        let (mut k, parent) = booted();
        assert_eq!(syscall(&mut k, 4, [0; 5]), Transfer::Resume(parent));
        let child = ret(&k, parent) as usize;
        assert_ne!(child, parent);
        assert_eq!(ret(&k, child), 0);
        assert_eq!(k.process(child).parent(), Some(parent));
    }

    fn check_fork_isolation(nr: u32) {
        let (mut k, parent) = booted();
        poke(&mut k, parent, SCRATCH, b"parent");
        let _ = syscall(&mut k, nr, [0; 5]);
        let child = ret(&k, parent) as usize;
        assert_eq!(peek::<6>(&k, child, SCRATCH), *b"parent");

        // Run the child and have it store to the page, faulting first if the
        // page is shared.
        assert_eq!(k.schedule(), Transfer::Resume(child));
        let space = k.process(child).space().unwrap();
        if space.leaf(k.frames(), SCRATCH).unwrap().is_cow() {
            let info = TrapInfo {
                vector: vector::PAGE_FAULT,
                error_code: (PageFaultCode::PRESENT
                    | PageFaultCode::WRITE
                    | PageFaultCode::USER)
                    .bits(),
                fault_address: SCRATCH,
            };
            let snap = k.process(child).save().clone();
            assert_eq!(k.handle_trap(info, &snap), Transfer::Resume(child));
        }
        poke(&mut k, child, SCRATCH, b"child!");

        assert_eq!(peek::<6>(&k, parent, SCRATCH), *b"parent");
        assert_eq!(peek::<6>(&k, child, SCRATCH), *b"child!");
    }

    #[test]
    fn dumbfork_children_have_private_memory() {
        check_fork_isolation(3);
    }

    #[test]
    fn cow_fork_children_have_private_memory() {
        check_fork_isolation(4);
    }

    #[test]
    fn waitpid_collects_an_exit_status() {
        let (mut k, parent) = booted();
        let _ = syscall(&mut k, 3, [0; 5]);
        let child = ret(&k, parent) as usize;

        // The parent blocks, so the child runs.
        let status_addr = SCRATCH + 0x100;
        assert_eq!(
            syscall(&mut k, 9, [child as u32, status_addr, 0, 0, 0]),
            Transfer::Resume(child)
        );
        // The child exits, so the parent's wait completes.
        assert_eq!(syscall(&mut k, 2, [7, 0, 0, 0, 0]), Transfer::Resume(parent));
        assert_eq!(ret(&k, parent), child as u32);
        assert_eq!(peek::<4>(&k, parent, status_addr), 7i32.to_ne_bytes());
        assert_eq!(k.process(child).state(), ProcessState::Free);
    }

    #[test]
    fn waitpid_on_an_existing_zombie_returns_at_once() {
        let (mut k, parent) = booted();
        let _ = syscall(&mut k, 4, [0; 5]);
        let child = ret(&k, parent) as usize;
        k.retire(child, -2);
        k.current = Some(parent);

        assert_eq!(
            syscall(&mut k, 9, [child as u32, 0, 0, 0, 0]),
            Transfer::Resume(parent)
        );
        assert_eq!(ret(&k, parent), child as u32);
        assert_eq!(k.process(child).state(), ProcessState::Free);
    }

    #[test]
    fn waitpid_refuses_strangers_and_bad_pointers() {
        let (mut k, parent) = booted();
        let _ = syscall(&mut k, 4, [0; 5]);
        let child = ret(&k, parent) as usize;

        for pid in [0, -1i32 as u32, parent as u32, 1000] {
            let _ = syscall(&mut k, 9, [pid, 0, 0, 0, 0]);
            assert_eq!(ret(&k, parent), SYSCALL_FAILED, "waitpid({pid})");
        }
        let _ = syscall(&mut k, 9, [child as u32, 0x2000, 0, 0, 0]);
        assert_eq!(ret(&k, parent), SYSCALL_FAILED);
        assert_eq!(k.process(parent).wait(), None);
    }

    #[test]
    fn chdir_normalizes_and_getcwd_reports() {
        let (mut k, pid) = booted();
        poke(&mut k, pid, SCRATCH, b"/usr/./bin//../lib/\0");
        let _ = syscall(&mut k, 14, [SCRATCH, 0, 0, 0, 0]);
        assert_eq!(ret(&k, pid), 0);
        assert_eq!(k.process(pid).cwd(), "/usr/lib");

        let buf = SCRATCH + 0x200;
        let _ = syscall(&mut k, 13, [buf, 8, 0, 0, 0]);
        assert_eq!(ret(&k, pid), SYSCALL_FAILED, "no room for the NUL");
        let _ = syscall(&mut k, 13, [buf, 9, 0, 0, 0]);
        assert_eq!(ret(&k, pid), 0);
        assert_eq!(&peek::<9>(&k, pid, buf), b"/usr/lib\0");
    }

    #[test]
    fn chdir_rejects_relative_paths() {
        let (mut k, pid) = booted();
        poke(&mut k, pid, SCRATCH, b"tmp\0");
        let _ = syscall(&mut k, 14, [SCRATCH, 0, 0, 0, 0]);
        assert_eq!(ret(&k, pid), SYSCALL_FAILED);
        assert_eq!(k.process(pid).cwd(), "/");
    }

    #[test]
    fn normalization_cannot_climb_above_root() {
        assert_eq!(normalize_path("/../..").unwrap(), "/");
        assert_eq!(normalize_path("///a//b/.").unwrap(), "/a/b");
        assert_eq!(normalize_path("/a/b/../../c").unwrap(), "/c");
        assert!(normalize_path("a/b").is_none());
        assert!(normalize_path("").is_none());
    }

    fn open_stub(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
        let fd = k
            .process_mut(caller)
            .fds_mut()
            .allocate(OpenFile::External {
                handle: 42,
                flags: abi::OpenFlags::READ,
            })
            .ok_or(UserError::FAILED)?;
        k.process_mut(caller).save_mut().ret0(fd);
        Ok(NextTask::Same)
    }

    #[test]
    fn collaborators_can_bind_their_own_calls() {
        let (mut k, pid) = booted();
        k.bind_syscall(Sysnum::Open, open_stub);
        let _ = syscall(&mut k, 6, [0; 5]);
        assert_eq!(ret(&k, pid), 3);
        // External descriptors are not the kernel's to write.
        let _ = syscall(&mut k, 1, [3, SCRATCH, 1, 0, 0]);
        assert_eq!(ret(&k, pid), SYSCALL_FAILED);
    }

    #[test]
    #[should_panic(expected = "UnboundSyscall")]
    fn unbound_numbers_are_fatal() {
        let (mut k, _) = booted();
        let _ = syscall(&mut k, 6, [0; 5]);
    }

    #[test]
    #[should_panic(expected = "BadSyscallNumber")]
    fn out_of_range_numbers_are_fatal() {
        let (mut k, _) = booted();
        let _ = syscall(&mut k, 99, [0; 5]);
    }

    #[test]
    #[should_panic(expected = "BadSyscallNumber")]
    fn syscall_zero_is_not_a_syscall() {
        let (mut k, _) = booted();
        let _ = syscall(&mut k, 0, [0; 5]);
    }
}
