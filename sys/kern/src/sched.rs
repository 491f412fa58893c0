// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Round-robin scheduling.
//!
//! There are no priorities and no run queue: the scheduler walks the process
//! table starting just after the current process and takes the first one that
//! can run. A process blocked in `waitpid` can run as soon as the child it is
//! waiting for is a zombie; the scheduler finishes the wait on its behalf
//! before resuming it.

use crate::fail;
use crate::kernel::Kernel;
use crate::process::ProcessState;
use crate::trap::Transfer;

impl Kernel {
    /// Picks the next process to run and makes it current.
    ///
    /// Returns `Transfer::Idle` if there are no processes at all. Processes
    /// that exist but can never run again mean the kernel is deadlocked, which
    /// is fatal.
    pub fn schedule(&mut self) -> Transfer {
        let n = self.procs.len();
        let start = self.current.map_or(0, |c| c + 1);
        for step in 0..n {
            let pid = (start + step) % n;
            let p = &self.procs[pid];
            if !p.is_live() {
                continue;
            }
            if let Some(w) = p.wait() {
                if !self.procs[w.child].is_zombie() {
                    continue;
                }
                self.complete_wait(pid);
            }
            return self.resume(pid);
        }

        if self.procs.iter().all(|p| p.state() == ProcessState::Free) {
            self.current = None;
            return Transfer::Idle;
        }
        for (pid, p) in self.procs.iter().enumerate() {
            if p.is_live() {
                klog!("kern: process {} blocked on {:?}", pid, p.wait());
            }
        }
        fail::die("deadlock: no process can run");
    }

    /// Makes `pid` current and switches to its address space.
    pub(crate) fn resume(&mut self, pid: usize) -> Transfer {
        uassert!(self.procs[pid].is_live());
        self.current = Some(pid);
        if let Some(space) = self.procs[pid].space() {
            self.activate(space);
        }
        Transfer::Resume(pid)
    }
}
