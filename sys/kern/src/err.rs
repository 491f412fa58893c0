// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`.

use abi::{FaultInfo, UsageError};

use crate::process::NextTask;

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// process by returning a response code (the `u32` field) in its result
    /// register. They may still cause a context switch, however, as indicated
    /// by the `NextTask`.
    Recoverable(u32, NextTask),
    /// An unrecoverable error. There is no way to park a faulted process in
    /// this kernel, so these stop the machine.
    Unrecoverable(FaultInfo),
}

impl UserError {
    /// The usual recoverable error: `-1` to the caller, keep running it.
    pub const FAILED: Self = Self::Recoverable(abi::SYSCALL_FAILED, NextTask::Same);
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}
