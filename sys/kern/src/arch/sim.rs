// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host simulation of the architecture layer.
//!
//! Physical memory is a vector of frames, the console is a byte buffer, and
//! the MMU hooks do nothing: the portable kernel never reads memory through
//! virtual addresses, so there is nothing for a TLB to get wrong here.

use zerocopy::{FromZeros, IntoBytes};

use crate::frame::{FrameId, WORDS_PER_FRAME};

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! klog {
    ($($arg:tt)*) => {
        println!($($arg)*)
    };
}

/// Register snapshot, shaped like the i386 one but without the segment
/// registers the portable kernel never looks at.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedState {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    pub esp: u32,
    pub eflags: u32,
    pub cs: u32,
    pub ss: u32,
}

impl SavedState {
    /// Builds the snapshot a process would present when trapping with syscall
    /// `nr` and arguments `args`.
    pub fn with_syscall(mut self, nr: u32, args: [u32; 5]) -> Self {
        self.eax = nr;
        [self.ebx, self.ecx, self.edx, self.esi, self.edi] = args;
        self
    }
}

impl crate::process::ArchState for SavedState {
    fn for_user_entry(entry: u32, stack: u32) -> Self {
        Self {
            eip: entry,
            esp: stack,
            eflags: abi::USER_INITIAL_EFLAGS,
            cs: abi::USER_CODE_SELECTOR,
            ss: abi::USER_DATA_SELECTOR,
            ..Self::default()
        }
    }

    fn pc(&self) -> u32 {
        self.eip
    }

    fn stack_pointer(&self) -> u32 {
        self.esp
    }

    fn syscall_number(&self) -> u32 {
        self.eax
    }

    fn arg0(&self) -> u32 {
        self.ebx
    }
    fn arg1(&self) -> u32 {
        self.ecx
    }
    fn arg2(&self) -> u32 {
        self.edx
    }
    fn arg3(&self) -> u32 {
        self.esi
    }
    fn arg4(&self) -> u32 {
        self.edi
    }

    fn ret0(&mut self, x: u32) {
        self.eax = x;
    }

    fn return_value(&self) -> u32 {
        self.eax
    }
}

/// Simulated physical memory: `frame_count` zeroed frames.
pub struct PhysMemory {
    frames: Vec<[u32; WORDS_PER_FRAME]>,
}

impl PhysMemory {
    pub fn new(frame_count: usize) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        frames.resize_with(frame_count, <[u32; WORDS_PER_FRAME]>::new_zeroed);
        Self { frames }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn words(&self, frame: FrameId) -> &[u32; WORDS_PER_FRAME] {
        &self.frames[frame.index()]
    }

    pub fn words_mut(&mut self, frame: FrameId) -> &mut [u32; WORDS_PER_FRAME] {
        &mut self.frames[frame.index()]
    }

    pub fn bytes(&self, frame: FrameId) -> &[u8] {
        self.words(frame).as_bytes()
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        self.words_mut(frame).as_mut_bytes()
    }
}

/// Console that remembers everything written to it.
#[derive(Debug, Default)]
pub struct Console {
    output: Vec<u8>,
}

impl Console {
    pub fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }
}

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}

pub fn set_page_directory(_dir: FrameId) {}

pub fn invalidate_page(_addr: u32) {}

pub fn flush_tlb() {}

pub fn end_of_interrupt(_vector: u8) {}
