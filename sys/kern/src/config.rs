// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel shape, generated by `build.rs` from `KERNEL_CONFIG`.

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

/// Number of physical frames the kernel manages.
pub const FRAME_COUNT: usize = PHYS_MEM_BYTES / abi::PAGE_SIZE;

/// Milliseconds per timer tick.
pub const TICK_MS: u32 = 1000 / TICK_HZ;

static_assertions::const_assert!(MAX_PROCESSES >= 2);
static_assertions::const_assert!(MAX_OPEN_FILES >= 3);
static_assertions::const_assert!(PHYS_MEM_BYTES <= abi::USER_SPACE_BASE as usize);
