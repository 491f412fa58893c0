// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names:
//!
//! - macros `uassert!` and `klog!`;
//! - `SavedState`, implementing `process::ArchState`;
//! - `PhysMemory`, the capability for reading and writing physical frames;
//! - `Console`, the sink for console output;
//! - MMU hooks `set_page_directory`, `invalidate_page` and `flush_tlb`;
//! - `end_of_interrupt`.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        #[macro_use]
        pub mod x86;
        pub use x86::*;
    } else if #[cfg(not(target_os = "none"))] {
        #[macro_use]
        pub mod sim;
        pub use sim::*;
    } else {
        compile_error!("support for this architecture not implemented");
    }
}
