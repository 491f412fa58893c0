// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use core::convert::Infallible;
use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, Console, PhysMemory};
use crate::config::{FRAME_COUNT, TICK_HZ};
use crate::frame::FrameMeta;
use crate::kernel::Kernel;
use crate::loader::{ImageSource, LoadError};
use crate::trap::Transfer;

/// Tracks when a mutable reference to the kernel is floating around, to
/// prevent production of a second one. This forms a sort of ad-hoc Mutex
/// around the kernel state.
///
/// Notice that this begins life initialized to `true`. This prevents use of
/// `with_kernel` before the kernel is properly started. We set it to `false`
/// late in `start_kernel`.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

static mut KERNEL: MaybeUninit<Kernel> = MaybeUninit::uninit();

static mut FRAME_META: [FrameMeta; FRAME_COUNT] = [FrameMeta::EMPTY; FRAME_COUNT];

/// The main kernel entry point.
///
/// Boot code calls this once it has a stack, with interrupts off.
/// `reserved_frames` is the number of frames from physical address 0 that hold
/// the boot image, the kernel and anything else the allocator must never hand
/// out.
///
/// The kernel comes up with no processes, so this ends in the shell.
///
/// # Safety
///
/// This function may not be called reentrantly, or more than once per boot.
pub unsafe fn start_kernel(reserved_frames: usize) -> ! {
    // Safety: boot is single threaded and this runs exactly once.
    unsafe {
        arch::install_descriptor_tables();
    }
    arch::init_interrupt_controllers();

    // Safety: these references remain unique so long as the "only called once
    // per boot" contract on this function is upheld.
    let (meta, mem, slot) = unsafe {
        (
            &mut *addr_of_mut!(FRAME_META),
            PhysMemory::new(FRAME_COUNT),
            &mut *addr_of_mut!(KERNEL),
        )
    };
    slot.write(Kernel::new(mem, meta, reserved_frames, Console::default()));
    KERNEL_IN_USE.store(false, Ordering::Release);

    arch::start_timer(TICK_HZ);
    arch::enter(Transfer::Idle)
}

/// Runs `body` with a reference to the kernel.
///
/// To preserve uniqueness of the `&mut` reference passed into `body`, this
/// function will detect any attempts to call it recursively and panic.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of with_kernel
    }
    // Safety: we have observed `KERNEL_IN_USE` being false, which means the
    // kernel is initialized (note that at reset it starts out true) and that
    // we're not already within a call to with_kernel. Thus, we can produce a
    // reference to it without aliasing.
    let k = unsafe { (*addr_of_mut!(KERNEL)).assume_init_mut() };

    let r = body(k);

    KERNEL_IN_USE.store(false, Ordering::Release);

    r
}

/// Loads `image` as a new process and switches to it. This is how the shell
/// starts programs; it only comes back if the image can't be loaded.
pub fn launch<S: ImageSource + ?Sized>(
    image: &S,
    argv: &[&str],
) -> Result<Infallible, LoadError> {
    arch::disable_interrupts();
    let started = with_kernel(|k| {
        let pid = k.load(image, argv)?;
        Ok(k.resume(pid))
    });
    match started {
        Ok(t) => arch::enter(t),
        Err(e) => {
            arch::enable_interrupts();
            Err(e)
        }
    }
}
