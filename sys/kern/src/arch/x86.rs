// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for 32-bit x86.
//!
//! # Traps
//!
//! Every vector we care about gets a small assembly stub that makes the stack
//! look the same regardless of whether the processor pushed an error code,
//! pushes the vector number, and joins `trap_common`. That saves the general
//! purpose and segment registers, so that the whole interrupted context sits
//! on the kernel stack as a `SavedState`, and calls `trap_dispatch` with a
//! pointer to it.
//!
//! `trap_dispatch` never returns. Depending on the `Transfer` the kernel hands
//! back, it either pops the very frame it was given (`trap_restore`), builds a
//! frame for some process and pops that instead (`resume_user`), or gives up
//! the stack to the interactive shell.
//!
//! All gates are interrupt gates, so the kernel always runs with interrupts
//! off. Only the syscall gate is callable from ring 3.
//!
//! # Memory
//!
//! Physical memory below `USER_SPACE_BASE` is identity-mapped in every address
//! space, so `PhysMemory` reaches frame `n` at linear address `n * PAGE_SIZE`.
//!
//! # Collaborators
//!
//! The boot code provides `kernel_stack_top`. The console driver provides
//! `console_write` and the shell provides `kshell_main`.

use core::arch::{asm, global_asm};
use core::fmt::Write;
use core::ptr::addr_of_mut;

use abi::{vector, USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_INITIAL_EFLAGS};

use crate::frame::{FrameId, WORDS_PER_FRAME};
use crate::startup::with_kernel;
use crate::trap::{TrapInfo, Transfer};

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

#[cfg(feature = "klog-console")]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::arch::klog_fmt(format_args!($($arg)*))
    };
}

#[cfg(not(feature = "klog-console"))]
macro_rules! klog {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
const TSS_SELECTOR: u16 = 0x28;

/// Interrupted context, exactly as `trap_common` leaves it on the stack.
///
/// The last two fields are only pushed by the processor on a privilege change;
/// for a trap taken in ring 0 they are whatever was on the stack above.
#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedState {
    // NOTE: the order of these fields is fixed by trap_common!
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Value of `esp` at `pushal`; ignored by `popal`.
    pub kernel_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SavedState>(), 76);

impl crate::process::ArchState for SavedState {
    fn for_user_entry(entry: u32, stack: u32) -> Self {
        Self {
            gs: USER_DATA_SELECTOR,
            fs: USER_DATA_SELECTOR,
            es: USER_DATA_SELECTOR,
            ds: USER_DATA_SELECTOR,
            eip: entry,
            cs: USER_CODE_SELECTOR,
            eflags: USER_INITIAL_EFLAGS,
            esp: stack,
            ss: USER_DATA_SELECTOR,
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

/// Physical memory, reached through the kernel's identity map.
pub struct PhysMemory {
    frame_count: usize,
}

impl PhysMemory {
    /// # Safety
    ///
    /// Frames `1..frame_count` must be RAM, identity-mapped whenever the kernel
    /// runs, and reached by nothing else but the frame allocator.
    pub unsafe fn new(frame_count: usize) -> Self {
        Self { frame_count }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn frame_ptr(&self, frame: FrameId) -> *mut [u32; WORDS_PER_FRAME] {
        uassert!(frame.number() != 0 && frame.index() < self.frame_count);
        frame.paddr() as usize as *mut [u32; WORDS_PER_FRAME]
    }

    pub fn words(&self, frame: FrameId) -> &[u32; WORDS_PER_FRAME] {
        // Safety: per the contract of `new` the frame is ours and mapped, and
        // `&self` keeps writers away for the life of the borrow.
        unsafe { &*self.frame_ptr(frame) }
    }

    pub fn words_mut(&mut self, frame: FrameId) -> &mut [u32; WORDS_PER_FRAME] {
        // Safety: as above, with `&mut self` making this the only reference.
        unsafe { &mut *self.frame_ptr(frame) }
    }

    pub fn bytes(&self, frame: FrameId) -> &[u8] {
        zerocopy::IntoBytes::as_bytes(self.words(frame))
    }

    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        zerocopy::IntoBytes::as_mut_bytes(self.words_mut(frame))
    }
}

extern "C" {
    fn console_write(bytes: *const u8, len: usize);
    fn kshell_main() -> !;
    static kernel_stack_top: u8;
    static trap_table: [u32; TRAP_TABLE_LEN];
    fn trap_255();
    fn trap_restore(frame: *const SavedState) -> !;
}

/// Console output, handed to the display driver.
#[derive(Debug, Default)]
pub struct Console;

impl Console {
    pub fn write(&mut self, bytes: &[u8]) {
        // Safety: the driver only reads `len` bytes from `bytes`.
        unsafe { console_write(bytes.as_ptr(), bytes.len()) }
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}

#[cfg(feature = "klog-console")]
pub fn klog_fmt(args: core::fmt::Arguments<'_>) {
    let mut c = Console;
    c.write_fmt(args).ok();
    c.write(b"\n");
}

//
// MMU
//

pub fn set_page_directory(dir: FrameId) {
    // Safety: the directory always maps the kernel half, including the code
    // and stack we are running on, so switching to it is harmless. Paging is
    // turned on the first time through.
    unsafe {
        asm!(
            "mov cr3, {dir}",
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            dir = in(reg) dir.paddr(),
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

pub fn invalidate_page(addr: u32) {
    // Safety: dropping a TLB entry has no effect beyond a later refill.
    unsafe {
        asm!("invlpg [{0}]", in(reg) addr, options(nostack));
    }
}

pub fn flush_tlb() {
    // Safety: reloading CR3 with itself only empties the TLB.
    unsafe {
        asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

fn read_cr2() -> u32 {
    let addr: u32;
    // Safety: reading CR2 has no side effects.
    unsafe {
        asm!("mov {0}, cr2", out(reg) addr, options(nomem, nostack));
    }
    addr
}

//
// Port I/O, interrupt controllers and timer
//

fn outb(port: u16, value: u8) {
    // Safety: only used on the fixed PIC and PIT ports below.
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack));
    }
}

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

/// Remaps both interrupt controllers so IRQs 0-15 arrive on vectors
/// `IRQ_BASE..IRQ_LIMIT`, all unmasked.
pub fn init_interrupt_controllers() {
    let base = vector::IRQ_BASE;
    // ICW1: edge triggered, cascade, expect ICW4.
    outb(PIC1_COMMAND, 0x11);
    outb(PIC2_COMMAND, 0x11);
    outb(PIC1_DATA, base);
    outb(PIC2_DATA, base + 8);
    // Secondary on line 2.
    outb(PIC1_DATA, 1 << 2);
    outb(PIC2_DATA, 2);
    // 8086 mode.
    outb(PIC1_DATA, 0x01);
    outb(PIC2_DATA, 0x01);
    outb(PIC1_DATA, 0);
    outb(PIC2_DATA, 0);
}

pub fn end_of_interrupt(v: u8) {
    if !(vector::IRQ_BASE..vector::IRQ_LIMIT).contains(&v) {
        return;
    }
    if v >= vector::IRQ_BASE + 8 {
        outb(PIC2_COMMAND, PIC_EOI);
    }
    outb(PIC1_COMMAND, PIC_EOI);
}

const PIT_HZ: u32 = 1_193_182;

/// Programs channel 0 of the interval timer to interrupt `hz` times a second.
pub fn start_timer(hz: u32) {
    let divisor = (PIT_HZ / hz).clamp(1, 0xFFFF) as u16;
    // Channel 0, low then high byte, rate generator.
    outb(0x43, 0x34);
    outb(0x40, divisor as u8);
    outb(0x40, (divisor >> 8) as u8);
}

pub fn enable_interrupts() {
    // Safety: the kernel state is not borrowed whenever this is called.
    unsafe { asm!("sti", options(nomem, nostack)) }
}

pub fn disable_interrupts() {
    // Safety: masking interrupts is always allowed in ring 0.
    unsafe { asm!("cli", options(nomem, nostack)) }
}

pub fn halt() -> ! {
    loop {
        // Safety: with interrupts off this parks the processor for good.
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}

//
// Descriptor tables
//

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

const fn segment(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xFFFF)
        | (base as u64 & 0xFF_FFFF) << 16
        | (access as u64) << 40
        | ((limit as u64 >> 16) & 0xF) << 48
        | ((flags as u64) & 0xF) << 52
        | ((base as u64 >> 24) & 0xFF) << 56
}

/// 4 KiB granularity, 32-bit operands.
const FLAT: u8 = 0xC;

static mut GDT: [u64; 6] = [
    0,
    segment(0, 0xF_FFFF, 0x9A, FLAT),
    segment(0, 0xF_FFFF, 0x92, FLAT),
    segment(0, 0xF_FFFF, 0xFA, FLAT),
    segment(0, 0xF_FFFF, 0xF2, FLAT),
    // Filled in with the TSS address at boot.
    0,
];

/// Hardware task state. We only use it to find the kernel stack on a trap out
/// of ring 3.
#[repr(C)]
struct TaskState {
    link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    /// The I/O map base lives in the upper half; pointing it past the end
    /// means no I/O ports for ring 3.
    iomap: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TaskState>(), 104);

static mut TSS: TaskState = TaskState {
    link: 0,
    esp0: 0,
    ss0: KERNEL_DATA_SELECTOR as u32,
    unused: [0; 22],
    iomap: (core::mem::size_of::<TaskState>() as u32) << 16,
};

#[repr(C)]
#[derive(Copy, Clone)]
struct Gate {
    offset_lo: u16,
    selector: u16,
    zero: u8,
    attrs: u8,
    offset_hi: u16,
}

impl Gate {
    const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        zero: 0,
        attrs: 0,
        offset_hi: 0,
    };

    /// A present 32-bit interrupt gate callable from `dpl`.
    fn interrupt(handler: u32, dpl: u8) -> Self {
        Self {
            offset_lo: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            attrs: 0x8E | (dpl << 5),
            offset_hi: (handler >> 16) as u16,
        }
    }
}

static mut IDT: [Gate; 256] = [Gate::MISSING; 256];

/// Stubs exist for vectors `0..TRAP_TABLE_LEN` and for `SPURIOUS`.
const TRAP_TABLE_LEN: usize = vector::SYSCALL as usize + 1;

fn kernel_stack() -> u32 {
    // Safety: we only take the symbol's address.
    unsafe { core::ptr::addr_of!(kernel_stack_top) as u32 }
}

/// Loads the GDT, TSS and IDT.
///
/// # Safety
///
/// Call once, early in boot, with interrupts off.
pub unsafe fn install_descriptor_tables() {
    // Safety: boot is single threaded and nothing else touches these tables.
    let (gdt, tss, idt) = unsafe {
        (
            &mut *addr_of_mut!(GDT),
            &mut *addr_of_mut!(TSS),
            &mut *addr_of_mut!(IDT),
        )
    };

    tss.esp0 = kernel_stack();
    let tss_base = tss as *mut TaskState as u32;
    let tss_limit = core::mem::size_of::<TaskState>() as u32 - 1;
    gdt[usize::from(TSS_SELECTOR) / 8] = segment(tss_base, tss_limit, 0x89, 0);

    // Safety: the table is defined in the assembly below.
    let table = unsafe { &trap_table };
    for (v, &handler) in table.iter().enumerate() {
        let dpl = if v == usize::from(vector::SYSCALL) { 3 } else { 0 };
        idt[v] = Gate::interrupt(handler, dpl);
    }
    idt[usize::from(vector::SPURIOUS)] = Gate::interrupt(trap_255 as usize as u32, 0);

    let gdtr = DescriptorPointer {
        limit: (core::mem::size_of_val(gdt) - 1) as u16,
        base: gdt.as_ptr() as u32,
    };
    let idtr = DescriptorPointer {
        limit: (core::mem::size_of_val(idt) - 1) as u16,
        base: idt.as_ptr() as u32,
    };
    // Safety: the tables are static and fully built.
    unsafe {
        asm!(
            "lgdt [{gdtr}]",
            "push {code}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov {tmp:x}, {data:x}",
            "mov ds, {tmp:x}",
            "mov es, {tmp:x}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            "mov ss, {tmp:x}",
            "ltr {tss:x}",
            "lidt [{idtr}]",
            gdtr = in(reg) &gdtr,
            idtr = in(reg) &idtr,
            code = in(reg) u32::from(KERNEL_CODE_SELECTOR),
            data = in(reg) u32::from(KERNEL_DATA_SELECTOR),
            tss = in(reg) u32::from(TSS_SELECTOR),
            tmp = out(reg) _,
        );
    }
}

global_asm! {r#"
    .section .text.traps, "ax"

    .macro trap_noerr vec
    .globl trap_\vec
    trap_\vec:
        pushl $0
        pushl $\vec
        jmp trap_common
    .endm

    .macro trap_err vec
    .globl trap_\vec
    trap_\vec:
        pushl $\vec
        jmp trap_common
    .endm

    .irp vec, 0,1,2,3,4,5,6,7,9,15,16,18,19,20,22,23,24,25,26,27,28,29,30,31
    trap_noerr \vec
    .endr
    .irp vec, 8,10,11,12,13,14,17,21
    trap_err \vec
    .endr
    .irp vec, 32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48,255
    trap_noerr \vec
    .endr

    trap_common:
        pushal
        pushl %ds
        pushl %es
        pushl %fs
        pushl %gs
        movw $0x10, %ax
        movw %ax, %ds
        movw %ax, %es
        movw %ax, %fs
        movw %ax, %gs
        cld
        pushl %esp
        call trap_dispatch
        # trap_dispatch does not return
        ud2

    .globl trap_restore
    trap_restore:
        movl 4(%esp), %esp
        popl %gs
        popl %fs
        popl %es
        popl %ds
        popal
        # vector and error code
        addl $8, %esp
        iret

    .section .rodata.trap_table, "a"
    .balign 4
    .globl trap_table
    trap_table:
    .irp vec, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48
    .long trap_\vec
    .endr
    "#,
    options(att_syntax),
}

/// Common trap handler, called by `trap_common` with interrupts off.
///
/// # Safety
///
/// Only `trap_common` may call this, passing the frame it just built.
#[no_mangle]
unsafe extern "C" fn trap_dispatch(frame: *mut SavedState) -> ! {
    // Safety: the frame is on our stack, complete up to `esp`/`ss`, which are
    // meaningless for ring 0 traps but still readable.
    let snapshot = unsafe { (*frame).clone() };
    let vector = snapshot.vector as u8;
    let info = TrapInfo {
        vector,
        error_code: snapshot.error_code,
        fault_address: if vector == vector::PAGE_FAULT {
            read_cr2()
        } else {
            0
        },
    };
    match with_kernel(|k| k.handle_trap(info, &snapshot)) {
        // Safety: this is the frame trap_common built.
        Transfer::Return => unsafe { trap_restore(frame) },
        // Nothing to run and we interrupted the shell: let it carry on.
        // Safety: as above.
        Transfer::Idle if snapshot.cs & 3 == 0 => unsafe { trap_restore(frame) },
        t => enter(t),
    }
}

/// Does what a `Transfer` says, from outside any trap.
pub fn enter(t: Transfer) -> ! {
    match t {
        Transfer::Resume(pid) => {
            let save = with_kernel(|k| k.process(pid).save().clone());
            resume_user(&save)
        }
        Transfer::Return | Transfer::Idle => {
            enable_interrupts();
            // Safety: the shell owns the kernel stack from here on.
            unsafe { kshell_main() }
        }
    }
}

/// Drops into user mode with the registers in `state`.
///
/// The frame is built at the very top of the kernel stack, where a trap from
/// ring 3 would have left it, so everything currently on the stack is
/// discarded.
pub fn resume_user(state: &SavedState) -> ! {
    uassert!(state.cs & 3 == 3);
    let top = kernel_stack() as usize;
    let frame = (top - core::mem::size_of::<SavedState>()) as *mut SavedState;
    // Safety: the frame lies above every Rust frame on the stack, and
    // trap_restore leaves the kernel for good.
    unsafe {
        frame.write(state.clone());
        trap_restore(frame)
    }
}
