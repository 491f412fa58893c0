// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Program loading.
//!
//! Builds a fresh address space from an ELF32 i386 executable (or from a flat
//! code blob, for `create`), maps a stack, and leaves the entry hand-off for
//! the program's startup code at the initial stack pointer:
//!
//! ```text
//! USER_STACK_TOP -> +--------------------------+
//!                   | argv strings, NUL-ended  |
//!                   | (padding to 4 bytes)     |
//!                   | argv[0..argc], NULL      |
//!                   | copy of .init_array      |
//!      initial sp -> | AppInitState             |
//!                   +--------------------------+
//! ```
//!
//! The whole hand-off must fit in the top page of the stack.

use abi::{
    AppInitState, PAGE_SIZE, USER_LOAD_BASE, USER_SPACE_END, USER_STACK_BASE,
    USER_STACK_PAGES, USER_STACK_TOP,
};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::arch;
use crate::frame::FrameAllocator;
use crate::kernel::Kernel;
use crate::paging::{AddressSpace, MapFlags, PteFlags};
use crate::process::ArchState;

/// Reasons an image can't be loaded. None of them leave anything allocated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    /// The image ends before something it claims to contain.
    Truncated,
    BadMagic,
    /// Not a 32-bit little-endian object.
    BadClass,
    /// Not for the i386.
    BadMachine,
    /// Table entry sizes or section contents make no sense.
    BadHeader,
    /// The entry point is below `USER_LOAD_BASE` or outside user space.
    EntryOutOfRange,
    /// A loadable segment reaches outside `USER_LOAD_BASE..USER_SPACE_END`.
    SegmentOutOfRange,
    /// Arguments and initializer table don't fit in one page of stack.
    ArgsTooLarge,
}

/// Where a program image comes from. The filesystem implements this for its
/// files; the kernel implements it for byte slices.
pub trait ImageSource {
    /// Fills `buf` with the image bytes starting at `offset`.
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<(), LoadError>;
}

impl ImageSource for [u8] {
    fn read_at(&self, offset: u32, buf: &mut [u8]) -> Result<(), LoadError> {
        let start = offset as usize;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.get(start..end))
            .ok_or(LoadError::Truncated)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

pub const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;
pub const PF_W: u32 = 2;
pub const SHT_INIT_ARRAY: u32 = 14;

#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct Elf32Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

static_assertions::assert_eq_size!(Elf32Ehdr, [u8; 52]);
static_assertions::assert_eq_size!(Elf32Phdr, [u8; 32]);
static_assertions::assert_eq_size!(Elf32Shdr, [u8; 40]);
static_assertions::assert_eq_size!(AppInitState, [u8; 16]);

fn read_record<T, S>(src: &S, offset: u32) -> Result<T, LoadError>
where
    T: FromBytes + IntoBytes,
    S: ImageSource + ?Sized,
{
    let mut record = T::new_zeroed();
    src.read_at(offset, record.as_mut_bytes())?;
    Ok(record)
}

/// A validated ELF header and the image it came from.
pub struct Elf32Image<'a, S: ImageSource + ?Sized> {
    src: &'a S,
    header: Elf32Ehdr,
}

impl<'a, S: ImageSource + ?Sized> Elf32Image<'a, S> {
    pub fn parse(src: &'a S) -> Result<Self, LoadError> {
        let header: Elf32Ehdr = read_record(src, 0)?;
        let ident = &header.e_ident;
        if ident[..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if ident[4] != ELFCLASS32 || ident[5] != ELFDATA2LSB {
            return Err(LoadError::BadClass);
        }
        if header.e_machine != EM_386 {
            return Err(LoadError::BadMachine);
        }
        if header.e_phnum != 0
            && usize::from(header.e_phentsize) != size_of::<Elf32Phdr>()
        {
            return Err(LoadError::BadHeader);
        }
        if header.e_shnum != 0
            && usize::from(header.e_shentsize) != size_of::<Elf32Shdr>()
        {
            return Err(LoadError::BadHeader);
        }
        if !(USER_LOAD_BASE..USER_SPACE_END).contains(&header.e_entry) {
            return Err(LoadError::EntryOutOfRange);
        }
        Ok(Self { src, header })
    }

    pub fn entry(&self) -> u32 {
        self.header.e_entry
    }

    fn table_entry<T: FromBytes + IntoBytes>(
        &self,
        base: u32,
        index: u16,
    ) -> Result<T, LoadError> {
        let offset = u32::from(index)
            .checked_mul(size_of::<T>() as u32)
            .and_then(|o| o.checked_add(base))
            .ok_or(LoadError::Truncated)?;
        read_record(self.src, offset)
    }

    pub fn program_header(&self, index: u16) -> Result<Elf32Phdr, LoadError> {
        self.table_entry(self.header.e_phoff, index)
    }

    pub fn section_header(&self, index: u16) -> Result<Elf32Shdr, LoadError> {
        self.table_entry(self.header.e_shoff, index)
    }

    /// Yields the `PT_LOAD` program headers in table order.
    pub fn segments(
        &self,
    ) -> impl Iterator<Item = Result<Elf32Phdr, LoadError>> + '_ {
        (0..self.header.e_phnum)
            .map(|i| self.program_header(i))
            .filter(|ph| !matches!(ph, Ok(p) if p.p_type != PT_LOAD))
    }

    /// Locates the static initializer table, if the image has one.
    pub fn init_array(&self) -> Result<InitArray, LoadError> {
        for i in 0..self.header.e_shnum {
            let sh = self.section_header(i)?;
            if sh.sh_type != SHT_INIT_ARRAY {
                continue;
            }
            if sh.sh_size % 4 != 0 {
                return Err(LoadError::BadHeader);
            }
            return Ok(InitArray {
                offset: sh.sh_offset,
                count: sh.sh_size / 4,
            });
        }
        Ok(InitArray::default())
    }
}

/// Location of the static initializer pointers within an image.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InitArray {
    pub offset: u32,
    pub count: u32,
}

/// Bytes moved per step when copying out of an image.
const COPY_CHUNK: usize = 256;

/// Copies `len` image bytes at `offset` to `vaddr` in `space`.
fn copy_image<S: ImageSource + ?Sized>(
    frames: &mut FrameAllocator,
    space: AddressSpace,
    src: &S,
    offset: u32,
    vaddr: u32,
    len: u32,
) -> Result<(), LoadError> {
    let mut buf = [0; COPY_CHUNK];
    let mut done = 0;
    while done < len {
        let n = usize::min(COPY_CHUNK, (len - done) as usize);
        let from = offset.checked_add(done).ok_or(LoadError::Truncated)?;
        src.read_at(from, &mut buf[..n])?;
        space.write_bytes(frames, vaddr + done, &buf[..n]);
        done += n as u32;
    }
    Ok(())
}

fn zero_fill(frames: &mut FrameAllocator, space: AddressSpace, vaddr: u32, len: u32) {
    let zeros = [0; COPY_CHUNK];
    let mut done = 0;
    while done < len {
        let n = usize::min(COPY_CHUNK, (len - done) as usize);
        space.write_bytes(frames, vaddr + done, &zeros[..n]);
        done += n as u32;
    }
}

/// Maps every page `[start, start + size)` touches. Pages already mapped by an
/// earlier segment are kept, and made writable if `flags` asks for it.
fn map_segment(
    frames: &mut FrameAllocator,
    space: AddressSpace,
    start: u32,
    size: u32,
    flags: MapFlags,
) -> Result<(), LoadError> {
    let (lo, hi) = kerncore::page_span(start as usize, size as usize)
        .ok_or(LoadError::SegmentOutOfRange)?;
    for va in (lo..hi).step_by(PAGE_SIZE).map(|va| va as u32) {
        match space.leaf(frames, va) {
            Some(e) => {
                if flags.contains(MapFlags::WRITE) && !e.is_writable() {
                    let flags = e.flags() | PteFlags::WRITABLE;
                    space.set_leaf(frames, va, e.with_flags(flags));
                }
            }
            None => {
                let frame = frames.allocate();
                space.map_page(frames, va, frame, flags);
            }
        }
    }
    Ok(())
}

fn load_segment<S: ImageSource + ?Sized>(
    frames: &mut FrameAllocator,
    space: AddressSpace,
    elf: &Elf32Image<'_, S>,
    ph: &Elf32Phdr,
) -> Result<(), LoadError> {
    if ph.p_filesz > ph.p_memsz {
        return Err(LoadError::BadHeader);
    }
    let end = u64::from(ph.p_vaddr) + u64::from(ph.p_memsz);
    if ph.p_vaddr < USER_LOAD_BASE || end > u64::from(USER_SPACE_END) {
        return Err(LoadError::SegmentOutOfRange);
    }
    if ph.p_memsz == 0 {
        return Ok(());
    }

    let mut flags = MapFlags::USER;
    flags.set(MapFlags::WRITE, ph.p_flags & PF_W != 0);
    map_segment(frames, space, ph.p_vaddr, ph.p_memsz, flags)?;
    copy_image(frames, space, elf.src, ph.p_offset, ph.p_vaddr, ph.p_filesz)?;
    zero_fill(
        frames,
        space,
        ph.p_vaddr + ph.p_filesz,
        ph.p_memsz - ph.p_filesz,
    );
    Ok(())
}

/// Downward allocator over the top page of a new stack.
struct HandOff {
    sp: u32,
}

impl HandOff {
    const FLOOR: u32 = USER_STACK_TOP - PAGE_SIZE as u32;

    fn reserve(&mut self, len: usize) -> Result<u32, LoadError> {
        let len = u32::try_from(len).map_err(|_| LoadError::ArgsTooLarge)?;
        self.sp = self
            .sp
            .checked_sub(len)
            .filter(|&sp| sp >= Self::FLOOR)
            .ok_or(LoadError::ArgsTooLarge)?;
        Ok(self.sp)
    }
}

/// Maps the stack and writes the entry hand-off onto it, returning the initial
/// stack pointer.
fn build_stack<S: ImageSource + ?Sized>(
    frames: &mut FrameAllocator,
    space: AddressSpace,
    argv: &[&str],
    src: &S,
    init: InitArray,
) -> Result<u32, LoadError> {
    space.map_region_alloc(
        frames,
        USER_STACK_BASE,
        USER_STACK_PAGES * PAGE_SIZE,
        MapFlags::USER | MapFlags::WRITE,
    );
    let mut h = HandOff { sp: USER_STACK_TOP };

    let string_bytes = argv.iter().map(|a| a.len() + 1).sum();
    let mut s = h.reserve(string_bytes)?;
    h.sp &= !3;
    let argv_base = h.reserve((argv.len() + 1) * 4)?;
    let table = h.reserve(init.count as usize * 4)?;
    let state_addr = h.reserve(size_of::<AppInitState>())?;

    for (i, arg) in argv.iter().enumerate() {
        space.write_bytes(frames, s, arg.as_bytes());
        space.write_bytes(frames, s + arg.len() as u32, &[0]);
        space.write_bytes(frames, argv_base + 4 * i as u32, s.as_bytes());
        s += arg.len() as u32 + 1;
    }
    space.write_bytes(frames, argv_base + 4 * argv.len() as u32, 0u32.as_bytes());
    copy_image(frames, space, src, init.offset, table, init.count * 4)?;

    let state = AppInitState {
        init_fn_table: table,
        init_fn_count: init.count,
        argc: argv.len() as u32,
        argv: argv_base,
    };
    space.write_bytes(frames, state_addr, state.as_bytes());
    Ok(state_addr)
}

impl Kernel {
    /// Loads the ELF executable `image` into a new process that will start
    /// with arguments `argv`, and returns its pid. The process is runnable but
    /// the caller decides when it runs.
    pub fn load<S: ImageSource + ?Sized>(
        &mut self,
        image: &S,
        argv: &[&str],
    ) -> Result<usize, LoadError> {
        let elf = Elf32Image::parse(image)?;
        let init = elf.init_array()?;
        let pid = self.build_process(|frames, space| {
            for ph in elf.segments() {
                load_segment(frames, space, &elf, &ph?)?;
            }
            let sp = build_stack(frames, space, argv, image, init)?;
            Ok((elf.entry(), sp))
        })?;
        klog!(
            "kern: loaded process {} entry {:#x} argc {}",
            pid,
            elf.entry(),
            argv.len()
        );
        Ok(pid)
    }

    /// Creates a process running the flat binary `code`, which is placed at
    /// `USER_LOAD_BASE` and entered at its first byte.
    pub fn create(&mut self, code: &[u8]) -> Result<usize, LoadError> {
        let len = u32::try_from(code.len())
            .ok()
            .filter(|&n| n <= USER_SPACE_END - USER_LOAD_BASE)
            .ok_or(LoadError::SegmentOutOfRange)?;
        self.build_process(|frames, space| {
            space.map_region_alloc(
                frames,
                USER_LOAD_BASE,
                len.max(1) as usize,
                MapFlags::USER | MapFlags::WRITE,
            );
            space.write_bytes(frames, USER_LOAD_BASE, code);
            let sp = build_stack(frames, space, &[], code, InitArray::default())?;
            Ok((USER_LOAD_BASE, sp))
        })
    }

    /// Runs `fill` against a fresh user address space, which must map the
    /// program and return its entry point and stack pointer. Only if that
    /// works does the space get a process slot.
    fn build_process(
        &mut self,
        fill: impl FnOnce(
            &mut FrameAllocator,
            AddressSpace,
        ) -> Result<(u32, u32), LoadError>,
    ) -> Result<usize, LoadError> {
        let space = AddressSpace::new_user(&mut self.frames, self.kernel_space);
        let (entry, sp) = match fill(&mut self.frames, space) {
            Ok(r) => r,
            Err(e) => {
                space.release_address_space(&mut self.frames);
                return Err(e);
            }
        };
        let pid = self.allocate_process();
        let p = &mut self.procs[pid];
        p.set_space(space);
        p.set_save(arch::SavedState::for_user_entry(entry, sp));
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: u32 = USER_LOAD_BASE + 0x10;

    /// Builds an ELF image with one loadable segment at `USER_LOAD_BASE` made
    /// of `text` followed by `bss` zero bytes, plus an optional init array.
    fn elf(text: &[u8], bss: u32, inits: &[u32]) -> Vec<u8> {
        let phoff = size_of::<Elf32Ehdr>() as u32;
        let text_off = phoff + size_of::<Elf32Phdr>() as u32;
        let init_off = text_off + text.len() as u32;
        let shoff = init_off + 4 * inits.len() as u32;

        let mut ident = [0; 16];
        ident[..4].copy_from_slice(&ELF_MAGIC);
        ident[4] = ELFCLASS32;
        ident[5] = ELFDATA2LSB;
        let ehdr = Elf32Ehdr {
            e_ident: ident,
            e_type: 2,
            e_machine: EM_386,
            e_version: 1,
            e_entry: ENTRY,
            e_phoff: phoff,
            e_shoff: shoff,
            e_ehsize: phoff as u16,
            e_phentsize: size_of::<Elf32Phdr>() as u16,
            e_phnum: 1,
            e_shentsize: size_of::<Elf32Shdr>() as u16,
            e_shnum: if inits.is_empty() { 0 } else { 1 },
            ..Elf32Ehdr::default()
        };
        let phdr = Elf32Phdr {
            p_type: PT_LOAD,
            p_offset: text_off,
            p_vaddr: USER_LOAD_BASE,
            p_filesz: text.len() as u32,
            p_memsz: text.len() as u32 + bss,
            p_flags: PF_W,
            ..Elf32Phdr::default()
        };
        let mut out = Vec::new();
        out.extend_from_slice(ehdr.as_bytes());
        out.extend_from_slice(phdr.as_bytes());
        out.extend_from_slice(text);
        for f in inits {
            out.extend_from_slice(f.as_bytes());
        }
        if !inits.is_empty() {
            let shdr = Elf32Shdr {
                sh_type: SHT_INIT_ARRAY,
                sh_offset: init_off,
                sh_size: 4 * inits.len() as u32,
                ..Elf32Shdr::default()
            };
            out.extend_from_slice(shdr.as_bytes());
        }
        out
    }

    fn read<const N: usize>(k: &Kernel, pid: usize, va: u32) -> [u8; N] {
        let mut buf = [0; N];
        k.process(pid)
            .space()
            .unwrap()
            .read_bytes(k.frames(), va, &mut buf);
        buf
    }

    fn word(k: &Kernel, pid: usize, va: u32) -> u32 {
        u32::from_ne_bytes(read::<4>(k, pid, va))
    }

    #[test]
    fn loads_text_and_zeroes_bss() {
        let mut k = Kernel::for_test(256);
        let image = elf(b"0123456789", 6, &[]);
        let pid = k.load(&image[..], &[]).unwrap();

        let save = k.process(pid).save();
        assert_eq!(save.pc(), ENTRY);
        assert_eq!(&read::<10>(&k, pid, USER_LOAD_BASE), b"0123456789");
        assert_eq!(read::<6>(&k, pid, USER_LOAD_BASE + 10), [0; 6]);
    }

    #[test]
    fn argv_and_init_table_sit_above_the_stack_pointer() {
        let mut k = Kernel::for_test(256);
        let image = elf(&[0x90; 32], 0, &[0x4000_8004, 0x4000_8008]);
        let pid = k.load(&image[..], &["prog", "-v"]).unwrap();
        let sp = k.process(pid).save().stack_pointer();

        // Strings are 8 bytes, so the pointer array starts 12 bytes below,
        // the init table 8 below that, and the state record 16 further.
        assert_eq!(sp, USER_STACK_TOP - 8 - 12 - 8 - 16);
        let state = AppInitState::read_from_bytes(&read::<16>(&k, pid, sp)).unwrap();
        assert_eq!(state.argc, 2);
        assert_eq!(state.init_fn_count, 2);
        assert_eq!(state.init_fn_table, sp + 16);
        assert_eq!(state.argv, sp + 16 + 8);

        assert_eq!(word(&k, pid, state.init_fn_table), 0x4000_8004);
        assert_eq!(word(&k, pid, state.init_fn_table + 4), 0x4000_8008);
        let a0 = word(&k, pid, state.argv);
        let a1 = word(&k, pid, state.argv + 4);
        assert_eq!(word(&k, pid, state.argv + 8), 0);
        assert_eq!(&read::<5>(&k, pid, a0), b"prog\0");
        assert_eq!(&read::<3>(&k, pid, a1), b"-v\0");
    }

    #[test]
    fn bad_images_are_rejected_without_leaking() {
        let mut k = Kernel::for_test(256);
        let before = k.frames().available_count();
        let good = elf(&[0x90; 4], 0, &[]);

        let mut bad_magic = good.clone();
        bad_magic[1] = b'X';
        assert_eq!(k.load(&bad_magic[..], &[]), Err(LoadError::BadMagic));

        let mut bad_class = good.clone();
        bad_class[4] = 2;
        assert_eq!(k.load(&bad_class[..], &[]), Err(LoadError::BadClass));

        let mut bad_machine = good.clone();
        bad_machine[18] = 0x3e;
        assert_eq!(k.load(&bad_machine[..], &[]), Err(LoadError::BadMachine));

        let mut low_entry = good.clone();
        low_entry[24..28].copy_from_slice(&0x1000u32.to_ne_bytes());
        assert_eq!(k.load(&low_entry[..], &[]), Err(LoadError::EntryOutOfRange));

        // Segment in the kernel half, caught after the space exists.
        let mut low_segment = good.clone();
        let vaddr = size_of::<Elf32Ehdr>() + 8;
        low_segment[vaddr..vaddr + 4].copy_from_slice(&0x2000u32.to_ne_bytes());
        assert_eq!(
            k.load(&low_segment[..], &[]),
            Err(LoadError::SegmentOutOfRange)
        );

        assert_eq!(k.load(&good[..20], &[]), Err(LoadError::Truncated));

        let huge = "x".repeat(PAGE_SIZE);
        assert_eq!(k.load(&good[..], &[huge.as_str()]), Err(LoadError::ArgsTooLarge));

        assert_eq!(k.frames().available_count(), before);
        assert!(k.processes().iter().all(|p| !p.is_live()));
    }

    #[test]
    fn segments_sharing_a_page_map_it_once() {
        let mut k = Kernel::for_test(256);
        let space = AddressSpace::new_user(&mut k.frames, k.kernel_space);
        map_segment(&mut k.frames, space, USER_LOAD_BASE, 0x100, MapFlags::USER)
            .unwrap();
        let first = space.leaf(&k.frames, USER_LOAD_BASE).unwrap();
        assert!(!first.is_writable());

        map_segment(
            &mut k.frames,
            space,
            USER_LOAD_BASE + 0x100,
            0x1000,
            MapFlags::USER | MapFlags::WRITE,
        )
        .unwrap();
        let again = space.leaf(&k.frames, USER_LOAD_BASE).unwrap();
        assert_eq!(again.frame(), first.frame());
        assert!(again.is_writable());
        assert_eq!(k.frames.user_refcount(first.frame()), 1);
        assert!(space.leaf(&k.frames, USER_LOAD_BASE + 0x1000).is_some());
    }

    #[test]
    fn flat_binaries_enter_at_the_load_base() {
        let mut k = Kernel::for_test(128);
        let pid = k.create(&[0xCC; 8]).unwrap();
        let save = k.process(pid).save();
        assert_eq!(save.pc(), USER_LOAD_BASE);
        assert_eq!(save.stack_pointer(), USER_STACK_TOP - 4 - 16);
        assert_eq!(read::<8>(&k, pid, USER_LOAD_BASE), [0xCC; 8]);
        let state = AppInitState::read_from_bytes(&read::<16>(
            &k,
            pid,
            save.stack_pointer(),
        ))
        .unwrap();
        assert_eq!((state.argc, state.init_fn_count), (0, 0));
    }
}
