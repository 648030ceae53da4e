//! The image-loading pipeline: header validation, segment mapping, dynamic
//! parsing, dependency checking, relocation, permissions, entry fixup.

use alloc::{string::String, sync::Arc, vec::Vec};
use hashbrown::HashSet;

use crate::{
    VirtAddr, debug,
    memory::{
        AlignToPage,
        frame_allocator,
        paging::{self, EntryFlags, PAGE_SIZE},
    },
    utils::types::truncated_name,
    warn,
};

use super::{
    Module, ModuleError,
    elf::{
        self, DT_BIND_NOW, DT_DEBUG, DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_FLAGS_1,
        DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_JMPREL, DT_NEEDED, DT_NULL,
        DT_PLTGOT, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELACOUNT, DT_RELAENT, DT_RELASZ,
        DT_REL, DT_RELENT, DT_RELSZ, DT_RPATH, DT_SONAME, DT_STRSZ, DT_STRTAB, DT_SYMBOLIC,
        DT_SYMENT, DT_SYMTAB, DT_TEXTREL, Elf64Dyn, Elf64Ehdr, Elf64Phdr, PF_W, PF_X,
        PT_DYNAMIC, PT_LOAD,
    },
    reloc::{self, RelocContext},
    symbols::{self, ImageSymbols},
};

/// Bounds-checked reads from the in-memory module file.
struct ImageReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ImageReader<'a> {
    fn read<T: Copy>(&self, offset: usize) -> Result<T, ModuleError> {
        let end = offset
            .checked_add(size_of::<T>())
            .ok_or(ModuleError::BadImage("offset overflow"))?;
        if end > self.bytes.len() {
            return Err(ModuleError::BadImage("truncated file"));
        }
        Ok(unsafe { self.bytes.as_ptr().add(offset).cast::<T>().read_unaligned() })
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], ModuleError> {
        let end = offset
            .checked_add(len)
            .ok_or(ModuleError::BadImage("offset overflow"))?;
        self.bytes
            .get(offset..end)
            .ok_or(ModuleError::BadImage("truncated segment"))
    }
}

/// Loads `image` into a fresh span and returns the fully relocated module.
/// Constructors are *not* run here; the caller does that after publishing.
/// `list` is the module list, held exclusively by the caller, used for
/// dependency checks and cross-module resolution.
pub(super) fn load_image(
    image: &[u8],
    name: &str,
    parameters: Vec<String>,
    list: &[Arc<Module>],
) -> Result<Module, ModuleError> {
    let reader = ImageReader { bytes: image };

    // File header. The program-header record size is fixed by ELF64; a
    // mismatch means the file is not what it claims to be.
    let ehdr: Elf64Ehdr = reader.read(0)?;
    if ehdr.e_ident[..4] != elf::ELF_MAGIC {
        return Err(ModuleError::BadImage("bad magic"));
    }
    if ehdr.e_phentsize as usize != size_of::<Elf64Phdr>() {
        return Err(ModuleError::BadImage("unexpected program-header size"));
    }

    let mut phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
    for index in 0..ehdr.e_phnum as usize {
        let phdr: Elf64Phdr =
            reader.read(ehdr.e_phoff as usize + index * size_of::<Elf64Phdr>())?;
        phdrs.push(phdr);
    }

    // Address range covered by loadable segments.
    let mut min_vaddr = u64::MAX;
    let mut max_vaddr = 0u64;
    for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        min_vaddr = min_vaddr.min(phdr.p_vaddr);
        max_vaddr = max_vaddr.max(phdr.p_vaddr + phdr.p_memsz);
    }
    if min_vaddr >= max_vaddr {
        return Err(ModuleError::BadImage("no loadable segments"));
    }

    let span_pages = ((max_vaddr - min_vaddr) as usize).to_next_page() / PAGE_SIZE + 1;
    let image_base = paging::ops()
        .reserve_span(span_pages)
        .ok_or(ModuleError::OutOfMemory)?;
    let base_adj = image_base.into_raw() as i64 - min_vaddr as i64;

    let mut module = Module {
        name: String::from(name),
        image_base,
        span_pages,
        mapped: Vec::new(),
        min_vaddr,
        max_vaddr,
        base_adj,
        phdrs,
        dt_strtab: 0,
        dt_symtab: 0,
        dt_hash: 0,
        dt_pltgot: 0,
        dt_jmprel: 0,
        dt_pltrelsz: 0,
        dt_rela: 0,
        dt_relasz: 0,
        dt_needed: Vec::new(),
        dt_init: 0,
        dt_init_array: 0,
        dt_init_arraysz: 0,
        dt_fini: 0,
        dt_fini_array: 0,
        dt_fini_arraysz: 0,
        dt_bind_now: false,
        dt_flags_1: 0,
        unknown_tags: 0,
        symbols: None,
        entry: 0,
        first_exec: 0,
        argv_storage: Vec::new(),
    };

    // Map every loadable page writable; segments sharing a page share its
    // frame. Permissions are corrected after relocation.
    map_segments(&mut module)?;

    // Copy segment contents and zero the memsz tails.
    load_segments(&module, &reader)?;

    // The dynamic segment is read from the file, not the mapped image, so
    // a hostile DT table cannot shift under us mid-parse.
    let dyn_entries = read_dynamic(&module, &reader)?;
    parse_dynamic(&mut module, &dyn_entries)?;

    module.symbols = Some(unsafe {
        ImageSymbols::from_image(
            (module.dt_hash as i64 + base_adj) as usize,
            (module.dt_symtab as i64 + base_adj) as usize,
            (module.dt_strtab as i64 + base_adj) as usize,
            base_adj,
        )
    });

    // Dependencies must already be loaded. The first missing one is
    // surfaced so the caller can load it and retry.
    for &name_offset in &module.dt_needed {
        let needed = read_image_string(&module, name_offset)?;
        if !list.iter().any(|other| other.name() == needed) {
            return Err(ModuleError::MissingDependency(truncated_name(&needed)));
        }
    }

    // Relocate. Named symbols search the module's own table first, then
    // the kernel exports, then every other loaded module.
    let symbols_view = *module.symbols();
    let ctx = RelocContext {
        base_adj,
        dt_rela: module.dt_rela,
        dt_relasz: module.dt_relasz,
        dt_jmprel: module.dt_jmprel,
        dt_pltrelsz: module.dt_pltrelsz,
        dt_pltgot: module.dt_pltgot,
        bind_now: module.dt_bind_now || module.dt_flags_1 & 1 != 0,
        symbols: symbols_view,
        resolve: &|sym_name: &str| {
            symbols_view
                .lookup(sym_name)
                .or_else(|| symbols::kernel_lookup(sym_name))
                .or_else(|| list.iter().find_map(|other| other.symbols().lookup(sym_name)))
        },
    };
    reloc::apply_relocations(&ctx)?;

    // The PLT handler is installed by the caller once the record has its
    // final address; GOT[1] must name the published module.

    apply_segment_permissions(&module);

    module.first_exec = module
        .phdrs
        .iter()
        .filter(|p| p.p_type == PT_LOAD && p.p_flags & PF_X != 0)
        .map(|p| (p.p_vaddr as i64 + base_adj) as u64)
        .min()
        .unwrap_or(0);

    if ehdr.e_entry != 0 {
        module.entry = (ehdr.e_entry as i64 + base_adj) as u64;
    }

    // argv: module name first, then the parameters, NUL terminated each.
    let mut argv_storage = Vec::with_capacity(parameters.len() + 1);
    for arg in core::iter::once(name.into()).chain(parameters) {
        let arg: String = arg;
        let mut bytes = arg.into_bytes();
        bytes.push(0);
        argv_storage.push(bytes);
    }
    module.argv_storage = argv_storage;

    if module.unknown_tags != 0 {
        debug!(
            Module,
            "{}: tolerated {} unknown .dynamic entries", module.name, module.unknown_tags
        );
    }

    Ok(module)
}

fn map_segments(module: &mut Module) -> Result<(), ModuleError> {
    let mut committed: HashSet<usize> = HashSet::new();

    let segments: Vec<(u64, u64)> = module
        .phdrs
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .map(|p| (p.p_vaddr, p.p_memsz))
        .collect();

    for (vaddr, memsz) in segments {
        let start = VirtAddr::from((vaddr as i64 + module.base_adj) as usize).to_previous_page();
        let end = VirtAddr::from((vaddr as i64 + module.base_adj) as usize + memsz as usize)
            .to_next_page();

        let mut page = start;
        while page < end {
            if committed.insert(page.into_raw()) {
                let frame =
                    frame_allocator::allocate_frame().ok_or(ModuleError::OutOfMemory)?;
                if let Err(err) = paging::ops().map_page(page, frame, EntryFlags::WRITE) {
                    warn!(Module, "segment map failed: {err}");
                    frame_allocator::deallocate_frame(frame);
                    return Err(ModuleError::OutOfMemory);
                }
                module.mapped.push((page, frame));
            }
            page += PAGE_SIZE;
        }
    }

    Ok(())
}

fn load_segments(module: &Module, reader: &ImageReader) -> Result<(), ModuleError> {
    for phdr in module.phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let dst = (phdr.p_vaddr as i64 + module.base_adj) as usize as *mut u8;
        let file = reader.slice(phdr.p_offset as usize, phdr.p_filesz as usize)?;

        unsafe {
            core::ptr::copy_nonoverlapping(file.as_ptr(), dst, file.len());
            // Zero the tail: .bss and friends.
            let tail = (phdr.p_memsz - phdr.p_filesz) as usize;
            dst.add(file.len()).write_bytes(0, tail);
        }
    }
    Ok(())
}

fn read_dynamic(module: &Module, reader: &ImageReader) -> Result<Vec<Elf64Dyn>, ModuleError> {
    let Some(dyn_seg) = module.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
        return Err(ModuleError::BadImage("no dynamic segment"));
    };

    if dyn_seg.p_memsz as usize % size_of::<Elf64Dyn>() != 0 {
        return Err(ModuleError::BadImage("dynamic segment has unexpected size"));
    }

    let count = dyn_seg.p_filesz as usize / size_of::<Elf64Dyn>();
    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        entries.push(reader.read::<Elf64Dyn>(
            dyn_seg.p_offset as usize + index * size_of::<Elf64Dyn>(),
        )?);
    }
    Ok(entries)
}

fn parse_dynamic(module: &mut Module, entries: &[Elf64Dyn]) -> Result<(), ModuleError> {
    for entry in entries {
        match entry.d_tag {
            DT_NULL => break,

            DT_STRTAB => module.dt_strtab = entry.d_val,
            DT_SYMTAB => module.dt_symtab = entry.d_val,
            DT_HASH => module.dt_hash = entry.d_val,
            DT_PLTGOT => module.dt_pltgot = entry.d_val,
            DT_JMPREL => module.dt_jmprel = entry.d_val,
            DT_PLTRELSZ => module.dt_pltrelsz = entry.d_val,
            DT_RELA => module.dt_rela = entry.d_val,
            DT_RELASZ => module.dt_relasz = entry.d_val,

            DT_SYMENT => {
                if entry.d_val as usize != size_of::<elf::Elf64Sym>() {
                    return Err(ModuleError::BadImage("unexpected symbol record size"));
                }
            }
            DT_RELAENT => {
                if entry.d_val as usize != size_of::<elf::Elf64Rela>() {
                    return Err(ModuleError::BadImage("unexpected relocation record size"));
                }
            }
            DT_PLTREL => {
                if entry.d_val as i64 != DT_RELA {
                    return Err(ModuleError::BadImage("PLT relocations must be RELA"));
                }
            }

            DT_NEEDED => module.dt_needed.push(entry.d_val),

            DT_INIT => module.dt_init = entry.d_val,
            DT_INIT_ARRAY => module.dt_init_array = entry.d_val,
            DT_INIT_ARRAYSZ => module.dt_init_arraysz = entry.d_val,
            DT_FINI => module.dt_fini = entry.d_val,
            DT_FINI_ARRAY => module.dt_fini_array = entry.d_val,
            DT_FINI_ARRAYSZ => module.dt_fini_arraysz = entry.d_val,

            DT_BIND_NOW => module.dt_bind_now = true,
            DT_FLAGS_1 => module.dt_flags_1 = entry.d_val,

            DT_REL | DT_RELSZ | DT_RELENT => {
                return Err(ModuleError::BadImage("REL relocations are not supported"));
            }

            // Tolerated without action.
            DT_STRSZ | DT_SONAME | DT_RPATH | DT_SYMBOLIC | DT_DEBUG | DT_TEXTREL
            | DT_RELACOUNT => {}

            _ => module.unknown_tags += 1,
        }
    }

    if module.dt_strtab == 0 || module.dt_symtab == 0 || module.dt_hash == 0 {
        return Err(ModuleError::BadImage("dynamic tables incomplete"));
    }

    Ok(())
}

/// Reads a NUL-terminated name out of the mapped image's string table.
fn read_image_string(module: &Module, offset: u64) -> Result<String, ModuleError> {
    let base = (module.dt_strtab as i64 + module.base_adj) as usize as *const u8;
    let mut bytes = Vec::new();
    // Bounded by the image span so a missing terminator cannot walk off.
    let limit = (module.max_vaddr - module.min_vaddr) as usize;
    for index in 0..limit.saturating_sub(offset as usize) {
        let byte = unsafe { base.add(offset as usize + index).read() };
        if byte == 0 {
            return String::from_utf8(bytes).map_err(|_| ModuleError::BadImage("bad name"));
        }
        bytes.push(byte);
    }
    Err(ModuleError::BadImage("unterminated string"))
}

/// Applies each PT_LOAD's R/W/X to its mapped pages.
fn apply_segment_permissions(module: &Module) {
    for phdr in module.phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
        let start = VirtAddr::from((phdr.p_vaddr as i64 + module.base_adj) as usize)
            .to_previous_page();
        let end = VirtAddr::from(
            (phdr.p_vaddr as i64 + module.base_adj) as usize + phdr.p_memsz as usize,
        )
        .to_next_page();

        let mut flags = EntryFlags::empty();
        if phdr.p_flags & PF_W != 0 {
            flags |= EntryFlags::WRITE;
        }
        if phdr.p_flags & PF_X != 0 {
            flags |= EntryFlags::EXEC;
        }

        paging::ops().protect(start, (end - start) / PAGE_SIZE, flags);
    }
}
