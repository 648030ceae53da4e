//! The ELF64 loadable-module loader.
//!
//! Modules are relocatable shared objects loaded into kernel space,
//! resolved against the kernel's export table and every other loaded
//! module, then constructed and entered. The global list is behind a
//! reader-writer lock: symbol lookups share it, loads take it exclusively,
//! so relocation of one module never races another's lookup.

pub mod elf;
mod image;
pub mod params;
pub mod plt;
pub mod reloc;
pub mod symbols;

#[cfg(test)]
mod tests;

use alloc::{string::String, sync::Arc, vec::Vec};
use thiserror::Error;
use vesper_abi::{Errno, module::ModuleEntryFn};

use crate::{
    VirtAddr, debug,
    memory::{
        frame_allocator::{self, Frame},
        paging,
    },
    utils::{locks::RwLock, types::Name},
};

use symbols::ImageSymbols;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("malformed image: {0}")]
    BadImage(&'static str),
    #[error("unsupported relocation type {0}")]
    BadRelocation(u32),
    #[error("{0} relocation truncated to fit")]
    Truncated(&'static str),
    #[error("unresolved symbol {0}")]
    UnresolvedSymbol(Name),
    #[error("missing dependency {0}")]
    MissingDependency(Name),
    #[error("bad user pointer")]
    BadPointer,
    #[error("module name already loaded")]
    AlreadyLoaded,
    #[error("no such module")]
    NotFound,
}

impl From<ModuleError> for Errno {
    fn from(value: ModuleError) -> Self {
        match value {
            ModuleError::OutOfMemory => Errno::NoMem,
            ModuleError::MissingDependency(_) => Errno::NoEnt,
            ModuleError::BadPointer => Errno::Fault,
            ModuleError::AlreadyLoaded => Errno::Busy,
            ModuleError::NotFound => Errno::NoEnt,
            _ => Errno::NoExec,
        }
    }
}

/// A loaded module. The record owns its image mapping; the global list
/// owns the records.
pub struct Module {
    name: String,

    /// Base of the reserved span the image landed in.
    image_base: VirtAddr,
    /// Pages reserved at `image_base`.
    span_pages: usize,
    /// Pages actually committed, with their frames, for teardown.
    mapped: Vec<(VirtAddr, Frame)>,

    min_vaddr: u64,
    max_vaddr: u64,
    /// `image_base - min_vaddr`: added to every in-image virtual address.
    pub base_adj: i64,

    phdrs: Vec<elf::Elf64Phdr>,

    // Captured from `.dynamic`.
    pub dt_strtab: u64,
    pub dt_symtab: u64,
    pub dt_hash: u64,
    pub dt_pltgot: u64,
    pub dt_jmprel: u64,
    pub dt_pltrelsz: u64,
    pub dt_rela: u64,
    pub dt_relasz: u64,
    dt_needed: Vec<u64>,
    dt_init: u64,
    dt_init_array: u64,
    dt_init_arraysz: u64,
    dt_fini: u64,
    dt_fini_array: u64,
    dt_fini_arraysz: u64,
    dt_bind_now: bool,
    dt_flags_1: u64,
    /// Tolerated-but-unknown `.dynamic` tags seen.
    unknown_tags: usize,

    symbols: Option<ImageSymbols>,

    /// Adjusted entry point, zero when the object has none.
    entry: u64,
    /// Lowest executable segment address; where a debugger would map text.
    first_exec: u64,

    /// `argv[0]` is the module name, the rest the parsed parameters.
    argv_storage: Vec<Vec<u8>>,
}

// The raw table pointers in `symbols` point into the image mapping, which
// lives exactly as long as the record.
unsafe impl Send for Module {}
unsafe impl Sync for Module {}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_base(&self) -> VirtAddr {
        self.image_base
    }

    pub fn entry_address(&self) -> Option<u64> {
        (self.entry != 0).then_some(self.entry)
    }

    /// Lowest executable address of the image; where a debugger would load
    /// the module's text.
    pub fn text_address(&self) -> u64 {
        self.first_exec
    }

    pub fn symbols(&self) -> &ImageSymbols {
        self.symbols
            .as_ref()
            .expect("module symbols queried before dynamic parsing")
    }

    /// Runs the module's entry point with `argc`/`argv` built from the
    /// parameters, the module name first.
    pub fn run(&self) -> i32 {
        let Some(entry) = self.entry_address() else {
            return 0;
        };

        let argv: Vec<*const u8> = self
            .argv_storage
            .iter()
            .map(|arg| arg.as_ptr())
            .collect();

        let entry: ModuleEntryFn = unsafe { core::mem::transmute(entry as usize) };
        entry(argv.len() as i32, argv.as_ptr())
    }

    fn run_ctors(&self) {
        if self.dt_init != 0 {
            let ctor: extern "C" fn() =
                unsafe { core::mem::transmute((self.dt_init as i64 + self.base_adj) as usize) };
            ctor();
        }

        if self.dt_init_array != 0 {
            let array = (self.dt_init_array as i64 + self.base_adj) as usize as *const usize;
            for index in 0..(self.dt_init_arraysz as usize / size_of::<usize>()) {
                let ctor: extern "C" fn() =
                    unsafe { core::mem::transmute(array.add(index).read()) };
                ctor();
            }
        }
    }

    fn run_dtors(&self) {
        // Destructors run in reverse construction order.
        if self.dt_fini_array != 0 {
            let array = (self.dt_fini_array as i64 + self.base_adj) as usize as *const usize;
            for index in (0..(self.dt_fini_arraysz as usize / size_of::<usize>())).rev() {
                let dtor: extern "C" fn() =
                    unsafe { core::mem::transmute(array.add(index).read()) };
                dtor();
            }
        }

        if self.dt_fini != 0 {
            let dtor: extern "C" fn() =
                unsafe { core::mem::transmute((self.dt_fini as i64 + self.base_adj) as usize) };
            dtor();
        }
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        for (page, frame) in self.mapped.drain(..) {
            paging::ops().unmap_page(page);
            frame_allocator::deallocate_frame(frame);
        }
        if self.span_pages != 0 {
            paging::ops().release_span(self.image_base, self.span_pages);
        }
    }
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("image_base", &self.image_base)
            .field("base_adj", &format_args!("{:#x}", self.base_adj))
            .field("entry", &format_args!("{:#x}", self.entry))
            .finish()
    }
}

static MODULES: RwLock<Vec<Arc<Module>>> = RwLock::new(Vec::new());

/// Loads a module image, relocates it, runs its constructors and publishes
/// it on the module list. On any failure the image mapping is released and
/// nothing stays published.
///
/// A missing dependency comes back as
/// [`ModuleError::MissingDependency`] carrying the first missing name, so
/// the caller can load it and retry.
pub fn load_module(
    image: &[u8],
    name: &str,
    parameters: Vec<String>,
) -> Result<Arc<Module>, ModuleError> {
    let mut list = MODULES.write();

    if list.iter().any(|module| module.name() == name) {
        return Err(ModuleError::AlreadyLoaded);
    }

    let module = image::load_image(image, name, parameters, &list)?;
    let module = Arc::new(module);
    // GOT[1] carries the record's final address, so this happens after the
    // Arc pins it.
    plt::install_plt_handler(&module);
    list.push(module.clone());
    drop(list);

    // Constructors run outside the list lock: they may look symbols up or
    // even load further modules.
    module.run_ctors();

    debug!(
        Module,
        "module {} loaded at {:?} (adj {:#x}, text {:#x})",
        module.name(),
        module.image_base(),
        module.base_adj,
        module.text_address()
    );

    Ok(module)
}

/// Unloads by name: destructors, then the record (and with it the image)
/// goes away once the last reference drops.
pub fn delete_module(name: &str) -> Result<(), ModuleError> {
    let module = {
        let mut list = MODULES.write();
        let index = list
            .iter()
            .position(|module| module.name() == name)
            .ok_or(ModuleError::NotFound)?;
        list.swap_remove(index)
    };

    module.run_dtors();
    Ok(())
}

pub fn find_module(name: &str) -> Option<Arc<Module>> {
    MODULES
        .read()
        .iter()
        .find(|module| module.name() == name)
        .cloned()
}

pub fn loaded_count() -> usize {
    MODULES.read().len()
}

/// Symbol search over every loaded module except `exclude`; the runtime
/// half of the resolver (the load-time half runs under the write lock).
pub fn lookup_in_other_modules(name: &str, exclude: &Module) -> Option<u64> {
    MODULES
        .read()
        .iter()
        .filter(|module| !core::ptr::eq(module.as_ref(), exclude))
        .find_map(|module| module.symbols().lookup(name))
}
