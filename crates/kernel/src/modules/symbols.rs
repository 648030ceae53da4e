//! Symbol tables and lookup.
//!
//! The kernel exports its API to modules through a table laid out exactly
//! like an ELF symbol table (symtab + strtab + SysV hash), so a module
//! produced by a standard linker resolves against it with no translation.
//! Each loaded module carries the same trio inside its image; lookups walk
//! the kernel table first, then every other loaded module.

use alloc::{string::String, vec::Vec};

use crate::utils::locks::RwLock;

use super::elf::{Elf64Sym, SHN_UNDEF, elf64_hash};

/// The kernel's export table. Rebuilt when an export is registered, which
/// only happens during driver init.
pub struct ExportTable {
    symtab: Vec<Elf64Sym>,
    strtab: Vec<u8>,
    buckets: Vec<u32>,
    chains: Vec<u32>,
}

impl ExportTable {
    pub const fn empty() -> Self {
        Self {
            symtab: Vec::new(),
            strtab: Vec::new(),
            buckets: Vec::new(),
            chains: Vec::new(),
        }
    }

    /// Rebuilds the hash for the current symbol set. Symbol 0 is the ELF
    /// null symbol and never enters a chain.
    fn rehash(&mut self) {
        let nsyms = self.symtab.len();
        let nbucket = nsyms.max(1);

        self.buckets = alloc::vec![0; nbucket];
        self.chains = alloc::vec![0; nsyms];

        for index in (1..nsyms).rev() {
            let hash = elf64_hash(self.symbol_name(&self.symtab[index]));
            let bucket = (hash as usize) % nbucket;
            self.chains[index] = self.buckets[bucket];
            self.buckets[bucket] = index as u32;
        }
    }

    fn symbol_name<'a>(&'a self, sym: &Elf64Sym) -> &'a [u8] {
        let start = sym.st_name as usize;
        let end = self.strtab[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.strtab.len(), |nul| start + nul);
        &self.strtab[start..end]
    }

    pub fn insert(&mut self, name: &str, address: usize, size: usize) {
        if self.symtab.is_empty() {
            // The mandatory null symbol, plus a NUL so offset 0 names it.
            self.symtab.push(unsafe { core::mem::zeroed() });
            self.strtab.push(0);
        }

        let st_name = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name.as_bytes());
        self.strtab.push(0);

        self.symtab.push(Elf64Sym {
            st_name,
            st_info: 0x12, // GLOBAL | FUNC
            st_other: 0,
            st_shndx: 1, // defined: anything but SHN_UNDEF
            st_value: address as u64,
            st_size: size as u64,
        });

        self.rehash();
    }

    /// Bucket-chain lookup; `SHN_UNDEF` entries are skipped.
    pub fn lookup(&self, name: &str) -> Option<&Elf64Sym> {
        if self.buckets.is_empty() {
            return None;
        }

        let bucket = (elf64_hash(name.as_bytes()) as usize) % self.buckets.len();
        let mut index = self.buckets[bucket];
        while index != 0 {
            let sym = &self.symtab[index as usize];
            if sym.st_shndx != SHN_UNDEF && self.symbol_name(sym) == name.as_bytes() {
                return Some(sym);
            }
            index = self.chains[index as usize];
        }
        None
    }

    pub fn lookup_address(&self, name: &str) -> Option<u64> {
        self.lookup(name).map(|sym| sym.st_value)
    }
}

static EXPORTS: RwLock<ExportTable> = RwLock::new(ExportTable::empty());

/// Registers a kernel export. Symbol addresses are absolute: the kernel is
/// already relocated by the time drivers register anything.
pub fn export(name: &str, address: usize, size: usize) {
    EXPORTS.write().insert(name, address, size);
}

pub fn kernel_lookup(name: &str) -> Option<u64> {
    EXPORTS.read().lookup_address(name)
}

/// A module's own hash/symbol/string tables, living inside its mapped
/// image. All raw reads; the image outlives the module record that owns
/// this view.
#[derive(Debug, Clone, Copy)]
pub struct ImageSymbols {
    pub nbucket: u32,
    pub nchain: u32,
    pub buckets: *const u32,
    pub chains: *const u32,
    pub symtab: *const Elf64Sym,
    pub strtab: *const u8,
    /// Applied to symbol values on lookup; zero once the image is fixed in
    /// place.
    pub base_adj: i64,
}

unsafe impl Send for ImageSymbols {}
unsafe impl Sync for ImageSymbols {}

impl ImageSymbols {
    /// Builds the view from in-image virtual addresses.
    ///
    /// # Safety
    /// The addresses must point into a fully loaded image.
    pub unsafe fn from_image(hash: usize, symtab: usize, strtab: usize, base_adj: i64) -> Self {
        let hash = hash as *const u32;
        unsafe {
            let nbucket = hash.read();
            let nchain = hash.add(1).read();
            Self {
                nbucket,
                nchain,
                buckets: hash.add(2),
                chains: hash.add(2 + nbucket as usize),
                symtab: symtab as *const Elf64Sym,
                strtab: strtab as *const u8,
                base_adj,
            }
        }
    }

    unsafe fn name_at(&self, offset: u32) -> &[u8] {
        unsafe {
            let start = self.strtab.add(offset as usize);
            let mut len = 0;
            while start.add(len).read() != 0 {
                len += 1;
            }
            core::slice::from_raw_parts(start, len)
        }
    }

    /// Symbol value (adjusted) for `name`, or `None`. Chain walk bounded by
    /// `nchain` against corrupt images.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        if self.nbucket == 0 {
            return None;
        }

        unsafe {
            let bucket = (elf64_hash(name.as_bytes()) % self.nbucket) as usize;
            let mut index = self.buckets.add(bucket).read();
            let mut steps = 0;

            while index != 0 && steps <= self.nchain {
                let sym = self.symtab.add(index as usize).read();
                if sym.st_shndx != SHN_UNDEF && self.name_at(sym.st_name) == name.as_bytes() {
                    return Some((sym.st_value as i64 + self.base_adj) as u64);
                }
                index = self.chains.add(index as usize).read();
                steps += 1;
            }
        }
        None
    }

    /// The symbol record by table index, for relocation processing.
    pub fn symbol(&self, index: u32) -> Elf64Sym {
        unsafe { self.symtab.add(index as usize).read() }
    }

    pub fn symbol_name(&self, sym: &Elf64Sym) -> String {
        let bytes = unsafe { self.name_at(sym.st_name) };
        String::from_utf8_lossy(bytes).into_owned()
    }
}
