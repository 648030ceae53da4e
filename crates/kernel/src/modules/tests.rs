//! Loader tests over synthetic ET_DYN images.
//!
//! The builder lays out a real single-segment shared object: program
//! headers, a dynamic table, SysV hash, symbol and string tables, RELA and
//! jump-slot relocations, a GOT and an init array. Constructor pointers are
//! relocated against kernel exports that point at host functions, so
//! running the init array executes real code.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use super::*;
use crate::modules::elf::*;
use crate::test_support;

/// Segment virtual base inside the object.
const V: u64 = 0x1000;
/// File offset of the segment.
const FILE_OFF: u64 = 0x100;

const DYN_OFF: u64 = 0x000;
const HASH_OFF: u64 = 0x200;
const SYMTAB_OFF: u64 = 0x280;
const STRTAB_OFF: u64 = 0x340;
const RELA_OFF: u64 = 0x380;
const JMPREL_OFF: u64 = 0x440;
const GOT_OFF: u64 = 0x460;
const INIT_ARRAY_OFF: u64 = 0x4C0;
const FINI_ARRAY_OFF: u64 = 0x4C8;
const DATA_OFF: u64 = 0x500;
const AFN_OFF: u64 = 0x700;

const FILESZ: u64 = 0x800;
const MEMSZ: u64 = 0x900;

/// The fake kernel export the image links against.
const KFN_ADDR: u64 = 0x5555_1234_5678;

// strtab layout: \0 kfn \0 afn \0 libfoo.so \0 test_ctor \0 test_dtor \0 small_export \0
const NAME_KFN: u32 = 1;
const NAME_AFN: u32 = 5;
const NAME_LIBFOO: u32 = 9;
const NAME_CTOR: u32 = 19;
const NAME_DTOR: u32 = 29;
const NAME_SMALL: u32 = 39;

const SYM_KFN: u32 = 1;
const SYM_AFN: u32 = 2;
const SYM_CTOR: u32 = 3;
const SYM_SMALL: u32 = 4;
const SYM_DTOR: u32 = 5;

static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn test_ctor() {
    CTOR_RUNS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn test_dtor() {
    DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
}

fn register_exports() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        symbols::export("kfn", KFN_ADDR as usize, 8);
        symbols::export("small_export", 0x4242, 4);
        symbols::export("test_ctor", test_ctor as usize, 8);
        symbols::export("test_dtor", test_dtor as usize, 8);
    });
}

struct ImageBuilder {
    bytes: alloc::vec::Vec<u8>,
    relas: alloc::vec::Vec<Elf64Rela>,
    needs_libfoo: bool,
    with_fini: bool,
    entry: u64,
}

impl ImageBuilder {
    fn new() -> Self {
        Self {
            bytes: alloc::vec![0u8; (FILE_OFF + FILESZ) as usize],
            relas: alloc::vec::Vec::new(),
            needs_libfoo: false,
            with_fini: false,
            entry: 0,
        }
    }

    fn file_off(vaddr: u64) -> usize {
        (FILE_OFF + (vaddr - V)) as usize
    }

    fn put(&mut self, vaddr: u64, bytes: &[u8]) {
        let off = Self::file_off(vaddr);
        self.bytes[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn put_u32(&mut self, vaddr: u64, value: u32) {
        self.put(vaddr, &value.to_le_bytes());
    }

    fn put_u64(&mut self, vaddr: u64, value: u64) {
        self.put(vaddr, &value.to_le_bytes());
    }

    fn rela(&mut self, offset: u64, sym: u32, reloc_type: u32, addend: i64) -> &mut Self {
        self.relas.push(Elf64Rela {
            r_offset: offset,
            r_info: Elf64Rela::info(sym, reloc_type),
            r_addend: addend,
        });
        self
    }

    fn standard_relocations(&mut self) -> &mut Self {
        self.rela(V + DATA_OFF, SYM_KFN, R_AMD64_64, 0)
            .rela(V + DATA_OFF + 8, 0, R_AMD64_RELATIVE, 0x123)
            .rela(V + DATA_OFF + 0x10, SYM_SMALL, R_AMD64_32, 0)
            .rela(V + DATA_OFF + 0x18, SYM_AFN, R_AMD64_PC32, -4)
            .rela(V + DATA_OFF + 0x20, SYM_AFN, R_AMD64_SIZE64, 0x10)
            .rela(V + INIT_ARRAY_OFF, SYM_CTOR, R_AMD64_64, 0)
    }

    fn build(&mut self) -> alloc::vec::Vec<u8> {
        // ELF header.
        let ehdr = Elf64Ehdr {
            e_ident: {
                let mut ident = [0u8; 16];
                ident[..4].copy_from_slice(&ELF_MAGIC);
                ident[4] = 2; // ELFCLASS64
                ident[5] = 1; // little endian
                ident[6] = 1;
                ident
            },
            e_type: ET_DYN,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: self.entry,
            e_phoff: 64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: 2,
            e_shentsize: 64,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let ehdr_bytes: [u8; 64] = unsafe { core::mem::transmute(ehdr) };
        self.bytes[..64].copy_from_slice(&ehdr_bytes);

        // Program headers: one PT_LOAD, one PT_DYNAMIC inside it.
        let load = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W | PF_X,
            p_offset: FILE_OFF,
            p_vaddr: V,
            p_paddr: V,
            p_filesz: FILESZ,
            p_memsz: MEMSZ,
            p_align: 0x1000,
        };
        let dynamic = Elf64Phdr {
            p_type: PT_DYNAMIC,
            p_flags: PF_R,
            p_offset: FILE_OFF + DYN_OFF,
            p_vaddr: V + DYN_OFF,
            p_paddr: V + DYN_OFF,
            p_filesz: 20 * 16,
            p_memsz: 20 * 16,
            p_align: 8,
        };
        for (index, phdr) in [load, dynamic].into_iter().enumerate() {
            let bytes: [u8; 56] = unsafe { core::mem::transmute(phdr) };
            self.bytes[64 + index * 56..64 + (index + 1) * 56].copy_from_slice(&bytes);
        }

        // Dynamic table.
        let mut dyn_entries: alloc::vec::Vec<(i64, u64)> = alloc::vec![
            (DT_STRTAB, V + STRTAB_OFF),
            (DT_SYMTAB, V + SYMTAB_OFF),
            (DT_HASH, V + HASH_OFF),
            (DT_SYMENT, 24),
            (DT_RELA, V + RELA_OFF),
            (DT_RELASZ, (self.relas.len() * 24) as u64),
            (DT_RELAENT, 24),
            (DT_PLTGOT, V + GOT_OFF),
            (DT_JMPREL, V + JMPREL_OFF),
            (DT_PLTRELSZ, 24),
            (DT_PLTREL, DT_RELA as u64),
            (DT_INIT_ARRAY, V + INIT_ARRAY_OFF),
            (DT_INIT_ARRAYSZ, 8),
            (DT_BIND_NOW, 1),
        ];
        if self.with_fini {
            dyn_entries.push((DT_FINI_ARRAY, V + FINI_ARRAY_OFF));
            dyn_entries.push((DT_FINI_ARRAYSZ, 8));
        }
        if self.needs_libfoo {
            dyn_entries.push((DT_NEEDED, NAME_LIBFOO as u64));
        }
        dyn_entries.push((DT_NULL, 0));

        for (index, (tag, value)) in dyn_entries.iter().enumerate() {
            let vaddr = V + DYN_OFF + (index as u64) * 16;
            self.put_u64(vaddr, *tag as u64);
            self.put_u64(vaddr + 8, *value);
        }

        // Hash: one bucket chaining every real symbol.
        self.put_u32(V + HASH_OFF, 1); // nbucket
        self.put_u32(V + HASH_OFF + 4, 6); // nchain
        self.put_u32(V + HASH_OFF + 8, SYM_DTOR); // bucket 0
        self.put_u32(V + HASH_OFF + 12 + 4 * SYM_KFN as u64, 0);
        self.put_u32(V + HASH_OFF + 12 + 4 * SYM_AFN as u64, SYM_KFN);
        self.put_u32(V + HASH_OFF + 12 + 4 * SYM_CTOR as u64, SYM_AFN);
        self.put_u32(V + HASH_OFF + 12 + 4 * SYM_SMALL as u64, SYM_CTOR);
        self.put_u32(V + HASH_OFF + 12 + 4 * SYM_DTOR as u64, SYM_SMALL);

        // Symbols.
        let syms = [
            Elf64Sym {
                // null symbol
                st_name: 0,
                st_info: 0,
                st_other: 0,
                st_shndx: 0,
                st_value: 0,
                st_size: 0,
            },
            Elf64Sym {
                // kfn: undefined, resolved against the kernel exports
                st_name: NAME_KFN,
                st_info: 0x12,
                st_other: 0,
                st_shndx: SHN_UNDEF,
                st_value: 0,
                st_size: 0,
            },
            Elf64Sym {
                // afn: defined here; visible to other modules
                st_name: NAME_AFN,
                st_info: 0x12,
                st_other: 0,
                st_shndx: 1,
                st_value: V + AFN_OFF,
                st_size: 0x42,
            },
            Elf64Sym {
                // test_ctor: undefined host hook
                st_name: NAME_CTOR,
                st_info: 0x12,
                st_other: 0,
                st_shndx: SHN_UNDEF,
                st_value: 0,
                st_size: 0,
            },
            Elf64Sym {
                // small_export: undefined, value fits narrow relocations
                st_name: NAME_SMALL,
                st_info: 0x12,
                st_other: 0,
                st_shndx: SHN_UNDEF,
                st_value: 0,
                st_size: 0,
            },
            Elf64Sym {
                // test_dtor: undefined host hook
                st_name: NAME_DTOR,
                st_info: 0x12,
                st_other: 0,
                st_shndx: SHN_UNDEF,
                st_value: 0,
                st_size: 0,
            },
        ];
        for (index, sym) in syms.into_iter().enumerate() {
            let bytes: [u8; 24] = unsafe { core::mem::transmute(sym) };
            self.put(V + SYMTAB_OFF + (index as u64) * 24, &bytes);
        }

        // Strings.
        self.put(
            V + STRTAB_OFF,
            b"\0kfn\0afn\0libfoo.so\0test_ctor\0test_dtor\0small_export\0",
        );

        // Relocations.
        let relas = core::mem::take(&mut self.relas);
        for (index, rela) in relas.iter().enumerate() {
            let bytes: [u8; 24] = unsafe { core::mem::transmute(*rela) };
            self.put(V + RELA_OFF + (index as u64) * 24, &bytes);
        }

        // One jump slot aimed at GOT[3], bound to kfn.
        let jmprel = Elf64Rela {
            r_offset: V + GOT_OFF + 24,
            r_info: Elf64Rela::info(SYM_KFN, R_AMD64_JUMP_SLOT),
            r_addend: 0,
        };
        let bytes: [u8; 24] = unsafe { core::mem::transmute(jmprel) };
        self.put(V + JMPREL_OFF, &bytes);

        // GOT[0] carries a link-time in-image address the loader rebases.
        self.put_u64(V + GOT_OFF, 0x1100);

        self.bytes.clone()
    }
}

/// Builds the default image with the standard relocation set.
fn standard_image() -> alloc::vec::Vec<u8> {
    let mut builder = ImageBuilder::new();
    builder.standard_relocations();
    builder.build()
}

/// The test mutex: module-list state is global, so loader tests serialize.
static LOADER_LOCK: StdMutex<()> = StdMutex::new(());

fn image_u64(module: &Module, vaddr: u64) -> u64 {
    unsafe { (((vaddr as i64 + module.base_adj) as usize) as *const u64).read() }
}

fn image_u32(module: &Module, vaddr: u64) -> u32 {
    unsafe { (((vaddr as i64 + module.base_adj) as usize) as *const u32).read() }
}

#[test]
fn loads_relocates_and_runs_ctors() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let ctors_before = CTOR_RUNS.load(Ordering::SeqCst);
    let image = standard_image();
    let module = load_module(&image, "testmod", alloc::vec!["alpha".into(), "beta".into()])
        .expect("load failed");

    // The init array ran exactly once, through the relocated pointer.
    assert_eq!(CTOR_RUNS.load(Ordering::SeqCst), ctors_before + 1);

    // Absolute symbol against the kernel export hash.
    assert_eq!(image_u64(&module, V + DATA_OFF), KFN_ADDR);

    // B + A.
    assert_eq!(
        image_u64(&module, V + DATA_OFF + 8),
        (module.base_adj + 0x123) as u64
    );

    // Narrow store of a small resolved value.
    assert_eq!(image_u32(&module, V + DATA_OFF + 0x10), 0x4242);

    // PC-relative within the image: S + A - P is position independent.
    assert_eq!(image_u32(&module, V + DATA_OFF + 0x18), 0x700 - 0x518 - 4);

    // Z + A.
    assert_eq!(image_u64(&module, V + DATA_OFF + 0x20), 0x42 + 0x10);

    // Jump slot bound eagerly.
    assert_eq!(image_u64(&module, V + GOT_OFF + 24), KFN_ADDR);

    // GOT header: rebased GOT[0], module handle in GOT[1].
    assert_eq!(
        image_u64(&module, V + GOT_OFF),
        (0x1100 + module.base_adj) as u64
    );
    assert_eq!(
        image_u64(&module, V + GOT_OFF + 8),
        module.as_ref() as *const Module as u64
    );

    // The zero-fill tail really is zero.
    assert_eq!(image_u64(&module, V + FILESZ), 0);
    assert_eq!(image_u64(&module, V + MEMSZ - 8), 0);

    assert!(find_module("testmod").is_some());
    delete_module("testmod").unwrap();
    assert!(find_module("testmod").is_none());
}

#[test]
fn missing_dependency_surfaces_its_name() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let count_before = loaded_count();

    let mut builder = ImageBuilder::new();
    builder.needs_libfoo = true;
    builder.standard_relocations();
    let image = builder.build();

    let err = load_module(&image, "depmod", alloc::vec![]).unwrap_err();
    assert_eq!(
        err,
        ModuleError::MissingDependency(crate::utils::types::truncated_name("libfoo.so"))
    );
    // The image mapping was released and nothing stayed published.
    assert_eq!(loaded_count(), count_before);

    // Load the dependency, then retry: same image now loads.
    let dep = standard_image();
    load_module(&dep, "libfoo.so", alloc::vec![]).unwrap();
    load_module(&image, "depmod", alloc::vec![]).unwrap();

    delete_module("depmod").unwrap();
    delete_module("libfoo.so").unwrap();
}

#[test]
fn cross_module_symbols_resolve() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    // Provider defines afn at V + AFN_OFF.
    let provider = load_module(&standard_image(), "provider", alloc::vec![]).unwrap();

    // Consumer resolves afn by name instead of locally: its own afn symbol
    // is undefined, so the reference lands in the provider's image.
    let mut builder = ImageBuilder::new();
    builder
        .rela(V + DATA_OFF, SYM_AFN, R_AMD64_64, 0)
        .rela(V + INIT_ARRAY_OFF, SYM_CTOR, R_AMD64_64, 0);
    let mut image = builder.build();
    // Patch the consumer's afn symbol to be undefined (shndx, value).
    let sym_off = ImageBuilder::file_off(V + SYMTAB_OFF + (SYM_AFN as u64) * 24);
    image[sym_off + 6..sym_off + 8].copy_from_slice(&0u16.to_le_bytes());
    image[sym_off + 8..sym_off + 16].copy_from_slice(&0u64.to_le_bytes());

    let consumer = load_module(&image, "consumer", alloc::vec![]).unwrap();

    let expected_afn = (V as i64 + AFN_OFF as i64 + provider.base_adj) as u64;
    assert_eq!(image_u64(&consumer, V + DATA_OFF), expected_afn);
    // And the provider's own lookup agrees.
    assert_eq!(provider.symbols().lookup("afn"), Some(expected_afn));

    delete_module("consumer").unwrap();
    delete_module("provider").unwrap();
}

#[test]
fn truncated_relocation_aborts_the_load() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let count_before = loaded_count();

    let mut builder = ImageBuilder::new();
    // 0x4242 does not fit in eight bits.
    builder.rela(V + DATA_OFF, SYM_SMALL, R_AMD64_8, 0);
    builder.rela(V + INIT_ARRAY_OFF, SYM_CTOR, R_AMD64_64, 0);
    let image = builder.build();

    let ctors_before = CTOR_RUNS.load(Ordering::SeqCst);
    let err = load_module(&image, "truncmod", alloc::vec![]).unwrap_err();
    assert!(matches!(err, ModuleError::Truncated(_)), "{err:?}");
    assert_eq!(loaded_count(), count_before);
    // The failed load never reached its constructors.
    assert_eq!(CTOR_RUNS.load(Ordering::SeqCst), ctors_before);
}

#[test]
fn unknown_relocation_type_is_rejected() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let mut builder = ImageBuilder::new();
    builder.rela(V + DATA_OFF, 0, 99, 0);
    builder.rela(V + INIT_ARRAY_OFF, SYM_CTOR, R_AMD64_64, 0);
    let image = builder.build();

    let err = load_module(&image, "badreloc", alloc::vec![]).unwrap_err();
    assert_eq!(err, ModuleError::BadRelocation(99));
}

#[test]
fn unresolved_symbol_is_fatal() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let mut builder = ImageBuilder::new();
    // test_dtor is exported, but "afn" is not defined anywhere once no
    // provider is loaded and the local definition is erased.
    builder.rela(V + DATA_OFF, SYM_AFN, R_AMD64_64, 0);
    builder.rela(V + INIT_ARRAY_OFF, SYM_CTOR, R_AMD64_64, 0);
    let mut image = builder.build();
    let sym_off = ImageBuilder::file_off(V + SYMTAB_OFF + (SYM_AFN as u64) * 24);
    image[sym_off + 6..sym_off + 8].copy_from_slice(&0u16.to_le_bytes());

    let err = load_module(&image, "unresolved", alloc::vec![]).unwrap_err();
    assert_eq!(
        err,
        ModuleError::UnresolvedSymbol(crate::utils::types::truncated_name("afn"))
    );
}

#[test]
fn delete_module_runs_destructors_in_reverse() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let mut builder = ImageBuilder::new();
    builder.with_fini = true;
    builder.standard_relocations();
    builder.rela(V + FINI_ARRAY_OFF, SYM_DTOR, R_AMD64_64, 0);
    let image = builder.build();

    let dtors_before = DTOR_RUNS.load(Ordering::SeqCst);
    load_module(&image, "finimod", alloc::vec![]).unwrap();
    assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), dtors_before);

    delete_module("finimod").unwrap();
    assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), dtors_before + 1);
    assert_eq!(delete_module("finimod"), Err(ModuleError::NotFound));
}

#[test]
fn entry_point_is_rebased() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    let mut builder = ImageBuilder::new();
    builder.entry = V + AFN_OFF;
    builder.standard_relocations();
    let image = builder.build();

    let module = load_module(&image, "entrymod", alloc::vec![]).unwrap();
    assert_eq!(
        module.entry_address(),
        Some((V as i64 + AFN_OFF as i64 + module.base_adj) as u64)
    );
    delete_module("entrymod").unwrap();
}

#[test]
fn header_validation_rejects_garbage() {
    test_support::init();
    register_exports();
    let _guard = LOADER_LOCK.lock().unwrap();

    // Bad magic.
    let mut image = standard_image();
    image[0] = 0;
    assert!(matches!(
        load_module(&image, "garbage", alloc::vec![]),
        Err(ModuleError::BadImage(_))
    ));

    // Bad program-header record size.
    let mut image = standard_image();
    image[54] = 57; // e_phentsize low byte
    assert!(matches!(
        load_module(&image, "garbage2", alloc::vec![]),
        Err(ModuleError::BadImage(_))
    ));

    // Truncated file.
    let image = standard_image();
    assert!(matches!(
        load_module(&image[..80], "garbage3", alloc::vec![]),
        Err(ModuleError::BadImage(_))
    ));
}
