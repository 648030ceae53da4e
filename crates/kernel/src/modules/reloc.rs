//! Relocation application.
//!
//! Both tables (`.rela.dyn` and `.rela.plt`) carry Elf64_Rela entries and
//! are walked the same way. In the symbol algebra: `S` is the resolved
//! symbol value, `A` the addend, `B` the load adjustment, `P` the address
//! of the operand, `G` the rebased GOT, `Z` the symbol's size. Narrow
//! relocations that do not survive their width intact abort the load:
//! silent truncation would turn into a wild branch at run time.
//!
//! Jump slots are bound eagerly. The lazy path (add the base adjustment so
//! the slot aims at its PLT thunk) is deliberately not taken; the
//! trampoline in `plt.rs` stays installed so flipping this is local.

use crate::utils::types::truncated_name;

use super::{
    ModuleError,
    elf::{self, Elf64Rela},
    symbols::ImageSymbols,
};

/// Eager binding is the standing policy; `DT_BIND_NOW` alone would decide
/// if this were false. See the module-level note.
const ALWAYS_BIND_NOW: bool = true;

/// How a relocation's computed value lands in memory.
enum Width {
    U64,
    I32,
    U32,
    I16,
    U16,
    I8,
    U8,
}

impl Width {
    /// Stores `value` at `operand`, rejecting values that do not fit.
    /// Operands may be unaligned; the linker places them wherever the
    /// section layout fell.
    unsafe fn store(&self, operand: *mut u8, value: u64, name: &'static str) -> Result<(), ModuleError> {
        let fits = match self {
            Width::U64 => true,
            Width::I32 => value as i64 == (value as i32) as i64,
            Width::U32 => value == (value as u32) as u64,
            Width::I16 => value as i64 == (value as i16) as i64,
            Width::U16 => value == (value as u16) as u64,
            Width::I8 => value as i64 == (value as i8) as i64,
            Width::U8 => value == (value as u8) as u64,
        };
        if !fits {
            return Err(ModuleError::Truncated(name));
        }

        unsafe {
            match self {
                Width::U64 => (operand as *mut u64).write_unaligned(value),
                Width::I32 | Width::U32 => (operand as *mut u32).write_unaligned(value as u32),
                Width::I16 | Width::U16 => (operand as *mut u16).write_unaligned(value as u16),
                Width::I8 | Width::U8 => operand.write(value as u8),
            }
        }
        Ok(())
    }
}

/// The inputs relocation processing needs from a partially loaded module.
pub struct RelocContext<'a> {
    pub base_adj: i64,
    pub dt_rela: u64,
    pub dt_relasz: u64,
    pub dt_jmprel: u64,
    pub dt_pltrelsz: u64,
    pub dt_pltgot: u64,
    pub bind_now: bool,
    pub symbols: ImageSymbols,
    /// Resolves a named symbol against the kernel exports and every other
    /// loaded module.
    pub resolve: &'a dyn Fn(&str) -> Option<u64>,
}

pub fn apply_relocations(ctx: &RelocContext) -> Result<(), ModuleError> {
    let tables = [(ctx.dt_rela, ctx.dt_relasz), (ctx.dt_jmprel, ctx.dt_pltrelsz)];

    for (table, size) in tables {
        if table == 0 || size == 0 {
            continue;
        }

        let rela_ptr = (table as i64 + ctx.base_adj) as usize as *const Elf64Rela;
        let count = size as usize / size_of::<Elf64Rela>();

        for index in 0..count {
            let rela = unsafe { rela_ptr.add(index).read() };
            apply_one(ctx, &rela)?;
        }
    }

    Ok(())
}

fn apply_one(ctx: &RelocContext, rela: &Elf64Rela) -> Result<(), ModuleError> {
    let reloc_type = rela.reloc_type();
    let type_name = elf::reloc_type_name(reloc_type);

    if reloc_type == elf::R_AMD64_NONE {
        return Ok(());
    }

    let operand = (rela.r_offset as i64 + ctx.base_adj) as usize as *mut u8;

    // nchain equals the symbol-table length, so this bounds the raw read.
    if rela.symbol() >= ctx.symbols.nchain.max(1) {
        return Err(ModuleError::BadImage("relocation symbol out of range"));
    }
    let sym = ctx.symbols.symbol(rela.symbol());

    let a = rela.r_addend;
    let b = ctx.base_adj;
    let p = operand as i64;
    let g = ctx.dt_pltgot as i64 + ctx.base_adj;
    let z = sym.st_size as i64;

    // Named symbols resolve through the export hash and the other loaded
    // modules; unnamed ones are module-local.
    let s = if sym.st_name != 0 {
        let name = ctx.symbols.symbol_name(&sym);
        match (ctx.resolve)(&name) {
            Some(addr) => addr as i64,
            None => return Err(ModuleError::UnresolvedSymbol(truncated_name(&name))),
        }
    } else {
        sym.st_value as i64 + ctx.base_adj
    };

    let (value, width) = match reloc_type {
        elf::R_AMD64_JUMP_SLOT => {
            if ALWAYS_BIND_NOW || ctx.bind_now {
                (s, Width::U64)
            } else {
                // Lazy mode: rebase the slot so it aims at its PLT thunk;
                // the trampoline patches in the real target on first call.
                let thunk = unsafe { (operand as *const u64).read_unaligned() } as i64;
                (thunk.wrapping_add(b), Width::U64)
            }
        }

        elf::R_AMD64_64 => (s.wrapping_add(a), Width::U64),
        elf::R_AMD64_GLOB_DAT => (s, Width::U64),
        elf::R_AMD64_RELATIVE => (b.wrapping_add(a), Width::U64),
        elf::R_AMD64_GOTOFF64 => (s.wrapping_add(a).wrapping_sub(g), Width::U64),
        elf::R_AMD64_PC64 => (s.wrapping_add(a).wrapping_sub(p), Width::U64),
        elf::R_AMD64_SIZE64 => (z.wrapping_add(a), Width::U64),

        elf::R_AMD64_PC32 => (s.wrapping_add(a).wrapping_sub(p), Width::I32),
        elf::R_AMD64_GOT32 => (g.wrapping_add(a), Width::U32),
        elf::R_AMD64_GOTPC32 => (g.wrapping_add(a).wrapping_add(p), Width::I32),
        elf::R_AMD64_GOTPCREL => (g.wrapping_add(a).wrapping_sub(p), Width::I32),
        elf::R_AMD64_SIZE32 => (z.wrapping_add(a), Width::U32),
        elf::R_AMD64_32 => (s.wrapping_add(a), Width::U32),
        elf::R_AMD64_32S => (s.wrapping_add(a), Width::I32),

        elf::R_AMD64_16 => (s.wrapping_add(a), Width::U16),
        elf::R_AMD64_PC16 => (s.wrapping_add(a).wrapping_sub(p), Width::I16),

        elf::R_AMD64_8 => (s.wrapping_add(a), Width::U8),
        elf::R_AMD64_PC8 => (s.wrapping_add(a).wrapping_sub(p), Width::I8),

        _ => return Err(ModuleError::BadRelocation(reloc_type)),
    };

    unsafe { width.store(operand, value as u64, type_name) }
}
