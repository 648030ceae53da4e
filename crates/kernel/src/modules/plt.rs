//! Lazy PLT binding machinery.
//!
//! The first call through an unbound PLT slot lands in the trampoline with
//! the module handle and relocation index the loader parked in the GOT
//! header. The trampoline saves the SysV caller-saved registers plus
//! RFLAGS, calls the resolver with a pointer to that frame, patches the GOT
//! slot with one atomic 8-byte store and jumps to the freshly resolved
//! target. No instruction is rewritten: callers always load through the
//! GOT.
//!
//! The current loader binds everything eagerly (see `reloc.rs`), so this
//! path is armed but never taken; it stays so lazy binding is one branch
//! away, not a protocol change.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{Module, elf::{Elf64Rela, R_AMD64_JUMP_SLOT}, symbols};

/// The register frame the trampoline pushes; field order matches the
/// trampoline's stack layout exactly.
#[derive(Debug)]
#[repr(C)]
pub struct PltStubData {
    pub rax: usize,
    pub rdi: usize,
    pub rsi: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub rflags: usize,
    /// Written by the resolver: where the call continues.
    pub result: usize,
    /// GOT[1]: the owning module.
    pub module: *const Module,
    /// Pushed by the PLT stub: index into the jump-slot relocations.
    pub plt_index: usize,
}

/// Resolves one jump slot. Called from the trampoline with the saved
/// frame; panics on an unresolvable name: by the time lazy binding runs,
/// load-time checking has already proven the symbol exists somewhere.
pub extern "C" fn module_dynamic_linker(data: &mut PltStubData) {
    let module = unsafe { &*data.module };

    let jmprel = (module.dt_jmprel as i64 + module.base_adj) as usize as *const Elf64Rela;
    let rela = unsafe { jmprel.add(data.plt_index).read() };
    assert_eq!(rela.reloc_type(), R_AMD64_JUMP_SLOT);

    let sym = module.symbols().symbol(rela.symbol());
    let name = module.symbols().symbol_name(&sym);

    let target = symbols::kernel_lookup(&name)
        .or_else(|| super::lookup_in_other_modules(&name, module))
        .unwrap_or_else(|| panic!("lazy bind of unresolvable symbol {name}"));

    // Patch the GOT slot named by the relocation: a single atomic store,
    // so racing callers either take the trampoline again or jump straight
    // to the target.
    let slot_addr = (rela.r_offset as i64 + module.base_adj) as usize;
    let slot = unsafe { AtomicU64::from_ptr(slot_addr as *mut u64) };
    slot.store(target, Ordering::Release);

    data.result = target as usize;
}

/// The PLT default stub target. Saves caller-saved state, builds a
/// [`PltStubData`] on the stack, calls the resolver and continues into the
/// resolved function with every register restored.
///
/// On entry the PLT stub has pushed the relocation index, and GOT[1]
/// (pushed by the stub as well, per the standard PLT0 sequence) sits above
/// it.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn module_plt_trampoline() {
    core::arch::naked_asm!(
        // Stack on entry: [rsp] = module handle (GOT[1]), [rsp+8] = index.
        "push 0",    // result placeholder
        "pushfq",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rax",
        "mov rdi, rsp", // &PltStubData
        // The frame starts at rax; module/index pushed by the stub line up
        // behind rflags/result because the stub pushed them first.
        "call {resolver}",
        "pop rax",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "popfq",
        // result
        "pop r11",
        // drop module handle and index
        "add rsp, 16",
        "jmp r11",
        resolver = sym resolver_thunk,
    )
}

#[cfg(target_arch = "x86_64")]
extern "C" fn resolver_thunk(data: &mut PltStubData) {
    module_dynamic_linker(data);
}

/// Installs the three GOT header entries: the link-time GOT[0] is
/// rebased, GOT[1] carries the module handle and GOT[2] the trampoline.
pub fn install_plt_handler(module: &Module) {
    if module.dt_pltgot == 0 {
        return;
    }

    let got = (module.dt_pltgot as i64 + module.base_adj) as usize as *mut u64;
    unsafe {
        let got0 = got.read();
        if got0 != 0 {
            got.write((got0 as i64 + module.base_adj) as u64);
        }
        got.add(1).write(module as *const Module as u64);
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                got.add(2).write(module_plt_trampoline as usize as u64);
            } else {
                got.add(2).write(0);
            }
        }
    }
}
