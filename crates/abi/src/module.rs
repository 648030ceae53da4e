//! Loadable-module entry contract.

/// Signature of a module's entry point. `argv[0]` is the module name, the
/// remaining arguments come from the parameter string passed to
/// `init_module`.
pub type ModuleEntryFn = extern "C" fn(argc: i32, argv: *const *const u8) -> i32;

/// Longest accepted module name, including the terminator, matching the
/// buffer `init_module` writes a missing dependency name into.
pub const MODULE_NAME_MAX: usize = 256;

/// Cap on the raw parameter string accepted by `init_module`.
pub const MODULE_PARAMS_MAX: usize = 64 << 10;
