//! Module load/unload syscalls.

use vesper_abi::{
    Errno,
    errno::SysResult,
    module::{MODULE_NAME_MAX, MODULE_PARAMS_MAX},
};

use crate::{
    memory::user,
    modules::{self, ModuleError, params},
};

/// `init_module(image, size, name, params, ret_needed)`.
///
/// Loads a module from a user-space buffer and runs it. When a dependency
/// is missing the load fails with `ENOENT` and the dependency's name is
/// copied into `ret_needed` (NUL terminated, `MODULE_NAME_MAX` capacity)
/// so the caller can load it and retry.
pub fn sys_init_module(
    image: *const u8,
    image_size: usize,
    name: *const u8,
    // Reserved userspace module handle; not consumed by the loader.
    _mod_user: *mut u8,
    raw_params: *const u8,
    ret_needed: *mut u8,
) -> SysResult<usize> {
    if image_size == 0 {
        return Err(Errno::Inval);
    }

    let name = user::copy_str_from_user(name, MODULE_NAME_MAX)?;
    let image = user::copy_bytes_from_user(image, image_size)?;

    let parameters = if raw_params.is_null() {
        alloc::vec::Vec::new()
    } else {
        let raw = user::copy_str_from_user(raw_params, MODULE_PARAMS_MAX)?;
        params::parse_params(&raw)
    };

    let module = match modules::load_module(&image, &name, parameters) {
        Ok(module) => module,
        Err(ModuleError::MissingDependency(needed)) => {
            if !ret_needed.is_null() {
                let mut bytes = alloc::vec::Vec::from(needed.as_bytes());
                bytes.truncate(MODULE_NAME_MAX - 1);
                bytes.push(0);
                user::copy_bytes_to_user(ret_needed, &bytes)?;
            }
            return Err(Errno::NoEnt);
        }
        Err(err) => return Err(err.into()),
    };

    let exit = module.run();
    Ok(exit as u32 as usize)
}

/// `delete_module(name)`: destructors run, the image goes away with the
/// last reference.
pub fn sys_delete_module(name: *const u8) -> SysResult<usize> {
    let name = user::copy_str_from_user(name, MODULE_NAME_MAX)?;
    modules::delete_module(&name)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn rejects_bad_pointers() {
        test_support::init();

        assert_eq!(
            sys_init_module(
                core::ptr::null(),
                16,
                core::ptr::null(),
                core::ptr::null_mut(),
                core::ptr::null(),
                core::ptr::null_mut()
            ),
            Err(Errno::Fault)
        );
        assert_eq!(
            sys_init_module(
                b"x".as_ptr(),
                0,
                b"m\0".as_ptr(),
                core::ptr::null_mut(),
                core::ptr::null(),
                core::ptr::null_mut()
            ),
            Err(Errno::Inval)
        );
        assert_eq!(sys_delete_module(core::ptr::null()), Err(Errno::Fault));
    }

    #[test]
    fn garbage_image_is_enoexec() {
        test_support::init();

        let junk = [0u8; 256];
        let err = sys_init_module(
            junk.as_ptr(),
            junk.len(),
            b"junk\0".as_ptr(),
            core::ptr::null_mut(),
            core::ptr::null(),
            core::ptr::null_mut(),
        )
        .unwrap_err();
        assert_eq!(err, Errno::NoExec);
    }
}
