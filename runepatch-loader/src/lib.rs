//! Loader library made resident in the target process by the injector.
//!
//! Exports [`runepatch_load_module`]: open the requested patch module,
//! locate its entry point and run it. Errors are reported as status codes
//! across the ABI, never unwound. Writes diagnostics straight to the
//! target's stderr; there is no logging infrastructure in a foreign
//! process.

use std::{
    ffi::{c_char, CStr},
    fs, mem,
    path::Path,
};

use libloading::Library;
use runepatch_abi::LoadStatus;

type EntryFn = unsafe extern "C" fn();

/// Loader export: four native-string pointers in, status out.
///
/// Argument order is fixed by the contract: runtime config path, module
/// path, type name, method name. The method name selects the entry point
/// symbol; native symbol namespaces are flat, so the type name is recorded
/// only for diagnostics.
///
/// # Safety
///
/// Each pointer must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn runepatch_load_module(
    runtime_config_path: *const c_char,
    module_path: *const c_char,
    type_name: *const c_char,
    method_name: *const c_char,
) -> u32 {
    let args = match (
        decode(runtime_config_path),
        decode(module_path),
        decode(type_name),
        decode(method_name),
    ) {
        (Some(config), Some(module), Some(ty), Some(method)) => (config, module, ty, method),
        _ => {
            eprintln!("runepatch-loader: rejected null or non-UTF-8 argument");
            return LoadStatus::BadArgument as u32;
        }
    };
    let (config, module, ty, method) = args;

    match load(config, module, ty, method) {
        Ok(()) => LoadStatus::Success as u32,
        Err(status) => {
            eprintln!("runepatch-loader: load failed with status {:?}", status);
            status as u32
        }
    }
}

unsafe fn decode<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn load(config: &str, module: &str, ty: &str, method: &str) -> Result<(), LoadStatus> {
    eprintln!(
        "runepatch-loader: config={} module={} type={} method={}",
        config, module, ty, method
    );

    // The runtime config stands in for host configuration; it only has to
    // be present and readable here.
    if fs::metadata(Path::new(config)).is_err() {
        return Err(LoadStatus::RuntimeConfigError);
    }

    let lib = unsafe { Library::new(module) }.map_err(|e| {
        eprintln!("runepatch-loader: dlopen failed: {}", e);
        LoadStatus::ModuleLoadError
    })?;

    let entry = unsafe { lib.get::<EntryFn>(method.as_bytes()) }
        .map_err(|_| LoadStatus::EntryPointNotFound)?;
    unsafe { entry() };

    // The patch module must stay resident; its hooks are wired into the
    // host's code. Dropping the handle would dlclose it.
    mem::forget(lib);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{env, fs::File, io::Write, ptr};

    use super::*;

    fn cstr(s: &str) -> std::ffi::CString {
        std::ffi::CString::new(s).unwrap()
    }

    fn temp_config() -> std::path::PathBuf {
        let path = env::temp_dir().join(format!("runepatch-loader-test-{}", std::process::id()));
        File::create(&path).unwrap().write_all(b"{}").unwrap();
        path
    }

    #[test]
    fn null_argument_is_bad_argument() {
        let config = cstr("/tmp/whatever");
        let status = unsafe {
            runepatch_load_module(config.as_ptr(), ptr::null(), ptr::null(), ptr::null())
        };
        assert_eq!(status, LoadStatus::BadArgument as u32);
    }

    #[test]
    fn missing_runtime_config_is_reported() {
        let config = cstr("/nonexistent/runepatch.conf");
        let module = cstr("/nonexistent/libmodule.so");
        let ty = cstr("t");
        let method = cstr("m");
        let status = unsafe {
            runepatch_load_module(config.as_ptr(), module.as_ptr(), ty.as_ptr(), method.as_ptr())
        };
        assert_eq!(status, LoadStatus::RuntimeConfigError as u32);
    }

    #[test]
    fn missing_module_is_a_load_error() {
        let config_path = temp_config();
        let config = cstr(config_path.to_str().unwrap());
        let module = cstr("/nonexistent/libmodule.so");
        let ty = cstr("t");
        let method = cstr("m");
        let status = unsafe {
            runepatch_load_module(config.as_ptr(), module.as_ptr(), ty.as_ptr(), method.as_ptr())
        };
        assert_eq!(status, LoadStatus::ModuleLoadError as u32);
    }
}
