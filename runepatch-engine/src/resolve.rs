//! Name-based resolution of patch targets inside the current process.
//!
//! A target type names a loaded module image (the main executable or a
//! shared object); a target method names a function symbol within it.
//! Matching is by exact name, first loaded module wins - callers supply
//! unambiguous names.

use std::{collections::HashSet, fs, mem, path::PathBuf};

use goblin::elf::Elf;
use libloading::os::unix::{Library, RTLD_NOW};
use nix::libc::{getauxval, AT_ENTRY, RTLD_NOLOAD};
use nix::unistd::getpid;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no loaded module matches type {0}")]
    TypeNotFound(String),
    #[error("method {method} not found in {type_name}")]
    MethodNotFound { type_name: String, method: String },
    #[error("cannot inspect module image: {0}")]
    Image(String),
}

/// Maps a (type, method) pair to a function address in this process.
pub trait SymbolResolver {
    fn resolve(&self, type_name: &str, method_name: &str) -> Result<usize, ResolveError>;
}

/// Resolver over the process's currently loaded modules. Shared objects are
/// queried through the dynamic linker; the main executable is searched via
/// its symbol tables, since its internal functions are not dynamic symbols.
pub struct ProcessResolver;

/// Does a module image file name answer to `type_name`? Accepts the exact
/// name, a `name-suffix` form (cargo test binaries), and the conventional
/// `lib<name>.so*` shape.
fn module_matches(file_name: &str, type_name: &str) -> bool {
    if file_name == type_name || file_name.starts_with(&format!("{}-", type_name)) {
        return true;
    }
    let stem = file_name.strip_prefix("lib").unwrap_or(file_name);
    stem == type_name || stem.split('.').next() == Some(type_name)
}

fn find_module(type_name: &str) -> Result<Option<PathBuf>, ResolveError> {
    let maps = proc_maps::get_process_maps(getpid().as_raw())
        .map_err(|e| ResolveError::Image(format!("cannot read own memory map: {}", e)))?;
    let mut seen = HashSet::new();
    for map in maps {
        let path = match map.filename() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };
        if !seen.insert(path.clone()) {
            continue;
        }
        let base = match path.file_name().and_then(|f| f.to_str()) {
            Some(base) => base,
            None => continue,
        };
        if module_matches(base, type_name) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Load bias of the main executable.
///
/// AT_PHDR is unreliable here (kernel bug 197921), AT_ENTRY is not.
fn exe_load_bias(elf: &Elf) -> Result<u64, ResolveError> {
    let entry_vma = match unsafe { getauxval(AT_ENTRY) } {
        0 => return Err(ResolveError::Image("getauxval(AT_ENTRY) returned 0".into())),
        x => x,
    };
    Ok(entry_vma - elf.header.e_entry)
}

fn resolve_in_exe(type_name: &str, method_name: &str) -> Result<usize, ResolveError> {
    let data = fs::read("/proc/self/exe")
        .map_err(|e| ResolveError::Image(format!("cannot read own image: {}", e)))?;
    let elf =
        Elf::parse(&data).map_err(|e| ResolveError::Image(format!("cannot parse own image: {}", e)))?;

    let sym = elf
        .syms
        .iter()
        .find(|s| elf.strtab.get_at(s.st_name) == Some(method_name))
        .or_else(|| {
            elf.dynsyms
                .iter()
                .find(|s| elf.dynstrtab.get_at(s.st_name) == Some(method_name))
        })
        .ok_or_else(|| ResolveError::MethodNotFound {
            type_name: type_name.to_string(),
            method: method_name.to_string(),
        })?;

    let bias = exe_load_bias(&elf)?;
    Ok((bias + sym.st_value) as usize)
}

fn resolve_in_dso(
    path: &PathBuf,
    type_name: &str,
    method_name: &str,
) -> Result<usize, ResolveError> {
    // The module is already resident; RTLD_NOLOAD only hands back a handle.
    let lib = unsafe { Library::open(Some(path), RTLD_NOW | RTLD_NOLOAD) }
        .map_err(|e| ResolveError::Image(format!("cannot reopen {:?}: {}", path, e)))?;
    let addr = match unsafe { lib.get::<*mut std::ffi::c_void>(method_name.as_bytes()) } {
        Ok(sym) => *sym as usize,
        Err(_) => {
            return Err(ResolveError::MethodNotFound {
                type_name: type_name.to_string(),
                method: method_name.to_string(),
            })
        }
    };
    // Keep the refcount we took; patch targets stay resident for the
    // process lifetime anyway.
    mem::forget(lib);
    Ok(addr)
}

impl SymbolResolver for ProcessResolver {
    fn resolve(&self, type_name: &str, method_name: &str) -> Result<usize, ResolveError> {
        let path =
            find_module(type_name)?.ok_or_else(|| ResolveError::TypeNotFound(type_name.into()))?;
        debug!("resolved type {} to module {:?}", type_name, path);

        let own_exe = fs::read_link("/proc/self/exe").ok();
        let addr = if own_exe.as_deref() == Some(path.as_path()) {
            resolve_in_exe(type_name, method_name)?
        } else {
            resolve_in_dso(&path, type_name, method_name)?
        };
        debug!("resolved {}::{} to {:#x}", type_name, method_name, addr);
        Ok(addr)
    }
}

#[no_mangle]
#[cfg(test)]
pub extern "C" fn runepatch_resolve_probe() -> i32 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_matching() {
        assert!(module_matches("demo-target", "demo-target"));
        assert!(module_matches("librunepatch_demo.so", "runepatch_demo"));
        assert!(module_matches("libc.so.6", "c"));
        assert!(module_matches("some_crate-0a1b2c", "some_crate"));
        assert!(!module_matches("librunepatch_demo.so", "other_demo"));
        assert!(!module_matches("demo-target", "target"));
    }

    #[test]
    fn resolves_symbol_in_own_executable() {
        let exe = fs::read_link("/proc/self/exe").unwrap();
        let type_name = exe.file_name().unwrap().to_str().unwrap().to_string();

        let addr = ProcessResolver
            .resolve(&type_name, "runepatch_resolve_probe")
            .unwrap();
        assert_eq!(addr, runepatch_resolve_probe as usize);
    }

    #[test]
    fn unknown_method_in_own_executable() {
        let exe = fs::read_link("/proc/self/exe").unwrap();
        let type_name = exe.file_name().unwrap().to_str().unwrap().to_string();

        assert!(matches!(
            ProcessResolver.resolve(&type_name, "no_such_method_anywhere"),
            Err(ResolveError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn unknown_type_is_reported() {
        assert!(matches!(
            ProcessResolver.resolve("no-such-module", "irrelevant"),
            Err(ResolveError::TypeNotFound(_))
        ));
    }

    #[test]
    fn resolves_export_in_loaded_dso() {
        // libc is always resident; malloc is always exported.
        let addr = ProcessResolver.resolve("c", "malloc").unwrap();
        assert_ne!(addr, 0);
    }
}
