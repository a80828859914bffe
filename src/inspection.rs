//! Inspection of the target process: locating libc and the dynamic-linker
//! entry points (`dlopen`, `dlsym`) inside its address space.

use std::{
    fs,
    io::ErrorKind,
    path::PathBuf,
};

use anyhow::{anyhow, bail, Context, Result};
use goblin::{elf::Elf, elf64::program_header::PT_LOAD};
use nix::unistd::Pid;
use proc_maps::MapRange;
use regex::Regex;

fn get_libc_text_maprange(pid: Pid) -> Result<MapRange> {
    let re = Regex::new(r"^libc(-[0-9.]+)?\.so[0-9.]*$").unwrap();
    for map in proc_maps::get_process_maps(pid.as_raw())
        .context("Failed to retrieve memory map of target")?
    {
        // ASSUMPTION: libc contains only one executable mapping,
        // corresponding to the LOAD phdr containing .text.
        if !map.is_exec() {
            continue;
        }
        if let Some(basename) = map.filename().and_then(|f| f.file_name()) {
            match basename.to_str() {
                Some(s) => {
                    if re.is_match(s) {
                        return Ok(map);
                    }
                }
                None => continue,
            }
        }
    }
    bail!("No mapping matches known libc names")
}

fn get_mapfile(pid: Pid, start: usize, size: usize) -> PathBuf {
    PathBuf::from(format!(
        "/proc/{}/map_files/{:x}-{:x}",
        pid.as_raw(),
        start,
        start + size
    ))
}

fn read_mapped_image(pid: Pid, map: &MapRange) -> Result<Vec<u8>> {
    let mapfile = get_mapfile(pid, map.start(), map.size());
    match fs::read(&mapfile) {
        Ok(f) => Ok(f),
        Err(e) => match e.kind() {
            ErrorKind::PermissionDenied => {
                let filename = map.filename().context("MapRange does not have filename")?;
                eprintln!(
                    "Failed to open {:?}, falling back to {:?}. CAP_SYS_ADMIN is required to access map_files, despite having permission to ptrace the target. {}",
                    &mapfile, filename, e
                );
                fs::read(filename).context(format!("Could not read image from {:?}", filename))
            }
            _ => Err(anyhow!(e)),
        },
    }
}

/// Find the in-target address of the first of `names` exported by the
/// target's libc. Used for `dlopen` and `dlsym`, whose homes moved from
/// libdl into libc proper with glibc 2.34; the signatures are unchanged,
/// so any of the aliases will do.
pub fn find_libc_export(pid: Pid, names: &[&str]) -> Result<u64> {
    let map = get_libc_text_maprange(pid).context("Failed to find libc .text mapping")?;
    let libc = read_mapped_image(pid, &map)?;
    let elf = Elf::parse(&libc).context("Failed to parse libc image as elf")?;

    let exec_phdr = elf
        .program_headers
        .iter()
        .find(|phdr| {
            phdr.p_type == PT_LOAD && phdr.is_executable() && phdr.p_offset as usize == map.offset
        })
        .context("Could not find exec phdr matching libc .text mapping")?;

    let dynstrtab = elf.dynstrtab;
    for sym in elf.dynsyms.iter() {
        if let Some(name) = dynstrtab.get_at(sym.st_name) {
            if names.contains(&name) {
                return Ok(sym.st_value - exec_phdr.p_vaddr + map.start() as u64);
            }
        }
    }
    bail!("None of {:?} found in target libc", names)
}

/// dlopen aliases across glibc versions.
pub const DLOPEN_NAMES: &[&str] = &["__libc_dlopen_mode", "dlopen"];
/// dlsym aliases across glibc versions.
pub const DLSYM_NAMES: &[&str] = &["__libc_dlsym", "dlsym"];
