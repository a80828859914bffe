//! Pid lookup by process name.

use std::fs;

use anyhow::{bail, Context, Result};
use nix::{libc::pid_t, unistd::Pid};

/// All pids whose comm equals `name`. comm is truncated to 15 bytes by the
/// kernel, so the caller should pass the short name.
pub fn pids_by_name(name: &str) -> Result<Vec<Pid>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc").context("Failed to read /proc")? {
        let entry = entry?;
        let pid: pid_t = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let comm = match fs::read_to_string(entry.path().join("comm")) {
            Ok(comm) => comm,
            // Processes may exit while we scan.
            Err(_) => continue,
        };
        if comm.trim_end_matches('\n') == name {
            pids.push(Pid::from_raw(pid));
        }
    }
    Ok(pids)
}

/// Resolve a process name to exactly one pid. Ambiguity is an error: the
/// caller has no way to tell which instance they meant.
pub fn find_by_name(name: &str) -> Result<Pid> {
    let pids = pids_by_name(name)?;
    match pids.as_slice() {
        [] => bail!("No process named {:?}", name),
        [pid] => Ok(*pid),
        more => bail!(
            "Process name {:?} is ambiguous ({} candidates: {:?})",
            name,
            more.len(),
            more
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_own_process() {
        let own_comm = fs::read_to_string("/proc/self/comm").unwrap();
        let pids = pids_by_name(own_comm.trim_end_matches('\n')).unwrap();
        assert!(pids.contains(&Pid::this()));
    }

    #[test]
    fn unknown_name_is_empty() {
        let pids = pids_by_name("no-such-process-runepatch").unwrap();
        assert!(pids.is_empty());
    }
}
