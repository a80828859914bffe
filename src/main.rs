use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::{libc::pid_t, unistd::Pid};
use runepatch::{attach, inject, process, InjectionRequest};
use tracing_subscriber::EnvFilter;

/// Inject a patch module into a running process.
#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Target process: pid or name
    process: String,

    /// Loader library made resident in the target
    loader: PathBuf,

    /// Runtime configuration file for the loader
    runtime_config: PathBuf,

    /// Patch module the loader opens
    module: PathBuf,

    /// Scope declaring the entry point
    type_name: String,

    /// Entry point the loader invokes
    #[clap(default_value_t = String::from(runepatch_abi::DEFAULT_ENTRY))]
    method_name: String,
}

fn resolve_target(spec: &str) -> Result<Pid> {
    if let Ok(pid) = spec.parse::<pid_t>() {
        return Ok(Pid::from_raw(pid));
    }
    process::find_by_name(spec)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let pid = resolve_target(&args.process)
        .with_context(|| format!("Cannot locate target process {:?}", args.process))?;

    let request = InjectionRequest {
        target: args.process.clone(),
        loader_path: args.loader,
        runtime_config_path: args.runtime_config,
        module_path: args.module,
        type_name: args.type_name,
        method_name: args.method_name,
    };

    let mut session = attach(pid).with_context(|| format!("Cannot attach to pid {}", pid))?;
    let status = inject(&mut session, &request)?;
    drop(session);

    println!("inject => {} ({})", status, runepatch_abi::describe(status));
    if status != 0 {
        bail!("injection not applied, loader status {}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_name_defaults_to_the_conventional_entry_point() {
        let args = Args::try_parse_from([
            "runepatch",
            "demo-target",
            "loader.so",
            "runepatch.conf",
            "libdemo.so",
            "demo",
        ])
        .unwrap();
        assert_eq!(args.method_name, runepatch_abi::DEFAULT_ENTRY);
    }

    #[test]
    fn explicit_method_name_overrides_the_default() {
        let args = Args::try_parse_from([
            "runepatch",
            "demo-target",
            "loader.so",
            "runepatch.conf",
            "libdemo.so",
            "demo",
            "custom_entry",
        ])
        .unwrap();
        assert_eq!(args.method_name, "custom_entry");
    }
}
