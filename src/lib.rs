//! runepatch - inject a patch module into a running process and rewrite one
//! of its functions at runtime.
//!
//! The injector side lives here: the [`inject`] coordinator sequences the
//! argument marshaller and the bootstrap invoker over a [`TargetSession`],
//! the boundary to whatever attaches us to the target (the shipped backend
//! is ptrace, see [`ptrace`]).

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

pub mod inspection;
pub mod invoke;
pub mod marshal;
pub mod process;
pub mod ptrace;
pub mod session;

use session::TargetSession;

/// One logical injection attempt. Immutable once constructed; owned by the
/// coordinator for the duration of the attempt.
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    /// Process name or pid, used by the caller to attach. Kept here for
    /// reporting only.
    pub target: String,
    /// Loader library to make resident in the target.
    pub loader_path: PathBuf,
    /// Runtime configuration file, interpreted by the loader.
    pub runtime_config_path: PathBuf,
    /// Patch module the loader will open.
    pub module_path: PathBuf,
    /// Name of the scope declaring the entry point.
    pub type_name: String,
    /// Name of the entry point the loader invokes.
    pub method_name: String,
}

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to attach to target: {0}")]
    Attach(String),
    #[error("failed to load loader module in target: {0}")]
    LoaderLoad(String),
    #[error("failed to marshal arguments into target: {0}")]
    Marshal(String),
    #[error("loader export {0} not found in target")]
    SymbolNotFound(String),
    #[error("loader invocation failed: {0}")]
    Invocation(String),
}

/// Attach to a target with the ptrace backend, folding attach failures
/// into the injection error taxonomy.
pub fn attach(pid: nix::unistd::Pid) -> Result<ptrace::PtraceSession, InjectError> {
    ptrace::PtraceSession::attach(pid).map_err(|e| InjectError::Attach(e.to_string()))
}

/// Drive one injection attempt: make the loader resident, marshal the
/// request strings into the target, call the loader export.
///
/// Returns the loader's status code verbatim; `0` means the managed entry
/// point ran. Injection is atomic from the caller's view: on any error
/// nothing observable changed in the target apart from scratch memory,
/// which is tolerated and never reclaimed.
pub fn inject<S: TargetSession + ?Sized>(
    session: &mut S,
    request: &InjectionRequest,
) -> Result<u32, InjectError> {
    // Relative paths are meaningless once the target interprets them; its
    // working directory is not ours. Existence is not required here - a
    // missing module path must still reach the loader.
    let loader_path = absolutize(&request.loader_path)?;
    let runtime_config = absolutize(&request.runtime_config_path)?;
    let module_path = absolutize(&request.module_path)?;

    info!(
        "starting injection into {} with loader {}",
        request.target,
        loader_path.display()
    );

    let handle = session
        .load_module(&loader_path)
        .map_err(|e| InjectError::LoaderLoad(e.to_string()))?;
    debug!(?handle, "loader resident in target");

    let args = marshal::marshal_args(
        session,
        [
            path_str(&runtime_config)?,
            path_str(&module_path)?,
            &request.type_name,
            &request.method_name,
        ],
    )?;

    let status = invoke::invoke_loader(session, handle, runepatch_abi::LOADER_EXPORT, args)?;
    info!(status, "loader returned");
    Ok(status)
}

fn absolutize(path: &Path) -> Result<PathBuf, InjectError> {
    std::path::absolute(path)
        .map_err(|e| InjectError::Marshal(format!("cannot absolutize {:?}: {}", path, e)))
}

fn path_str(path: &Path) -> Result<&str, InjectError> {
    path.to_str()
        .ok_or_else(|| InjectError::Marshal(format!("path {:?} is not valid UTF-8", path)))
}
