//! Invocation of the loader export inside the target.

use tracing::debug;

use crate::session::{ModuleHandle, RemotePtr, SessionError, TargetSession};
use crate::InjectError;

/// Resolve `export` in the resident loader module and call it with the four
/// marshalled arguments. The loader's status code is propagated verbatim;
/// a failure to resolve or call is reported once, never retried.
pub fn invoke_loader<S: TargetSession + ?Sized>(
    session: &mut S,
    module: ModuleHandle,
    export: &str,
    args: [RemotePtr; 4],
) -> Result<u32, InjectError> {
    let func = session.resolve_export(module, export).map_err(|e| match e {
        SessionError::SymbolNotFound(name) => InjectError::SymbolNotFound(name),
        other => InjectError::Invocation(other.to_string()),
    })?;
    debug!("resolved loader export {} at {:#x}", export, func.0);

    session
        .call4(func, args)
        .map_err(|e| InjectError::Invocation(e.to_string()))
}
