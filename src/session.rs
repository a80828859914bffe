//! Boundary to the instrumentation service that gives us a foothold in the
//! target process.
//!
//! The coordinator, marshaller and invoker only see this trait. The concrete
//! implementation shipped here drives ptrace (see [`crate::ptrace`]), but
//! tests substitute an in-memory fake.

use std::path::Path;

use thiserror::Error;

/// An address inside the target process. Never dereferenced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemotePtr(pub u64);

/// Handle of a module made resident in the target, as returned by its
/// loading facility (dlopen cookie on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle(pub u64);

/// Width of a native string in the target process: 8-bit on POSIX-like
/// targets, 16-bit elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringWidth {
    Narrow,
    Wide,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("attach: {0}")]
    Attach(String),
    #[error("target memory: {0}")]
    Memory(String),
    #[error("module load in target: {0}")]
    ModuleLoad(String),
    #[error("symbol {0} not found in target")]
    SymbolNotFound(String),
    #[error("remote call: {0}")]
    Call(String),
}

/// A live session against one target process.
///
/// All operations are synchronous and blocking; none are retried. Memory
/// handed out by [`alloc`](TargetSession::alloc) lives until the target
/// exits - the scratch-allocation pattern of injection tooling.
pub trait TargetSession {
    /// String width the target platform expects.
    fn string_width(&self) -> StringWidth;

    /// Allocate `len` bytes of scratch memory inside the target.
    fn alloc(&mut self, len: usize) -> Result<RemotePtr, SessionError>;

    /// Write `bytes` at `dest` inside the target.
    fn write(&mut self, dest: RemotePtr, bytes: &[u8]) -> Result<(), SessionError>;

    /// Make the module at `path` resident in the target and return its
    /// handle. The path is interpreted by the target, so it must be
    /// absolute.
    fn load_module(&mut self, path: &Path) -> Result<ModuleHandle, SessionError>;

    /// Resolve an export of a resident module to a callable address.
    fn resolve_export(&mut self, module: ModuleHandle, name: &str)
        -> Result<RemotePtr, SessionError>;

    /// Call `func` with four pointer-sized arguments and collect its `u32`
    /// return value. Blocks until the target returns.
    fn call4(&mut self, func: RemotePtr, args: [RemotePtr; 4]) -> Result<u32, SessionError>;
}
