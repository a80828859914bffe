//! Shared ABI contract between the injector and the code that ends up
//! resident in the target process.
//!
//! The loader export takes four native-string pointers (runtime config path,
//! module path, type name, method name) and returns a `u32` status. The
//! injector treats any nonzero status as "injection failed" and maps it to a
//! human-readable hint with [`describe`].

/// Name of the export resolved inside the target after the loader library
/// has been made resident there.
pub const LOADER_EXPORT: &str = "runepatch_load_module";

/// Conventional name of the no-arg, no-return entry point a patch module
/// exports. The request's method name selects the actual symbol; the CLI
/// fills this in when none is given.
pub const DEFAULT_ENTRY: &str = "initialize_patches";

/// Status codes returned by the loader export. `Success` is the only value
/// the injector interprets; everything else is propagated verbatim.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Success = 0,
    /// A string argument was null or not valid UTF-8.
    BadArgument = 1,
    /// The runtime configuration file could not be read.
    RuntimeConfigError = 2,
    /// dlopen of the patch module failed.
    ModuleLoadError = 3,
    /// The entry point symbol was not exported by the patch module.
    EntryPointNotFound = 4,
}

impl LoadStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(LoadStatus::Success),
            1 => Some(LoadStatus::BadArgument),
            2 => Some(LoadStatus::RuntimeConfigError),
            3 => Some(LoadStatus::ModuleLoadError),
            4 => Some(LoadStatus::EntryPointNotFound),
            _ => None,
        }
    }
}

/// Human-readable hint for a loader status code. Unknown codes are legal:
/// the contract only promises that nonzero means failure.
pub fn describe(code: u32) -> &'static str {
    match LoadStatus::from_code(code) {
        Some(LoadStatus::Success) => "success",
        Some(LoadStatus::BadArgument) => "loader rejected an argument",
        Some(LoadStatus::RuntimeConfigError) => "runtime config file unreadable in target",
        Some(LoadStatus::ModuleLoadError) => "patch module failed to load in target",
        Some(LoadStatus::EntryPointNotFound) => "entry point not exported by patch module",
        None => "unknown loader-defined failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for code in 0..5 {
            let status = LoadStatus::from_code(code).unwrap();
            assert_eq!(status as u32, code);
        }
        assert_eq!(LoadStatus::from_code(99), None);
    }

    #[test]
    fn nonzero_is_described() {
        assert_eq!(describe(0), "success");
        assert_ne!(describe(3), "success");
        assert_eq!(describe(12345), "unknown loader-defined failure");
    }
}
