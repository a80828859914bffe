//! In-process patch engine: discovers the patch declarations of an injected
//! module, resolves each target by name and installs the interception.
//!
//! The engine is an explicit instance, never an ambient singleton; the
//! module's entry point constructs one and keeps it alive for the process
//! lifetime, and tests construct their own with fake resolvers.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{info, warn};

pub mod intercept;
mod prologue;
pub mod resolve;

pub use intercept::{InterceptError, Interceptor, PrefixArgs, PrefixHook};
pub use resolve::{ProcessResolver, ResolveError, SymbolResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Prefix,
    Postfix,
    Replace,
}

/// A static declaration of which method to intercept and with what hook.
/// Patch modules declare a fixed table of these; nothing is configurable at
/// runtime.
#[derive(Clone, Copy)]
pub struct PatchDescriptor {
    pub target_type: &'static str,
    pub target_method: &'static str,
    pub kind: HookKind,
    pub hook: PrefixHook,
}

impl PatchDescriptor {
    pub const fn prefix(
        target_type: &'static str,
        target_method: &'static str,
        hook: PrefixHook,
    ) -> Self {
        PatchDescriptor {
            target_type,
            target_method,
            kind: HookKind::Prefix,
            hook,
        }
    }
}

/// The declarations of one injected module.
pub struct PatchModule {
    pub name: &'static str,
    pub patches: &'static [PatchDescriptor],
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("target did not resolve: {0}")]
    Resolution(#[from] ResolveError),
    #[error("interception failed: {0}")]
    Interception(#[from] InterceptError),
    #[error("hook kind {0:?} is not installable")]
    UnsupportedKind(HookKind),
}

/// Runtime binding between a descriptor and the method it intercepts.
/// Never destroyed; there is no unpatch.
#[derive(Debug, Clone, Copy)]
pub struct InstalledPatch {
    pub target_type: &'static str,
    pub target_method: &'static str,
    pub kind: HookKind,
    pub target: usize,
}

#[derive(Debug)]
pub struct PatchFailure {
    pub target_type: &'static str,
    pub target_method: &'static str,
    pub error: PatchError,
}

/// Per-descriptor outcome of one initialization pass. One descriptor
/// failing never aborts the others.
#[derive(Debug, Default)]
pub struct InitReport {
    pub installed: Vec<InstalledPatch>,
    pub skipped: Vec<(&'static str, &'static str)>,
    pub failures: Vec<PatchFailure>,
}

impl InitReport {
    pub fn fully_applied(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct PatchEngine<R: SymbolResolver> {
    resolver: R,
    interceptor: Interceptor,
    seen: HashSet<(&'static str, &'static str)>,
    installed: Vec<InstalledPatch>,
}

impl<R: SymbolResolver> PatchEngine<R> {
    pub fn new(resolver: R) -> Result<Self, InterceptError> {
        Ok(PatchEngine {
            resolver,
            interceptor: Interceptor::new()?,
            seen: HashSet::new(),
            installed: Vec::new(),
        })
    }

    /// Install every patch the module declares. Each descriptor is
    /// attempted independently; resolution or installation failures are
    /// collected, not thrown. Re-initialization never double-installs a
    /// (type, method) pair - duplicate deliveries of the entry point are
    /// part of the protocol.
    pub fn initialize(&mut self, module: &PatchModule) -> InitReport {
        info!(module = module.name, declared = module.patches.len(), "initializing patches");
        let mut report = InitReport::default();

        for descriptor in module.patches {
            let key = (descriptor.target_type, descriptor.target_method);
            if self.seen.contains(&key) {
                report.skipped.push(key);
                continue;
            }
            match self.apply(descriptor) {
                Ok(patch) => {
                    self.seen.insert(key);
                    self.installed.push(patch);
                    report.installed.push(patch);
                }
                Err(error) => {
                    warn!(
                        target_type = descriptor.target_type,
                        target_method = descriptor.target_method,
                        %error,
                        "patch not applied"
                    );
                    report.failures.push(PatchFailure {
                        target_type: descriptor.target_type,
                        target_method: descriptor.target_method,
                        error,
                    });
                }
            }
        }
        report
    }

    /// Everything installed over the engine's lifetime.
    pub fn installed(&self) -> &[InstalledPatch] {
        &self.installed
    }

    fn apply(&mut self, descriptor: &PatchDescriptor) -> Result<InstalledPatch, PatchError> {
        let target = self
            .resolver
            .resolve(descriptor.target_type, descriptor.target_method)?;
        match descriptor.kind {
            HookKind::Prefix => unsafe {
                self.interceptor.install_prefix(target, descriptor.hook)?;
            },
            other => return Err(PatchError::UnsupportedKind(other)),
        }
        Ok(InstalledPatch {
            target_type: descriptor.target_type,
            target_method: descriptor.target_method,
            kind: descriptor.kind,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::intercept::testutil::{as_identity_fn, synthetic_identity};
    use super::*;

    struct FakeResolver {
        map: HashMap<(&'static str, &'static str), usize>,
    }

    impl SymbolResolver for FakeResolver {
        fn resolve(&self, type_name: &str, method_name: &str) -> Result<usize, ResolveError> {
            self.map
                .get(&(type_name, method_name))
                .copied()
                .ok_or_else(|| ResolveError::MethodNotFound {
                    type_name: type_name.to_string(),
                    method: method_name.to_string(),
                })
        }
    }

    // Descriptor tables are 'static, as in a real patch module.
    extern "C" fn force_1337(args: &mut PrefixArgs) {
        args.set_arg(0, 1337);
    }

    extern "C" fn noop(_args: &mut PrefixArgs) {}

    fn engine_with(
        entries: &[(&'static str, &'static str, usize)],
    ) -> PatchEngine<FakeResolver> {
        let map = entries.iter().map(|(t, m, a)| ((*t, *m), *a)).collect();
        PatchEngine::new(FakeResolver { map }).unwrap()
    }

    #[test]
    fn partial_failure_installs_the_resolvable_subset() {
        static MODULE: PatchModule = PatchModule {
            name: "partial",
            patches: &[
                PatchDescriptor::prefix("app", "first", noop),
                PatchDescriptor::prefix("app", "missing", noop),
                PatchDescriptor::prefix("app", "second", noop),
            ],
        };
        let mut engine = engine_with(&[
            ("app", "first", synthetic_identity()),
            ("app", "second", synthetic_identity()),
        ]);

        let report = engine.initialize(&MODULE);
        assert_eq!(report.installed.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.fully_applied());
        assert_eq!(report.failures[0].target_method, "missing");
        assert!(matches!(
            report.failures[0].error,
            PatchError::Resolution(ResolveError::MethodNotFound { .. })
        ));
        // The failure in the middle must not have aborted the pass.
        assert_eq!(report.installed[1].target_method, "second");
    }

    #[test]
    fn reinitialization_does_not_double_install() {
        static MODULE: PatchModule = PatchModule {
            name: "twice",
            patches: &[PatchDescriptor::prefix("app", "F", force_1337)],
        };
        let target = synthetic_identity();
        let mut engine = engine_with(&[("app", "F", target)]);

        let first = engine.initialize(&MODULE);
        assert_eq!(first.installed.len(), 1);

        let second = engine.initialize(&MODULE);
        assert!(second.installed.is_empty());
        assert_eq!(second.skipped, vec![("app", "F")]);
        assert_eq!(engine.installed().len(), 1);

        // Exactly one interception: the hooked function still behaves.
        let func = unsafe { as_identity_fn(target) };
        assert_eq!(func(5), 1337);
    }

    #[test]
    fn prefix_mutation_reaches_the_original_body() {
        static MODULE: PatchModule = PatchModule {
            name: "mutate",
            patches: &[PatchDescriptor::prefix("app", "F", force_1337)],
        };
        let target = synthetic_identity();
        let mut engine = engine_with(&[("app", "F", target)]);
        assert!(engine.initialize(&MODULE).fully_applied());

        let func = unsafe { as_identity_fn(target) };
        for input in [0, 1, -5, 9000] {
            assert_eq!(func(input), 1337);
        }
    }

    #[test]
    fn unsupported_kind_is_a_per_descriptor_failure() {
        static MODULE: PatchModule = PatchModule {
            name: "kinds",
            patches: &[
                PatchDescriptor {
                    target_type: "app",
                    target_method: "F",
                    kind: HookKind::Replace,
                    hook: noop,
                },
                PatchDescriptor::prefix("app", "G", noop),
            ],
        };
        let mut engine = engine_with(&[
            ("app", "F", synthetic_identity()),
            ("app", "G", synthetic_identity()),
        ]);

        let report = engine.initialize(&MODULE);
        assert_eq!(report.installed.len(), 1);
        assert!(matches!(
            report.failures[0].error,
            PatchError::UnsupportedKind(HookKind::Replace)
        ));
    }
}
