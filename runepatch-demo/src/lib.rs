//! Demo patch module: forces the first argument of `demo-target`'s `F` to
//! 1337 before its body runs.
//!
//! The loader invokes [`initialize_patches`] once the module is resident.
//! The injection protocol cannot prevent duplicate delivery, so the entry
//! point must be re-entrant: the engine lives in a `OnceLock` and its
//! seen-set keeps every (type, method) pair installed at most once.

use std::sync::{Mutex, OnceLock};

use runepatch_engine::{
    PatchDescriptor, PatchEngine, PatchModule, PrefixArgs, ProcessResolver,
};

extern "C" fn force_1337(args: &mut PrefixArgs) {
    args.set_arg(0, 1337);
}

pub static MODULE: PatchModule = PatchModule {
    name: "runepatch_demo",
    patches: &[PatchDescriptor::prefix("demo-target", "F", force_1337)],
};

static ENGINE: OnceLock<Option<Mutex<PatchEngine<ProcessResolver>>>> = OnceLock::new();

/// Managed entry point: no arguments, no return value, invoked by the
/// loader. Owns the process-wide engine for the rest of the host's life.
#[no_mangle]
pub extern "C" fn initialize_patches() {
    eprintln!("runepatch-demo: injected");

    let engine = ENGINE.get_or_init(|| match PatchEngine::new(ProcessResolver) {
        Ok(engine) => Some(Mutex::new(engine)),
        Err(e) => {
            eprintln!("runepatch-demo: cannot construct patch engine: {}", e);
            None
        }
    });
    let engine = match engine {
        Some(engine) => engine,
        None => return,
    };

    let report = match engine.lock() {
        Ok(mut engine) => engine.initialize(&MODULE),
        Err(_) => {
            eprintln!("runepatch-demo: engine lock poisoned");
            return;
        }
    };

    for patch in &report.installed {
        eprintln!(
            "runepatch-demo: patched {}::{} at {:#x}",
            patch.target_type, patch.target_method, patch.target
        );
    }
    for skipped in &report.skipped {
        eprintln!(
            "runepatch-demo: {}::{} already patched, skipping",
            skipped.0, skipped.1
        );
    }
    for failure in &report.failures {
        eprintln!(
            "runepatch-demo: {}::{} not patched: {}",
            failure.target_type, failure.target_method, failure.error
        );
    }
}

#[cfg(test)]
mod tests {
    use runepatch_engine::HookKind;

    use super::*;

    #[test]
    fn declares_one_prefix_patch_on_f() {
        assert_eq!(MODULE.patches.len(), 1);
        let patch = &MODULE.patches[0];
        assert_eq!(patch.target_type, "demo-target");
        assert_eq!(patch.target_method, "F");
        assert_eq!(patch.kind, HookKind::Prefix);
    }

    #[test]
    fn hook_overwrites_the_first_argument_only() {
        let mut args = unsafe { std::mem::zeroed::<PrefixArgs>() };
        args.set_arg(0, 7);
        args.set_arg(1, 21);
        force_1337(&mut args);
        assert_eq!(args.arg(0), 1337);
        assert_eq!(args.arg(1), 21);
    }

    #[test]
    fn entry_point_tolerates_duplicate_delivery() {
        // Resolution of demo-target fails inside a test binary; delivery
        // must still be idempotent and quiet about it.
        initialize_patches();
        initialize_patches();
    }
}
