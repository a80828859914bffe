//! Entry rewriting: install a prefix hook ahead of a resolved function.
//!
//! The entry of the target is overwritten with an absolute jump to a
//! generated shim. The shim spills the six integer argument registers,
//! hands the hook a mutable view of them, reloads the registers and jumps
//! to a trampoline holding the stolen prologue (or, for bodies shorter
//! than the patch, the relocated function entire), so the original body
//! runs with whatever the hook left in the argument slots.

use core::slice;
use std::ffi::c_void;

use nix::libc;
use nix::sys::mman::{mprotect, ProtFlags};
use thiserror::Error;
use tracing::debug;

use crate::prologue::steal_prologue;

#[derive(Error, Debug)]
pub enum InterceptError {
    #[error("could not mmap code page")]
    Mmap,
    #[error("not enough space in code page")]
    NotEnoughSpace,
    #[error("method cannot be intercepted: {0}")]
    Unsupported(String),
    #[error("could not change page protection: {0}")]
    Protect(nix::Error),
}

/// `mov rax, imm64; jmp rax` - the patch written over the entry, and the
/// tail of every trampoline.
pub(crate) const PATCH_LEN: usize = 12;

/// How many entry bytes are inspected when measuring the prologue. An
/// instruction never exceeds 15 bytes, so this always covers the last one
/// started inside the patch window.
const MAX_PROLOGUE_SCAN: usize = 32;

const PAGE_SIZE: usize = 4096;

/// Mutable view of the intercepted call's arguments, in System V integer
/// argument register order (rdi, rsi, rdx, rcx, r8, r9). Mutations are
/// loaded back into the registers before the original body runs.
///
/// Arguments passed on the stack or in vector registers are outside this
/// view; hooks for such methods cannot be expressed.
#[repr(C)]
#[derive(Debug)]
pub struct PrefixArgs {
    regs: [u64; 6],
}

impl PrefixArgs {
    pub fn arg(&self, index: usize) -> u64 {
        assert!(index < 6, "only register arguments are visible to hooks");
        self.regs[index]
    }

    pub fn set_arg(&mut self, index: usize, value: u64) {
        assert!(index < 6, "only register arguments are visible to hooks");
        self.regs[index] = value;
    }
}

/// A hook of kind Prefix. Runs before the original body on every call, on
/// whatever thread made the call; any shared state it touches is the hook
/// author's to protect.
pub type PrefixHook = extern "C" fn(&mut PrefixArgs);

fn jmp_abs(target: u64) -> Vec<u8> {
    let mut code = b"\x48\xb8\x00\x00\x00\x00\x00\x00\x00\x00\xff\xe0".to_vec();
    code[2..10].copy_from_slice(&target.to_le_bytes());
    code
}

/// Shim machine code for one installed prefix hook.
fn emit_prefix_shim(hook: u64, trampoline: u64) -> Vec<u8> {
    let mut code = Vec::with_capacity(64);
    // Spill argument registers so that [rsp] = rdi .. [rsp+40] = r9,
    // matching the PrefixArgs layout.
    code.extend_from_slice(&[0x41, 0x51]); // push r9
    code.extend_from_slice(&[0x41, 0x50]); // push r8
    code.push(0x51); // push rcx
    code.push(0x52); // push rdx
    code.push(0x56); // push rsi
    code.push(0x57); // push rdi
    code.extend_from_slice(&[0x48, 0x89, 0xe7]); // mov rdi, rsp
    // Entry rsp is 8 mod 16 and six pushes keep it there; one slot brings
    // the hook call to the ABI-required alignment.
    code.extend_from_slice(&[0x48, 0x83, 0xec, 0x08]); // sub rsp, 8
    code.extend_from_slice(&[0x48, 0xb8]); // mov rax, hook
    code.extend_from_slice(&hook.to_le_bytes());
    code.extend_from_slice(&[0xff, 0xd0]); // call rax
    code.extend_from_slice(&[0x48, 0x83, 0xc4, 0x08]); // add rsp, 8
    code.push(0x5f); // pop rdi
    code.push(0x5e); // pop rsi
    code.push(0x5a); // pop rdx
    code.push(0x59); // pop rcx
    code.extend_from_slice(&[0x41, 0x58]); // pop r8
    code.extend_from_slice(&[0x41, 0x59]); // pop r9
    code.extend_from_slice(&jmp_abs(trampoline));
    code
}

/// Bump allocator over one RWX page for shims and trampolines.
struct CodeArena {
    data: &'static mut [u8],
    current_offset: usize,
}

impl CodeArena {
    fn new() -> Result<Self, InterceptError> {
        let data = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(InterceptError::Mmap);
            }
            slice::from_raw_parts_mut(ptr as *mut u8, PAGE_SIZE)
        };
        Ok(Self {
            data,
            current_offset: 0,
        })
    }

    fn append(&mut self, code: &[u8]) -> Result<usize, InterceptError> {
        if self.current_offset + code.len() > self.data.len() {
            return Err(InterceptError::NotEnoughSpace);
        }
        let addr = self.data[self.current_offset..].as_ptr() as usize;
        self.data[self.current_offset..self.current_offset + code.len()].copy_from_slice(code);
        self.current_offset += code.len();
        Ok(addr)
    }
}

pub struct Interceptor {
    arena: CodeArena,
}

impl Interceptor {
    pub fn new() -> Result<Self, InterceptError> {
        Ok(Self {
            arena: CodeArena::new()?,
        })
    }

    /// Rewrite the entry of the function at `target` so every future call
    /// runs `hook` first. Not reversible. Fails without touching the entry
    /// if the prologue cannot be stolen; never installs a silent no-op.
    ///
    /// A body shorter than the patch relocates to the trampoline whole,
    /// through its `ret`; the overwrite then spills into the alignment
    /// padding behind it, which is never executed.
    ///
    /// # Safety
    ///
    /// `target` must be the entry of an `extern "C"` function taking only
    /// integer-register arguments, with at least [`MAX_PROLOGUE_SCAN`]
    /// readable bytes. A body shorter than [`PATCH_LEN`] must be followed
    /// by padding up to [`PATCH_LEN`], as the usual 16-byte function
    /// alignment guarantees. Calls racing the installation itself may
    /// observe a half-written entry.
    pub unsafe fn install_prefix(
        &mut self,
        target: usize,
        hook: PrefixHook,
    ) -> Result<(), InterceptError> {
        let entry = slice::from_raw_parts(target as *const u8, MAX_PROLOGUE_SCAN);
        let stolen = steal_prologue(entry, PATCH_LEN)?;

        let mut trampoline = entry[..stolen.len].to_vec();
        if !stolen.whole_body {
            trampoline.extend_from_slice(&jmp_abs((target + stolen.len) as u64));
        }
        let trampoline_addr = self.arena.append(&trampoline)?;

        let shim = emit_prefix_shim(hook as usize as u64, trampoline_addr as u64);
        let shim_addr = self.arena.append(&shim)?;
        debug!(
            "installing prefix hook at {:#x}, shim {:#x}, {} bytes stolen{}",
            target,
            shim_addr,
            stolen.len,
            if stolen.whole_body { " (whole body)" } else { "" }
        );

        let page_start = target & !(PAGE_SIZE - 1);
        mprotect(
            page_start as *mut c_void,
            target + PATCH_LEN - page_start,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )
        .map_err(InterceptError::Protect)?;

        let patch = jmp_abs(shim_addr as u64);
        slice::from_raw_parts_mut(target as *mut u8, PATCH_LEN).copy_from_slice(&patch);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use core::slice;

    use nix::libc;

    /// Map an RWX page holding `identity(i: i32) -> i32` with a 12-byte
    /// relocatable nop prologue, returning its address. Leaked.
    pub(crate) fn synthetic_identity() -> usize {
        let mut code = vec![0x90u8; 12];
        code.extend_from_slice(&[0x89, 0xf8, 0xc3]); // mov eax, edi; ret
        let page = unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            assert_ne!(ptr, libc::MAP_FAILED);
            slice::from_raw_parts_mut(ptr as *mut u8, 4096)
        };
        page[..code.len()].copy_from_slice(&code);
        page.as_ptr() as usize
    }

    pub(crate) unsafe fn as_identity_fn(addr: usize) -> extern "C" fn(i32) -> i32 {
        std::mem::transmute(addr)
    }
}
