//! ptrace-backed implementation of the [`TargetSession`] boundary.
//!
//! The target thread is seized and interrupted once at attach. Scratch
//! memory is obtained by injecting an mmap syscall at the interrupted rip;
//! loader invocation reuses a small call thunk written into a scratch page
//! that traps back to us with an int3. Registers are restored and the
//! target detached when the session drops; scratch pages are left behind
//! for the life of the target, by design.

use std::{ffi::c_void, path::Path};

use nix::{
    libc::{
        user_regs_struct, SYS_mmap, MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
        PTRACE_EVENT_STOP, RTLD_NOW,
    },
    sys::{
        ptrace::{self, AddressType},
        signal::Signal,
        uio::{process_vm_writev, IoVec, RemoteIoVec},
        wait::{self, WaitStatus},
    },
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::inspection::{find_libc_export, DLOPEN_NAMES, DLSYM_NAMES};
use crate::session::{ModuleHandle, RemotePtr, SessionError, StringWidth, TargetSession};

const PAGE_SIZE: u64 = 4096;
const STACK_SIZE: u64 = 0x20000;

/// Call thunk layout in the scratch page:
///
/// ```text
///   +0   90 90                 two nops, syscall-restart slack
///   +2   48 b8 <func>          mov rax, imm64
///   +12  ff d0                 call rax
///   +14  cc                    int3
/// ```
///
/// Execution enters at +2. If the thread was interrupted on the way into a
/// syscall, the kernel rewinds rip by two on resume to restart it; the nops
/// at +0 absorb that so the thunk runs either way (same trick the payload
/// stubs of injection tooling use).
const THUNK: [u8; 15] = [
    0x90, 0x90, 0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xd0, 0xcc,
];
const THUNK_ENTRY: u64 = 2;
const THUNK_FUNC_OFFSET: u64 = 4;
const THUNK_TRAP_RIP: u64 = 15;

struct Scratch {
    thunk: u64,
    stack_top: u64,
    data_cur: u64,
    data_end: u64,
}

pub struct PtraceSession {
    pid: Pid,
    saved_regs: user_regs_struct,
    scratch: Option<Scratch>,
    dlopen_vmaddr: Option<u64>,
    dlsym_vmaddr: Option<u64>,
}

impl PtraceSession {
    /// Seize and interrupt the target, saving its register state.
    pub fn attach(pid: Pid) -> Result<Self, SessionError> {
        ptrace::seize(pid, ptrace::Options::PTRACE_O_TRACESYSGOOD)
            .map_err(|e| SessionError::Attach(format!("ptrace::seize failed: {}", e)))?;
        ptrace::interrupt(pid)
            .map_err(|e| SessionError::Attach(format!("ptrace::interrupt failed: {}", e)))?;

        let waitstatus = wait::waitpid(pid, None)
            .map_err(|e| SessionError::Attach(format!("waitpid failed: {}", e)))?;
        if !matches!(
            waitstatus,
            WaitStatus::PtraceEvent(_, Signal::SIGTRAP, PTRACE_EVENT_STOP)
        ) {
            return Err(SessionError::Attach(format!(
                "unexpected WaitStatus after ptrace::interrupt: {:?}",
                waitstatus
            )));
        }

        let saved_regs = ptrace::getregs(pid)
            .map_err(|e| SessionError::Attach(format!("ptrace::getregs failed: {}", e)))?;
        debug!("attached to {}, rip {:#x}", pid, saved_regs.rip);

        Ok(PtraceSession {
            pid,
            saved_regs,
            scratch: None,
            dlopen_vmaddr: None,
            dlsym_vmaddr: None,
        })
    }

    /// Inject one syscall at the interrupted rip: overwrite the current
    /// instruction word with `syscall`, single-step it, read back rax and
    /// restore the original word.
    fn remote_syscall(&mut self, nr: i64, args: [u64; 6]) -> Result<u64, SessionError> {
        let pid = self.pid;
        let addr = self.saved_regs.rip as AddressType;

        let saved_instr = ptrace::read(pid, addr)
            .map_err(|e| SessionError::Memory(format!("ptrace::read failed: {}", e)))?;
        unsafe {
            ptrace::write(pid, addr, 0x050F as *mut c_void)
                .map_err(|e| SessionError::Memory(format!("ptrace::write failed: {}", e)))?;
        }

        let mut regs = self.saved_regs;
        regs.rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];

        ptrace::setregs(pid, regs)
            .map_err(|e| SessionError::Memory(format!("ptrace::setregs failed: {}", e)))?;
        ptrace::step(pid, None)
            .map_err(|e| SessionError::Memory(format!("ptrace::step failed: {}", e)))?;

        let waitstatus = wait::waitpid(pid, None)
            .map_err(|e| SessionError::Memory(format!("waitpid failed: {}", e)))?;
        if !matches!(waitstatus, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
            return Err(SessionError::Memory(format!(
                "unexpected WaitStatus after ptrace::step: {:?}",
                waitstatus
            )));
        }

        let result = ptrace::getregs(pid)
            .map_err(|e| SessionError::Memory(format!("ptrace::getregs failed: {}", e)))?
            .rax;
        unsafe {
            ptrace::write(pid, addr, saved_instr as *mut c_void)
                .map_err(|e| SessionError::Memory(format!("ptrace::write failed: {}", e)))?;
        }

        // The kernel reports errors as small negative values in rax.
        let as_err = result as i64;
        if (-4095..0).contains(&as_err) {
            return Err(SessionError::Memory(format!(
                "remote syscall {} failed with errno {}",
                nr, -as_err
            )));
        }
        Ok(result)
    }

    fn remote_mmap(&mut self, len: u64, prot: i32) -> Result<u64, SessionError> {
        let addr = self.remote_syscall(
            SYS_mmap,
            [
                0,
                len,
                prot as u64,
                (MAP_PRIVATE | MAP_ANONYMOUS) as u64,
                u64::MAX, // fd = -1
                0,
            ],
        )?;
        debug!("remote mmap of {} bytes at {:#x}", len, addr);
        Ok(addr)
    }

    fn write_bytes(&self, dest: u64, bytes: &[u8]) -> Result<(), SessionError> {
        process_vm_writev(
            self.pid,
            &[IoVec::from_slice(bytes)],
            &[RemoteIoVec {
                base: dest as usize,
                len: bytes.len(),
            }],
        )
        .map_err(|e| SessionError::Memory(format!("process_vm_writev failed: {}", e)))?;
        Ok(())
    }

    fn ensure_scratch(&mut self) -> Result<(), SessionError> {
        if self.scratch.is_some() {
            return Ok(());
        }
        let thunk = self.remote_mmap(PAGE_SIZE, PROT_READ | PROT_WRITE | PROT_EXEC)?;
        self.write_bytes(thunk, &THUNK)?;
        let stack = self.remote_mmap(STACK_SIZE, PROT_READ | PROT_WRITE)?;
        self.scratch = Some(Scratch {
            thunk,
            stack_top: stack + STACK_SIZE,
            data_cur: 0,
            data_end: 0,
        });
        Ok(())
    }

    /// Call `func` in the target with up to six integer arguments on a
    /// private stack, trapping back on the thunk's int3.
    fn remote_call(&mut self, func: u64, args: &[u64]) -> Result<u64, SessionError> {
        assert!(args.len() <= 6);
        self.ensure_scratch()?;
        let (thunk, stack_top) = {
            let s = self.scratch.as_ref().unwrap();
            (s.thunk, s.stack_top)
        };

        self.write_bytes(thunk + THUNK_FUNC_OFFSET, &func.to_le_bytes())?;

        let mut regs = self.saved_regs;
        let argregs: [&mut u64; 6] = [
            &mut regs.rdi,
            &mut regs.rsi,
            &mut regs.rdx,
            &mut regs.rcx,
            &mut regs.r8,
            &mut regs.r9,
        ];
        for (reg, arg) in argregs.into_iter().zip(args) {
            *reg = *arg;
        }
        regs.rip = thunk + THUNK_ENTRY;
        // 16-byte aligned; the thunk's call pushes the return address that
        // makes the callee see the ABI-required rsp % 16 == 8.
        regs.rsp = stack_top - 128;

        ptrace::setregs(self.pid, regs)
            .map_err(|e| SessionError::Call(format!("ptrace::setregs failed: {}", e)))?;
        ptrace::cont(self.pid, None)
            .map_err(|e| SessionError::Call(format!("ptrace::cont failed: {}", e)))?;

        let waitstatus = wait::waitpid(self.pid, None)
            .map_err(|e| SessionError::Call(format!("waitpid failed: {}", e)))?;
        if !matches!(waitstatus, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
            return Err(SessionError::Call(format!(
                "unexpected WaitStatus during remote call: {:?}",
                waitstatus
            )));
        }

        let end_regs = ptrace::getregs(self.pid)
            .map_err(|e| SessionError::Call(format!("ptrace::getregs failed: {}", e)))?;
        if end_regs.rip != thunk + THUNK_TRAP_RIP {
            return Err(SessionError::Call(format!(
                "target stopped at {:#x}, expected thunk trap at {:#x}",
                end_regs.rip,
                thunk + THUNK_TRAP_RIP
            )));
        }
        Ok(end_regs.rax)
    }

    fn marshal_cstr(&mut self, s: &str) -> Result<u64, SessionError> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        let ptr = self.alloc(bytes.len())?;
        self.write(ptr, &bytes)?;
        Ok(ptr.0)
    }

    fn dlopen_vmaddr(&mut self) -> Result<u64, SessionError> {
        if let Some(addr) = self.dlopen_vmaddr {
            return Ok(addr);
        }
        let addr = find_libc_export(self.pid, DLOPEN_NAMES)
            .map_err(|e| SessionError::ModuleLoad(format!("{:#}", e)))?;
        self.dlopen_vmaddr = Some(addr);
        Ok(addr)
    }

    fn dlsym_vmaddr(&mut self) -> Result<u64, SessionError> {
        if let Some(addr) = self.dlsym_vmaddr {
            return Ok(addr);
        }
        let addr = find_libc_export(self.pid, DLSYM_NAMES)
            .map_err(|e| SessionError::Call(format!("{:#}", e)))?;
        self.dlsym_vmaddr = Some(addr);
        Ok(addr)
    }
}

impl TargetSession for PtraceSession {
    fn string_width(&self) -> StringWidth {
        StringWidth::Narrow
    }

    fn alloc(&mut self, len: usize) -> Result<RemotePtr, SessionError> {
        self.ensure_scratch()?;
        let need = len as u64;
        let scratch = self.scratch.as_ref().unwrap();
        if scratch.data_cur + need > scratch.data_end {
            let size = need.max(PAGE_SIZE) + (PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let page = self.remote_mmap(size, PROT_READ | PROT_WRITE)?;
            let scratch = self.scratch.as_mut().unwrap();
            scratch.data_cur = page;
            scratch.data_end = page + size;
        }
        let scratch = self.scratch.as_mut().unwrap();
        let ptr = scratch.data_cur;
        // Keep allocations 8-byte aligned.
        scratch.data_cur += (need + 7) & !7;
        Ok(RemotePtr(ptr))
    }

    fn write(&mut self, dest: RemotePtr, bytes: &[u8]) -> Result<(), SessionError> {
        self.write_bytes(dest.0, bytes)
    }

    fn load_module(&mut self, path: &Path) -> Result<ModuleHandle, SessionError> {
        let dlopen = self.dlopen_vmaddr()?;
        let path_str = path
            .to_str()
            .ok_or_else(|| SessionError::ModuleLoad(format!("path {:?} not UTF-8", path)))?;
        let remote_path = self.marshal_cstr(path_str)?;
        let handle = self
            .remote_call(dlopen, &[remote_path, RTLD_NOW as u64])
            .map_err(|e| SessionError::ModuleLoad(e.to_string()))?;
        if handle == 0 {
            return Err(SessionError::ModuleLoad(format!(
                "dlopen({}) returned NULL in target",
                path_str
            )));
        }
        debug!("module {} loaded, handle {:#x}", path_str, handle);
        Ok(ModuleHandle(handle))
    }

    fn resolve_export(
        &mut self,
        module: ModuleHandle,
        name: &str,
    ) -> Result<RemotePtr, SessionError> {
        let dlsym = self.dlsym_vmaddr()?;
        let remote_name = self.marshal_cstr(name)?;
        let addr = self.remote_call(dlsym, &[module.0, remote_name])?;
        if addr == 0 {
            return Err(SessionError::SymbolNotFound(name.to_string()));
        }
        Ok(RemotePtr(addr))
    }

    fn call4(&mut self, func: RemotePtr, args: [RemotePtr; 4]) -> Result<u32, SessionError> {
        let raw: Vec<u64> = args.iter().map(|a| a.0).collect();
        let ret = self.remote_call(func.0, &raw)?;
        Ok(ret as u32)
    }
}

impl Drop for PtraceSession {
    fn drop(&mut self) {
        if let Err(e) = ptrace::setregs(self.pid, self.saved_regs) {
            warn!("Failed to restore target registers: {}", e);
        }
        if let Err(e) = ptrace::detach(self.pid, None) {
            warn!("Failed to detach from target: {}", e);
        }
    }
}
