//! Conservative x86-64 instruction-length decoding for function prologues.
//!
//! Interception steals whole instructions from the entry of the target, so
//! the stolen bytes must be relocatable to the trampoline page unchanged.
//! Only position-independent instruction forms commonly found in prologues
//! are accepted; anything RIP-relative, any relative branch, and anything
//! this decoder does not recognize makes the method uninterceptable.
//!
//! Functions shorter than the patch window are common (a compiled identity
//! function is three bytes); their `ret` is position-independent too, so
//! the whole body relocates and no jump back is needed.

use crate::intercept::InterceptError;

/// Instructions stolen from the entry of a function.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StolenPrologue {
    pub(crate) len: usize,
    /// The stolen bytes end in `ret`: the entire body fits inside the
    /// patch window and relocates wholesale.
    pub(crate) whole_body: bool,
}

/// Steal whole instructions covering at least `min` bytes from the start
/// of `code`, or the entire function if a `ret` terminates it earlier.
pub(crate) fn steal_prologue(code: &[u8], min: usize) -> Result<StolenPrologue, InterceptError> {
    let mut len = 0;
    while len < min {
        if code[len] == 0xc3 {
            return Ok(StolenPrologue {
                len: len + 1,
                whole_body: true,
            });
        }
        len += instruction_len(&code[len..])?;
    }
    Ok(StolenPrologue {
        len,
        whole_body: false,
    })
}

fn unsupported(code: &[u8]) -> InterceptError {
    InterceptError::Unsupported(format!(
        "unrecognized instruction bytes {:02x?}",
        &code[..code.len().min(4)]
    ))
}

/// Length of the single instruction at the start of `code`, or an error if
/// it cannot be relocated.
pub(crate) fn instruction_len(code: &[u8]) -> Result<usize, InterceptError> {
    // endbr64, emitted first by CET-enabled compilers.
    if code.starts_with(&[0xf3, 0x0f, 0x1e, 0xfa]) {
        return Ok(4);
    }

    let mut i = 0;
    let mut opsize16 = false;
    loop {
        match code.get(i) {
            Some(0x66) => opsize16 = true,
            Some(b) if (0x40..=0x4f).contains(b) => {}
            Some(_) => break,
            None => return Err(InterceptError::Unsupported("truncated prologue".into())),
        }
        i += 1;
    }
    let rex_w = code[..i].iter().any(|b| b & 0xf8 == 0x48);
    let opcode = code[i];
    i += 1;

    match opcode {
        // push/pop r64, single-byte nop
        0x50..=0x5f | 0x90 => Ok(i),
        // mov r, imm
        0xb8..=0xbf => {
            let imm = if rex_w {
                8
            } else if opsize16 {
                2
            } else {
                4
            };
            Ok(i + imm)
        }
        // modrm forms without immediate: add/sub/cmp/test/xchg/mov/lea/movsxd
        0x01 | 0x03 | 0x29 | 0x2b | 0x31 | 0x33 | 0x39 | 0x3b | 0x63 | 0x84 | 0x85 | 0x87
        | 0x88 | 0x89 | 0x8a | 0x8b | 0x8d => modrm_len(&code[i..]).map(|m| i + m),
        // group-1 with imm8 / imm32
        0x83 => modrm_len(&code[i..]).map(|m| i + m + 1),
        0x81 => modrm_len(&code[i..]).map(|m| i + m + if opsize16 { 2 } else { 4 }),
        // mov r/m, imm
        0xc6 => modrm_len(&code[i..]).map(|m| i + m + 1),
        0xc7 => modrm_len(&code[i..]).map(|m| i + m + if opsize16 { 2 } else { 4 }),
        // two-byte opcodes
        0x0f => match code.get(i) {
            // multi-byte nop
            Some(0x1f) => modrm_len(&code[i + 1..]).map(|m| i + 1 + m),
            // movzx/movsx/imul
            Some(0xb6) | Some(0xb7) | Some(0xbe) | Some(0xbf) | Some(0xaf) => {
                modrm_len(&code[i + 1..]).map(|m| i + 1 + m)
            }
            _ => Err(unsupported(code)),
        },
        // Relative branches, returns and everything else cannot be stolen.
        _ => Err(unsupported(code)),
    }
}

/// Length of a modrm byte plus its sib/displacement, rejecting RIP-relative
/// addressing.
fn modrm_len(code: &[u8]) -> Result<usize, InterceptError> {
    let modrm = *code
        .first()
        .ok_or_else(|| InterceptError::Unsupported("truncated prologue".into()))?;
    let mode = modrm >> 6;
    let rm = modrm & 0x07;

    if mode == 3 {
        return Ok(1);
    }
    if mode == 0 && rm == 5 {
        return Err(InterceptError::Unsupported(
            "RIP-relative operand in prologue".into(),
        ));
    }

    let mut len = 1;
    let mut disp = match mode {
        1 => 1,
        2 => 4,
        _ => 0,
    };
    if rm == 4 {
        let sib = *code
            .get(1)
            .ok_or_else(|| InterceptError::Unsupported("truncated prologue".into()))?;
        len += 1;
        if mode == 0 && sib & 0x07 == 5 {
            disp = 4;
        }
    }
    Ok(len + disp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_frame_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        let code = [0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x20, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(instruction_len(&code).unwrap(), 1);
        assert_eq!(instruction_len(&code[1..]).unwrap(), 3);
        assert_eq!(instruction_len(&code[4..]).unwrap(), 4);
        let stolen = steal_prologue(&code, 12).unwrap();
        assert_eq!(stolen.len, 12);
        assert!(!stolen.whole_body);
    }

    #[test]
    fn endbr_and_spills() {
        // endbr64; push r15; push r14; mov qword [rsp+8], rdi
        let code = [
            0xf3, 0x0f, 0x1e, 0xfa, 0x41, 0x57, 0x41, 0x56, 0x48, 0x89, 0x7c, 0x24, 0x08, 0x90,
        ];
        assert_eq!(steal_prologue(&code, 12).unwrap().len, 13);
    }

    #[test]
    fn nop_sled_steals_exactly() {
        let code = [0x90; 16];
        let stolen = steal_prologue(&code, 12).unwrap();
        assert_eq!(stolen.len, 12);
        assert!(!stolen.whole_body);
    }

    #[test]
    fn tiny_function_is_stolen_through_its_ret() {
        // mov eax, edi; ret, then int3 alignment padding
        let code = [0x89, 0xf8, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];
        let stolen = steal_prologue(&code, 12).unwrap();
        assert_eq!(stolen.len, 3);
        assert!(stolen.whole_body);
    }

    #[test]
    fn spill_reload_ret_body_is_stolen_whole() {
        // mov [rsp-4], edi; mov eax, [rsp-4]; ret - unoptimized identity
        let code = [
            0x89, 0x7c, 0x24, 0xfc, 0x8b, 0x44, 0x24, 0xfc, 0xc3, 0xcc, 0xcc, 0xcc,
        ];
        let stolen = steal_prologue(&code, 12).unwrap();
        assert_eq!(stolen.len, 9);
        assert!(stolen.whole_body);
    }

    #[test]
    fn rip_relative_is_rejected() {
        // mov rax, [rip+0x1234]
        let code = [0x48, 0x8b, 0x05, 0x34, 0x12, 0x00, 0x00];
        assert!(matches!(
            instruction_len(&code),
            Err(InterceptError::Unsupported(_))
        ));
    }

    #[test]
    fn relative_branch_is_rejected() {
        let code = [0xe9, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            instruction_len(&code),
            Err(InterceptError::Unsupported(_))
        ));
    }

    #[test]
    fn unrecognized_body_before_ret_is_rejected() {
        // int 0x80 is never stolen, even with a ret behind it
        let code = [0xcd, 0x80, 0xc3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
        assert!(matches!(
            steal_prologue(&code, 12),
            Err(InterceptError::Unsupported(_))
        ));
    }

    #[test]
    fn mov_imm64_length() {
        // mov rax, imm64
        let mut code = vec![0x48, 0xb8];
        code.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(instruction_len(&code).unwrap(), 10);
    }
}
