//! Marshalling of request strings into the target's address space.

use crate::session::{RemotePtr, SessionError, StringWidth, TargetSession};
use crate::InjectError;

/// Encode one string the way the target platform expects it: UTF-8 plus NUL
/// for narrow targets, UTF-16LE plus a two-byte NUL for wide ones.
pub fn encode_native(s: &str, width: StringWidth) -> Result<Vec<u8>, InjectError> {
    if s.contains('\0') {
        return Err(InjectError::Marshal(format!(
            "string {:?} contains interior NUL",
            s
        )));
    }
    let bytes = match width {
        StringWidth::Narrow => {
            let mut v = s.as_bytes().to_vec();
            v.push(0);
            v
        }
        StringWidth::Wide => {
            let mut v = Vec::with_capacity((s.len() + 1) * 2);
            for unit in s.encode_utf16() {
                v.extend_from_slice(&unit.to_le_bytes());
            }
            v.extend_from_slice(&[0, 0]);
            v
        }
    };
    Ok(bytes)
}

/// Materialize each string inside the target, returning one pointer per
/// input. A partial marshal leaves the target's scratch memory in an
/// unknown state, so the first failure aborts the whole attempt.
pub fn marshal_args<S: TargetSession + ?Sized>(
    session: &mut S,
    strings: [&str; 4],
) -> Result<[RemotePtr; 4], InjectError> {
    let width = session.string_width();
    let mut out = [RemotePtr(0); 4];
    for (slot, s) in out.iter_mut().zip(strings) {
        let bytes = encode_native(s, width)?;
        let ptr = session.alloc(bytes.len()).map_err(marshal_err)?;
        session.write(ptr, &bytes).map_err(marshal_err)?;
        *slot = ptr;
    }
    Ok(out)
}

fn marshal_err(e: SessionError) -> InjectError {
    InjectError::Marshal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_is_nul_terminated_utf8() {
        let bytes = encode_native("abc", StringWidth::Narrow).unwrap();
        assert_eq!(bytes, b"abc\0");
    }

    #[test]
    fn wide_is_utf16le_with_double_nul() {
        let bytes = encode_native("a\u{00e9}", StringWidth::Wide).unwrap();
        assert_eq!(bytes, [0x61, 0x00, 0xe9, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn wide_handles_surrogate_pairs() {
        let bytes = encode_native("\u{1f600}", StringWidth::Wide).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[4..], [0, 0]);
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(matches!(
            encode_native("a\0b", StringWidth::Narrow),
            Err(InjectError::Marshal(_))
        ));
    }
}
