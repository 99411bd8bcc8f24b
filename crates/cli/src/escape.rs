//! Rendering raw keys and values for a terminal.

use std::fmt::Write;

/// Printable ASCII passes through; everything else becomes `\xNN`, and a
/// backslash is doubled so the output stays unambiguous
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(byte)),
            _ => {
                let _ = write!(out, "\\x{byte:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape(b"plain text"), "plain text");
        assert_eq!(escape(b"tab\there"), "tab\\x09here");
        assert_eq!(escape(&[0, 0xff]), "\\x00\\xFF");
        assert_eq!(escape(b"a\\b"), "a\\\\b");
    }
}
