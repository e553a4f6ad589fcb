//! Link path encoding for claim index directories

/// Encode a link path into a single filename component.
///
/// Replaces every `/` with the literal four bytes `\x2f` and every `\`
/// with `\x5c`; all other characters pass through verbatim. `cap` bounds
/// the encoded size in bytes (one byte is reserved for a terminator, as
/// the index directory name ends up in fixed-size kernel paths); if the
/// result would not fit, the empty string is returned and the caller
/// rejects the link. The mapping is not reversible.
pub fn escape_path(src: &str, cap: usize) -> String {
    let mut out = String::new();

    for c in src.chars() {
        let needed = match c {
            '/' | '\\' => 4,
            c => c.len_utf8(),
        };
        if out.len() + needed >= cap {
            return String::new();
        }
        match c {
            '/' => out.push_str("\\x2f"),
            '\\' => out.push_str("\\x5c"),
            c => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_escape_separators() {
        assert_eq!(escape_path("/disk/by-label/ROOT", 4096), r"\x2fdisk\x2fby-label\x2fROOT");
        assert_eq!(escape_path(r"a\b", 4096), r"a\x5cb");
        assert_eq!(escape_path("plain", 4096), "plain");
    }

    #[test]
    fn test_escape_overflow() {
        assert_eq!(escape_path("/dev/null", 8), "");
        // 4 encoded bytes + terminator do not fit in 4
        assert_eq!(escape_path("/", 4), "");
        assert_eq!(escape_path("/", 5), r"\x2f");
    }

    #[test]
    fn test_escape_empty() {
        assert_eq!(escape_path("", 4096), "");
    }

    proptest! {
        #[test]
        fn escaped_form_is_a_single_component(src in "\\PC{0,64}") {
            let enc = escape_path(&src, 4096);
            prop_assert!(!enc.contains('/'));
            // every backslash starts a literal \x2f or \x5c sequence
            let bytes = enc.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'\\' {
                    prop_assert!(i + 4 <= bytes.len());
                    let seq = &enc[i..i + 4];
                    prop_assert!(seq == "\\x2f" || seq == "\\x5c");
                    i += 4;
                } else {
                    i += 1;
                }
            }
        }
    }
}
