//! The `_xHHHH_` convention used by Excel for characters that XML 1.0 cannot
//! carry in text (most C0 controls). A literal `_` that would otherwise start
//! such a sequence is itself written as `_x005F_`.

use std::fmt::Write;

fn is_xml_illegal(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{B}' | '\u{C}' | '\u{E}'..='\u{1F}' | '\u{FFFE}' | '\u{FFFF}')
}

/// `true` if `s` starts with `_xHHHH_`.
fn starts_escape(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 7
        && b[0] == b'_'
        && b[1] == b'x'
        && b[2..6].iter().all(u8::is_ascii_hexdigit)
        && b[6] == b'_'
}

pub(crate) fn needs_encoding(s: &str) -> bool {
    s.chars().any(is_xml_illegal) || s.match_indices('_').any(|(i, _)| starts_escape(&s[i..]))
}

pub(crate) fn encode_excel_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for (i, c) in s.char_indices() {
        if is_xml_illegal(c) || (c == '_' && starts_escape(&s[i..])) {
            let _ = write!(out, "_x{:04X}_", c as u32);
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn decode_excel_escapes(s: &str) -> String {
    if !s.contains("_x") {
        return s.to_owned();
    }
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        let rest = &s[i..];
        if starts_escape(rest) {
            if let Some(c) = u32::from_str_radix(&rest[2..6], 16)
                .ok()
                .and_then(char::from_u32)
            {
                out.push(c);
                i += 7;
                continue;
            }
        }
        let Some(c) = rest.chars().next() else { break };
        out.push(c);
        i += c.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_and_literal_escapes() {
        assert_eq!(encode_excel_escapes("a\u{1}b"), "a_x0001_b");
        assert_eq!(encode_excel_escapes("x_x0041_y"), "x_x005F_x0041_y");
        assert_eq!(encode_excel_escapes("tab\tnl\n_x_"), "tab\tnl\n_x_");
        assert!(!needs_encoding("plain_text"));
        assert!(needs_encoding("\u{1F}"));

        for s in ["a\u{1}b", "x_x0041_y", "_x000D_", "é\u{B}ü", "_x12"] {
            assert_eq!(decode_excel_escapes(&encode_excel_escapes(s)), s);
        }
        assert_eq!(decode_excel_escapes("line1_x000d__x000a_line2"), "line1\r\nline2");
        assert_eq!(decode_excel_escapes("under_x005f_score"), "under_score");
        assert_eq!(decode_excel_escapes("_xZZZZ_"), "_xZZZZ_");
    }
}
