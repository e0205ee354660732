use std::borrow::Cow;

fn is_stripped_control(b: u8) -> bool {
    b == 0x7f || (b < 0x20 && b != 0x09 && b != 0x0a && b != 0x0d)
}

/// Strip control characters and ANSI escape sequences from feed text.
///
/// Subjects, descriptions and locations come from third-party feeds and end
/// up on a display or in spoken responses, so anything that could drive a
/// terminal or confuse a text-to-speech engine is removed.
///
/// Strips:
/// - ASCII control chars: 0x00-0x08, 0x0B-0x0C, 0x0E-0x1F, 0x7F
/// - ANSI CSI sequences: `\x1b[` ... (terminal byte 0x40-0x7E)
/// - ANSI OSC sequences: `\x1b]` ... (until BEL 0x07 or ST `\x1b\\`)
/// - Bare ESC (0x1b)
///
/// Preserves tab, newline and carriage return. Returns `Cow::Borrowed`
/// when there is nothing to strip.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    let len = bytes.len();

    if !bytes.iter().any(|&b| b == 0x1b || is_stripped_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        let b = bytes[i];

        if b == 0x1b {
            if i + 1 < len && bytes[i + 1] == b'[' {
                // CSI: parameters until the final byte
                i += 2;
                while i < len {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            } else if i + 1 < len && bytes[i + 1] == b']' {
                // OSC: until BEL or ST
                i += 2;
                while i < len {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && i + 1 < len && bytes[i + 1] == b'\\' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            } else {
                i += 1;
            }
        } else if is_stripped_control(b) {
            i += 1;
        } else {
            let start = i;
            i += 1;
            while i < len && bytes[i] != 0x1b && !is_stripped_control(bytes[i]) {
                i += 1;
            }
            // Only ASCII bytes end a run, so the slice stays on char boundaries
            out.push_str(&s[start..i]);
        }
    }

    Cow::Owned(out)
}

/// Undo iCalendar TEXT escaping (`\n`, `\N`, `\,`, `\;`, `\\`).
///
/// Unknown escapes keep the escaped character.
pub fn unescape_ics_text(s: &str) -> Cow<'_, str> {
    if !s.contains('\\') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_clean_text_returns_borrowed() {
        let input = "Weekly sync: Room 4";
        assert!(matches!(strip_control_chars(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_preserves_tabs_newlines_cr() {
        assert_eq!(strip_control_chars("a\tb\nc\rd"), "a\tb\nc\rd");
    }

    #[test]
    fn test_strip_control_chars_removes_controls() {
        assert_eq!(strip_control_chars("Stand\x00up\x07"), "Standup");
        assert_eq!(strip_control_chars("del\x7fete"), "delete");
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_control_chars("\x1b[31mRed\x1b[0m meeting"), "Red meeting");
        assert_eq!(strip_control_chars("\x1b]0;title\x07Lunch"), "Lunch");
        assert_eq!(strip_control_chars("\x1b]8;;url\x1b\\Link"), "Link");
        assert_eq!(strip_control_chars("bare\x1besc"), "bareesc");
    }

    #[test]
    fn test_strip_unicode_preserved() {
        assert_eq!(strip_control_chars("Café \x01会議"), "Café 会議");
    }

    #[test]
    fn test_unescape_ics_text() {
        assert_eq!(unescape_ics_text("a\\, b\\; c"), "a, b; c");
        assert_eq!(unescape_ics_text("one\\ntwo\\Nthree"), "one\ntwo\nthree");
        assert_eq!(unescape_ics_text("back\\\\slash"), "back\\slash");
        assert_eq!(unescape_ics_text("trailing\\"), "trailing\\");
    }

    #[test]
    fn test_unescape_plain_text_borrowed() {
        assert!(matches!(unescape_ics_text("plain"), Cow::Borrowed(_)));
    }
}
