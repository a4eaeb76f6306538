use chrono::Utc;

/// Find the nearest character boundary at or before the given byte index.
pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cut `text` to at most `max_bytes`, never splitting a character.
pub(crate) fn truncate(text: &str, max_bytes: usize) -> &str {
    &text[..floor_char_boundary(text, max_bytes)]
}

/// Strip ANSI escape sequences from captured terminal output.
pub(crate) fn strip_ansi(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for nc in chars.by_ref() {
                    if nc.is_ascii_alphabetic() || nc == '@' || nc == '`' {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(nc) = chars.next() {
                    if nc == '\x07' {
                        break;
                    }
                    if nc == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some('(' | ')') => {
                chars.next();
                chars.next();
            }
            Some(c) if ('0'..='~').contains(c) => {
                chars.next();
            }
            _ => {}
        }
    }
    result
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{floor_char_boundary, strip_ansi, truncate};

    #[test]
    fn strip_ansi_removes_color_and_cursor_sequences() {
        let raw = "\x1b[1;32mDo you want to proceed?\x1b[0m\x1b[2K";
        assert_eq!(strip_ansi(raw), "Do you want to proceed?");
    }

    #[test]
    fn strip_ansi_removes_osc_title() {
        let raw = "\x1b]0;claude\x07│ Bash command │";
        assert_eq!(strip_ansi(raw), "│ Bash command │");
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        let text = "héllo";
        assert_eq!(floor_char_boundary(text, 2), 1);
        assert_eq!(truncate(text, 2), "h");
        assert_eq!(truncate(text, 100), "héllo");
    }
}
