//! ANSI stripping for returned output.
//!
//! Removes CSI and OSC sequences and the common short escape intros, then
//! collapses carriage-return/backspace overstrike by replaying printable
//! characters through a virtual cursor per line. The result is what a human
//! would read off the final rendering of that text.

/// Strip escape sequences and collapse overstrike from `input`.
pub fn strip_ansi(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut line: Vec<char> = Vec::new();
    let mut col: usize = 0;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => consume_escape(&mut chars),
            '\n' => {
                out.push(line.iter().collect());
                line.clear();
                col = 0;
            }
            '\r' => col = 0,
            '\x08' => col = col.saturating_sub(1),
            '\t' => {
                put(&mut line, &mut col, ' ');
            }
            c if c.is_control() => {}
            c => {
                put(&mut line, &mut col, c);
            }
        }
    }
    if !line.is_empty() {
        out.push(line.iter().collect());
    }
    out.join("\n")
        + if input.ends_with('\n') && !out.is_empty() {
            "\n"
        } else {
            ""
        }
}

fn put(line: &mut Vec<char>, col: &mut usize, c: char) {
    while line.len() < *col {
        line.push(' ');
    }
    if *col < line.len() {
        line[*col] = c;
    } else {
        line.push(c);
    }
    *col += 1;
}

fn consume_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    match chars.peek() {
        // CSI: parameters and intermediates, then one final byte in @..~.
        Some('[') => {
            chars.next();
            for c in chars.by_ref() {
                if ('\u{40}'..='\u{7e}').contains(&c) {
                    break;
                }
            }
        }
        // OSC: runs to BEL or ST (ESC \).
        Some(']') => {
            chars.next();
            let mut saw_esc = false;
            for c in chars.by_ref() {
                match c {
                    '\x07' => break,
                    '\x1b' => saw_esc = true,
                    '\\' if saw_esc => break,
                    _ => saw_esc = false,
                }
            }
        }
        // Charset designation and keypad modes carry one more byte.
        Some('(' | ')' | '#') => {
            chars.next();
            chars.next();
        }
        Some('=' | '>' | '7' | '8') => {
            chars.next();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(strip_ansi("hello world\n"), "hello world\n");
    }

    #[test]
    fn color_codes_are_removed() {
        assert_eq!(strip_ansi("\x1b[1;32mgreen\x1b[0m text"), "green text");
    }

    #[test]
    fn bracketed_paste_and_private_modes_are_removed() {
        assert_eq!(strip_ansi("\x1b[?2004hcmd\x1b[?2004l"), "cmd");
    }

    #[test]
    fn osc_title_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b]0;window title\x07after"), "after");
        assert_eq!(strip_ansi("\x1b]0;title\x1b\\after"), "after");
    }

    #[test]
    fn carriage_return_overstrikes_the_line() {
        // A progress meter rewriting itself ends up as its final frame.
        assert_eq!(strip_ansi("10%\r20%\r100%"), "100%");
    }

    #[test]
    fn carriage_return_keeps_longer_tail() {
        assert_eq!(strip_ansi("abcdef\rXY"), "XYcdef");
    }

    #[test]
    fn backspace_moves_the_cursor_left() {
        assert_eq!(strip_ansi("abc\x08X"), "abX");
    }

    #[test]
    fn tab_becomes_a_single_space() {
        assert_eq!(strip_ansi("a\tb"), "a b");
    }

    #[test]
    fn crlf_line_endings_survive_as_newlines() {
        assert_eq!(strip_ansi("one\r\ntwo\r\n"), "one\ntwo\n");
    }

    #[test]
    fn charset_designation_is_removed() {
        assert_eq!(strip_ansi("\x1b(Bascii"), "ascii");
    }

    #[test]
    fn cursor_movement_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b[2J\x1b[Hfresh"), "fresh");
    }
}
