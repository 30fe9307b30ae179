//! Wire format for typeset documents.
//!
//! A document serialises to a string in which constructs (fractions,
//! matrices, scripts, ...) are delimited by the private-use markers
//! [`OPEN`], [`CLOSE`], and [`CONSTRUCT`]. Each construct is keyed by a
//! single ASCII char after the `CONSTRUCT` marker; matrices and cases embed
//! their dimensions in the key. Everything between markers is plain text.

/// Opens the first argument of a construct.
pub const OPEN: char = '\u{E000}';
/// Closes one construct argument.
pub const CLOSE: char = '\u{E001}';
/// Announces a construct, or escapes a literal marker char.
pub const CONSTRUCT: char = '\u{E002}';

pub const KEY_FRACTION: char = 'f';
pub const KEY_BINOMIAL: char = 'b';
pub const KEY_SUPERSCRIPT: char = '^';
pub const KEY_SUBSCRIPT: char = '_';
pub const KEY_DUALSCRIPT: char = 'd';
pub const KEY_SQRT: char = 'q';
pub const KEY_NROOT: char = 'r';
pub const KEY_LIMIT: char = 'l';
pub const KEY_INTEGRAL: char = 'I';
pub const KEY_DEFINITE_INTEGRAL: char = 'i';
pub const KEY_BIG_SUM0: char = 'S';
pub const KEY_BIG_SUM: char = 's';
pub const KEY_BIG_PROD0: char = 'P';
pub const KEY_BIG_PROD: char = 'p';
pub const KEY_ACCENT_HAT: char = 'h';
pub const KEY_ACCENT_BAR: char = 'a';
pub const KEY_MATRIX: char = '[';
pub const KEY_CASES: char = '{';
pub const KEY_SETTINGS: char = 'g';

/// Argument count of a fixed-arity construct key. Matrix, cases, and
/// settings have data-dependent shapes and are handled separately.
pub fn construct_arity(key: char) -> Option<usize> {
    match key {
        KEY_SUPERSCRIPT | KEY_SUBSCRIPT | KEY_SQRT | KEY_ACCENT_HAT | KEY_ACCENT_BAR => Some(1),
        KEY_FRACTION | KEY_BINOMIAL | KEY_DUALSCRIPT | KEY_NROOT | KEY_LIMIT
        | KEY_DEFINITE_INTEGRAL | KEY_BIG_SUM | KEY_BIG_PROD => Some(2),
        KEY_INTEGRAL | KEY_BIG_SUM0 | KEY_BIG_PROD0 => Some(0),
        _ => None,
    }
}

fn parse_dim(chars: &mut std::iter::Peekable<std::str::Chars>, terminator: char) -> Option<u16> {
    let first = chars.next()?;
    if !first.is_ascii_digit() {
        return None;
    }
    let second = chars.next()?;
    if second == terminator {
        return Some(first as u16 - '0' as u16);
    }
    if !second.is_ascii_digit() || chars.next()? != terminator {
        return None;
    }
    Some((first as u16 - '0' as u16) * 10 + (second as u16 - '0' as u16))
}

/// Parse `[RxC]` following a matrix key. Returns (rows, cols).
pub fn parse_matrix_dims(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<(u16, u16)> {
    let rows = parse_dim(chars, 'x')?;
    let cols = parse_dim(chars, ']')?;
    if rows == 0 || cols == 0 {
        return None;
    }
    Some((rows, cols))
}

/// Parse the row count following a cases key, up to the construct's `OPEN`.
pub fn parse_cases_rows(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<u16> {
    let rows = parse_dim(chars, OPEN)?;
    if rows == 0 {
        return None;
    }
    Some(rows)
}

/// Single linear pass over a serial string, tracking construct depth.
/// Each construct entry adds its argument count; each `CLOSE` subtracts one.
pub fn is_valid_serial(src: &str) -> bool {
    let mut depth: usize = 0;
    let mut chars = src.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            CONSTRUCT => {
                let key = match chars.next() {
                    Some(k) => k,
                    None => return false,
                };
                match key {
                    CONSTRUCT | OPEN | CLOSE => {} // escaped literal marker
                    KEY_MATRIX => {
                        let (rows, cols) = match parse_matrix_dims(&mut chars) {
                            Some(dims) => dims,
                            None => return false,
                        };
                        if chars.next() != Some(OPEN) {
                            return false;
                        }
                        depth += rows as usize * cols as usize;
                    }
                    KEY_CASES => {
                        let rows = match parse_cases_rows(&mut chars) {
                            Some(rows) => rows,
                            None => return false,
                        };
                        depth += 2 * rows as usize;
                    }
                    KEY_SETTINGS => {
                        if !skip_settings(&mut chars) {
                            return false;
                        }
                    }
                    _ => match construct_arity(key) {
                        Some(0) => {}
                        Some(n) => {
                            if chars.next() != Some(OPEN) {
                                return false;
                            }
                            depth += n;
                        }
                        None => return false,
                    },
                }
            }
            CLOSE => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                // The re-open of a subsequent argument is optional on the wire
                if chars.peek() == Some(&OPEN) {
                    chars.next();
                }
            }
            OPEN => return false,
            '\n' if depth != 0 => return false,
            _ => {}
        }
    }

    depth == 0
}

fn skip_settings(chars: &mut std::iter::Peekable<std::str::Chars>) -> bool {
    let mut subsequent = false;
    loop {
        match chars.peek() {
            Some(&CLOSE) => {
                chars.next();
                return true;
            }
            Some(_) => {}
            None => return false,
        }
        if subsequent {
            if chars.next() != Some(',') {
                return false;
            }
        }
        // key up to '='
        loop {
            match chars.next() {
                Some('=') => break,
                Some(ch) if ch != CLOSE && ch != ',' && ch != '\n' => {}
                _ => return false,
            }
        }
        // value up to ',' or CLOSE
        loop {
            match chars.peek() {
                Some(&CLOSE) | Some(&',') => break,
                Some(&'\n') | None => return false,
                Some(_) => {
                    chars.next();
                }
            }
        }
        subsequent = true;
    }
}

/// Escape the marker chars so raw text can be embedded into a construct.
pub fn typeset_escape(out: &mut String, input: &str) {
    for ch in input.chars() {
        if ch == CONSTRUCT || ch == OPEN || ch == CLOSE {
            out.push(CONSTRUCT);
        }
        out.push(ch);
    }
}

// Builders, used by the interpreter's matrix printer and by tests.

pub fn unary(key: char, arg: &str) -> String {
    debug_assert_eq!(construct_arity(key), Some(1));
    format!("{CONSTRUCT}{key}{OPEN}{arg}{CLOSE}")
}

pub fn binary(key: char, first: &str, second: &str) -> String {
    debug_assert_eq!(construct_arity(key), Some(2));
    format!("{CONSTRUCT}{key}{OPEN}{first}{CLOSE}{second}{CLOSE}")
}

pub fn matrix(rows: u16, cols: u16, elements: &[&str]) -> String {
    assert_eq!(elements.len(), rows as usize * cols as usize);
    let mut out = format!("{CONSTRUCT}[{rows}x{cols}]{OPEN}");
    for (i, elem) in elements.iter().enumerate() {
        if i > 0 {
            out.push(OPEN);
        }
        out.push_str(elem);
        out.push(CLOSE);
    }
    out
}

pub fn cases(pairs: &[(&str, &str)]) -> String {
    assert!(!pairs.is_empty());
    let mut out = format!("{CONSTRUCT}{}{}{OPEN}", KEY_CASES, pairs.len());
    let mut first = true;
    for (value, condition) in pairs {
        if !first {
            out.push(OPEN);
        }
        first = false;
        out.push_str(value);
        out.push(CLOSE);
        out.push(OPEN);
        out.push_str(condition);
        out.push(CLOSE);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_valid() {
        assert!(is_valid_serial("x + y = 3\nprint(x)"));
    }

    #[test]
    fn fraction_is_valid() {
        assert!(is_valid_serial(&binary(KEY_FRACTION, "1", "2")));
    }

    #[test]
    fn matrix_is_valid() {
        assert!(is_valid_serial(&matrix(2, 2, &["1", "2", "3", "4"])));
    }

    #[test]
    fn unmatched_close_is_invalid() {
        assert!(!is_valid_serial(&format!("x{CLOSE}")));
    }

    #[test]
    fn bare_open_is_invalid() {
        assert!(!is_valid_serial(&format!("x{OPEN}")));
    }

    #[test]
    fn missing_close_is_invalid() {
        assert!(!is_valid_serial(&format!("{CONSTRUCT}f{OPEN}1{CLOSE}2")));
    }

    #[test]
    fn newline_inside_construct_is_invalid() {
        assert!(!is_valid_serial(&format!("{CONSTRUCT}f{OPEN}1\n{CLOSE}2{CLOSE}")));
    }

    #[test]
    fn unknown_key_is_invalid() {
        assert!(!is_valid_serial(&format!("{CONSTRUCT}Z{OPEN}1{CLOSE}")));
    }

    #[test]
    fn zero_sized_matrix_is_invalid() {
        assert!(!is_valid_serial(&format!("{CONSTRUCT}[0x2]{OPEN}1{CLOSE}2{CLOSE}")));
    }

    #[test]
    fn corrupting_a_dimension_digit_is_invalid() {
        let good = matrix(2, 2, &["1", "2", "3", "4"]);
        let bad = good.replacen("2x2", "3x2", 1);
        assert!(is_valid_serial(&good));
        assert!(!is_valid_serial(&bad));
    }

    #[test]
    fn deleting_any_marker_invalidates() {
        let good = binary(KEY_FRACTION, "1", "x");
        assert!(is_valid_serial(&good));
        for (i, ch) in good.char_indices() {
            if ch == OPEN || ch == CLOSE || ch == CONSTRUCT {
                let mut bad = String::from(&good[..i]);
                bad.push_str(&good[i + ch.len_utf8()..]);
                assert!(!is_valid_serial(&bad), "marker deletion at {i} stayed valid");
            }
        }
    }

    #[test]
    fn escaped_markers_pass_through() {
        let mut out = String::new();
        typeset_escape(&mut out, &format!("a{OPEN}b"));
        assert!(is_valid_serial(&out));
        assert_eq!(out.chars().count(), 4);
    }

    #[test]
    fn settings_construct_is_valid() {
        assert!(is_valid_serial(&format!("{CONSTRUCT}g shadowing=error{CLOSE}")));
        assert!(is_valid_serial(&format!(
            "{CONSTRUCT}gshadowing=warn,unused-var=none{CLOSE}"
        )));
    }

    #[test]
    fn nullary_integral_needs_no_arguments() {
        assert!(is_valid_serial(&format!("{CONSTRUCT}I")));
    }

    #[test]
    fn cases_depth_counts_both_columns() {
        let serial = cases(&[("1", "x > 0"), ("0", "x < 0")]);
        assert!(is_valid_serial(&serial));
    }
}
