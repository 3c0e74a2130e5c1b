//! Caret-annotated diagnostic rendering (spec §7). Reproduces the byte
//! offset -> column mapping from
//! `examples/original_source/parser-and-compiler/RestSQLPreparer.cpp`:
//! a continuation byte only advances the caret if it is NOT part of a
//! valid multi-byte sequence already accounted for by its lead byte, so
//! a caret lands under the first byte of each scalar value rather than
//! once per raw byte.

use crate::errors::{PrepareError, Span};

/// True if `buf[pos]` is a UTF-8 continuation byte (`10xxxxxx`) that is
/// part of a multi-byte sequence whose lead byte starts at or before
/// `pos` within the last 3 bytes — i.e. it does NOT get its own caret
/// column. Ported from the original's `has_width()`, walking back at
/// most 3 bytes since that's the longest possible continuation run.
fn has_width(buf: &[u8], pos: usize) -> bool {
    let b = buf[pos];
    if b & 0xC0 != 0x80 {
        return true;
    }
    for back in 1..=3 {
        if back > pos {
            break;
        }
        let lead_pos = pos - back;
        let lead = buf[lead_pos];
        let seq_len = if lead & 0xE0 == 0xC0 {
            2
        } else if lead & 0xF0 == 0xE0 {
            3
        } else if lead & 0xF8 == 0xF0 {
            4
        } else {
            continue;
        };
        if seq_len > back && lead_pos + seq_len > pos {
            return false;
        }
    }
    true
}

/// Renders `source` with a `>` marker line and a caret (`^`) line under
/// `span`. Mirrors the original's column-counting loop, including its
/// EOF special case: a span pointing one past the end of the buffer
/// still draws a single caret there.
fn render_source(source: &str, span: Span) -> String {
    let bytes = source.as_bytes();
    let mut out = String::new();
    out.push('>');
    out.push(' ');
    out.push_str(source);
    if !source.ends_with('\n') {
        out.push('\n');
    }

    out.push_str("> ");
    let end = (span.pos + span.len.max(1)).min(bytes.len());
    for i in 0..bytes.len() {
        if !has_width(bytes, i) {
            continue;
        }
        out.push(if i >= span.pos && i < end { '^' } else { ' ' });
    }
    if span.pos >= bytes.len() {
        out.push('^');
    }
    out.push('\n');
    out
}

/// The full human-readable diagnostic for `err` against the (restored)
/// original `source`: the error message, then a source excerpt with a
/// caret under the offending span if the error carries one.
pub fn report(source: &str, err: &PrepareError) -> String {
    let mut out = format!("error: {err}\n");
    if let Some(span) = err.span() {
        out.push_str(&render_source(source, span));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyntaxError;

    #[test]
    fn caret_lands_under_ascii_span() {
        let err = PrepareError::Syntax {
            kind: SyntaxError::UnexpectedToken {
                found: "FROM".to_string(),
            },
            span: Span::new(7, 4),
        };
        let rendered = report("select from t", &err);
        let caret_line = rendered.lines().nth(2).unwrap();
        assert_eq!(caret_line, "> ".to_string() + &" ".repeat(7) + "^^^^");
    }

    #[test]
    fn eof_span_still_draws_one_caret() {
        let err = PrepareError::Syntax {
            kind: SyntaxError::UnexpectedEof,
            span: Span::point(5),
        };
        let rendered = report("abcde", &err);
        assert!(rendered.contains('^'));
    }

    #[test]
    fn multibyte_lead_byte_gets_one_caret_not_one_per_continuation_byte() {
        // "café" - é is a 2-byte sequence at byte offset 3.
        let source = "café";
        let err = PrepareError::Syntax {
            kind: SyntaxError::UnexpectedEof,
            span: Span::new(3, 2),
        };
        let rendered = report(source, &err);
        let caret_line = rendered.lines().nth(2).unwrap();
        // one caret for the whole 2-byte scalar, not two.
        assert_eq!(caret_line.matches('^').count(), 1);
    }
}
