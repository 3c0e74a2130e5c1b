//! Lexer and recursive-descent parser for the restricted SQL dialect
//! (spec §6.2). Produces a pure AST (`SelectStatement`) with no side
//! effects on an `AggCompiler` — per Design Notes §9, lowering AST into
//! DAG calls is a dedicated pass (`Prepare::load`, in `prepare.rs`), so
//! the parser stays independently testable.
//!
//! Lexing is a hand-rolled byte-level scan (spec §7's lexical error
//! kinds — illegal UTF-8 lead bytes, overlong encodings, surrogate code
//! points, non-BMP identifiers — need access to raw bytes, which is
//! moot once `nom` is handed an already-valid `&str`); the keyword/
//! identifier/operator grammar above the byte scan uses plain
//! `nom`-style recursive descent over the resulting token stream. This
//! mirrors `RestSQLPreparer`'s flex+bison split
//! (`examples/original_source/parser-and-compiler/RestSQLPreparer.cpp`)
//! without carrying over its generated-parser machinery.
//!
//! Quoted identifiers use MySQL-style doubled-backtick escaping
//! (`` `a``b` `` names a column literally called `` a`b ``), scanned
//! destructively in place exactly like the original's token decoding: a
//! duplicated backtick is nulled out and the overwrite is recorded in an
//! `UndoLog` so a failed parse can still recover the pristine original
//! bytes for the error reporter (spec §7 "Source restoration").

use nom::bytes::complete::take_while1;
use nom::character::complete::multispace0;

use crate::errors::{LexError, PrepareError, Span, SyntaxError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFn {
    Count,
    Sum,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AstOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AstExpr {
    Column(String),
    Binary(AstOp, Box<AstExpr>, Box<AstExpr>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    Column(String),
    /// `arg` is `None` only for `COUNT(*)`.
    Aggregate { func: AggFn, arg: Option<AstExpr> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SelectStatement {
    pub outputs: Vec<Output>,
    pub table: String,
    pub groupby_columns: Vec<String>,
}

/// Byte-position writes the lexer made while collapsing doubled-backtick
/// escapes, in the order they happened. A simplified, single-byte
/// specialisation of the original's general `(dest, src, len)` copy
/// triples (spec §7): our only destructive edit ever overwrites one
/// byte with a `NUL` placeholder, so "undo" is just "put the original
/// byte back", replayed in reverse order.
#[derive(Default, Clone, Debug)]
struct UndoLog {
    writes: Vec<(usize, u8)>,
}

impl UndoLog {
    fn record(&mut self, pos: usize, original_byte: u8) {
        self.writes.push((pos, original_byte));
    }

    fn replay(&self, buf: &mut [u8]) {
        for &(pos, orig) in self.writes.iter().rev() {
            buf[pos] = orig;
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Select,
    From,
    Group,
    By,
    Count,
    Sum,
    Min,
    Max,
    Ident(String),
    Star,
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    Mul,
    Div,
    Rem,
    Semi,
}

/// Decodes one UTF-8 scalar value starting at `buf[pos]`, classifying
/// every malformed-encoding case spec §7 names.
fn decode_char(buf: &[u8], pos: usize) -> Result<(char, usize), LexError> {
    let b0 = buf[pos];
    if b0 < 0x80 {
        return Ok((b0 as char, 1));
    }
    let (len, min_cp, lead_bits) = if b0 & 0xE0 == 0xC0 {
        (2, 0x80u32, 0x1Fu32)
    } else if b0 & 0xF0 == 0xE0 {
        (3, 0x800, 0x0F)
    } else if b0 & 0xF8 == 0xF0 {
        (4, 0x10000, 0x07)
    } else {
        return Err(LexError::IllegalByte);
    };
    if pos + len > buf.len() {
        return Err(LexError::InvalidUtf8);
    }
    let mut cp = b0 as u32 & lead_bits;
    for b in &buf[pos + 1..pos + len] {
        if b & 0xC0 != 0x80 {
            return Err(LexError::InvalidUtf8);
        }
        cp = (cp << 6) | (*b as u32 & 0x3F);
    }
    if cp < min_cp {
        return Err(LexError::OverlongEncoding);
    }
    if (0xD800..=0xDFFF).contains(&cp) {
        return Err(LexError::SurrogateCodePoint);
    }
    if cp > 0x10FFFF {
        return Err(LexError::CodePointTooLarge);
    }
    let ch = char::from_u32(cp).ok_or(LexError::InvalidUtf8)?;
    Ok((ch, len))
}

/// Decodes `bytes`, skipping `NUL` placeholders left by escape
/// collapsing (see `UndoLog`), into an owned `String`.
fn decode_filtered(bytes: &[u8]) -> Result<String, LexError> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0 {
            i += 1;
            continue;
        }
        let (ch, len) = decode_char(bytes, i)?;
        out.push(ch);
        i += len;
    }
    Ok(out)
}

struct Lexer<'a> {
    buf: &'a mut [u8],
    pos: usize,
    undo: UndoLog,
}

impl<'a> Lexer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Lexer {
            buf,
            pos: 0,
            undo: UndoLog::default(),
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        let rest = &self.buf[self.pos..];
        if let Ok((tail, _)) = multispace0::<_, nom::error::Error<&[u8]>>(rest) {
            self.pos += rest.len() - tail.len();
        }
    }

    fn tokenize(&mut self) -> Result<Vec<(Tok, Span)>, PrepareError> {
        let mut toks = Vec::new();
        loop {
            self.skip_ws();
            let Some(b) = self.peek_byte() else {
                break;
            };
            let start = self.pos;
            let tok = match b {
                b',' => {
                    self.pos += 1;
                    Tok::Comma
                }
                b'(' => {
                    self.pos += 1;
                    Tok::LParen
                }
                b')' => {
                    self.pos += 1;
                    Tok::RParen
                }
                b'*' => {
                    self.pos += 1;
                    Tok::Star
                }
                b'+' => {
                    self.pos += 1;
                    Tok::Plus
                }
                b'-' => {
                    self.pos += 1;
                    Tok::Minus
                }
                b'/' => {
                    self.pos += 1;
                    Tok::Div
                }
                b'%' => {
                    self.pos += 1;
                    Tok::Rem
                }
                b';' => {
                    self.pos += 1;
                    Tok::Semi
                }
                b'`' => self.lex_quoted_ident()?,
                0 => {
                    return Err(PrepareError::Lex {
                        kind: LexError::UnexpectedNul,
                        span: Span::point(self.pos),
                    })
                }
                b if b.is_ascii_alphabetic() || b == b'_' => self.lex_word(),
                0x80..=0xFF => self.lex_unicode_ident()?,
                _ => {
                    return Err(PrepareError::Lex {
                        kind: LexError::IllegalToken,
                        span: Span::point(self.pos),
                    })
                }
            };
            toks.push((tok, Span::new(start, self.pos - start)));
        }
        Ok(toks)
    }

    fn lex_word(&mut self) -> Tok {
        let start = self.pos;
        let rest = &self.buf[self.pos..];
        if let Ok((_, matched)) =
            take_while1::<_, _, nom::error::Error<&[u8]>>(|b: u8| b.is_ascii_alphanumeric() || b == b'_')(
                rest,
            )
        {
            self.pos += matched.len();
        }
        // An identifier may continue past the ASCII run with embedded
        // non-ASCII alphanumeric code points (e.g. "caf\u{e9}").
        while let Some(b) = self.peek_byte() {
            if b < 0x80 {
                break;
            }
            match decode_char(self.buf, self.pos) {
                Ok((ch, len)) if ch.is_alphanumeric() => self.pos += len,
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.buf[start..self.pos])
            .unwrap_or_default()
            .to_string();
        match text.to_ascii_uppercase().as_str() {
            "SELECT" => Tok::Select,
            "FROM" => Tok::From,
            "GROUP" => Tok::Group,
            "BY" => Tok::By,
            "COUNT" => Tok::Count,
            "SUM" => Tok::Sum,
            "MIN" => Tok::Min,
            "MAX" => Tok::Max,
            _ => Tok::Ident(text),
        }
    }

    /// An identifier whose first character is a non-ASCII letter (bare,
    /// unquoted). Also the catch-all for a stray high byte that doesn't
    /// start a valid identifier, which surfaces `decode_char`'s error.
    fn lex_unicode_ident(&mut self) -> Result<Tok, PrepareError> {
        let start = self.pos;
        let mut nonbmp_span: Option<Span> = None;
        loop {
            let Some(b) = self.peek_byte() else { break };
            if b < 0x80 {
                if b.is_ascii_alphanumeric() || b == b'_' {
                    self.pos += 1;
                    continue;
                }
                break;
            }
            let decode_start = self.pos;
            let (ch, len) = decode_char(self.buf, self.pos).map_err(|kind| PrepareError::Lex {
                kind,
                span: Span::point(decode_start),
            })?;
            if !ch.is_alphanumeric() && ch != '_' {
                break;
            }
            if (ch as u32) > 0xFFFF && nonbmp_span.is_none() {
                nonbmp_span = Some(Span::new(start, 0)); // length patched below
            }
            self.pos += len;
        }
        if self.pos == start {
            let (_, _) = decode_char(self.buf, start).map_err(|kind| PrepareError::Lex {
                kind,
                span: Span::point(start),
            })?;
            return Err(PrepareError::Lex {
                kind: LexError::IllegalToken,
                span: Span::point(start),
            });
        }
        if nonbmp_span.is_some() {
            return Err(PrepareError::Lex {
                kind: LexError::NonBmpInIdentifier,
                span: Span::new(start, self.pos - start),
            });
        }
        let text = std::str::from_utf8(&self.buf[start..self.pos])
            .unwrap_or_default()
            .to_string();
        Ok(Tok::Ident(text))
    }

    fn lex_quoted_ident(&mut self) -> Result<Tok, PrepareError> {
        let start = self.pos;
        self.pos += 1; // consume opening backtick
        let content_start = self.pos;
        loop {
            match self.peek_byte() {
                None => {
                    return Err(PrepareError::Lex {
                        kind: LexError::UnterminatedQuotedIdentifier,
                        span: Span::new(start, self.pos - start),
                    })
                }
                Some(0) => {
                    return Err(PrepareError::Lex {
                        kind: LexError::UnexpectedNul,
                        span: Span::point(self.pos),
                    })
                }
                Some(b'`') => {
                    if self.buf.get(self.pos + 1) == Some(&b'`') {
                        self.undo.record(self.pos + 1, b'`');
                        self.buf[self.pos + 1] = 0;
                        self.pos += 2;
                    } else {
                        let content_end = self.pos;
                        self.pos += 1; // consume closing backtick
                        let text = decode_filtered(&self.buf[content_start..content_end])
                            .map_err(|kind| PrepareError::Lex {
                                kind,
                                span: Span::new(content_start, content_end - content_start),
                            })?;
                        return Ok(Tok::Ident(text));
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }
}

struct TokStream<'a> {
    toks: &'a [(Tok, Span)],
    pos: usize,
    end_pos: usize,
}

impl<'a> TokStream<'a> {
    fn new(toks: &'a [(Tok, Span)], source_len: usize) -> Self {
        TokStream {
            toks,
            pos: 0,
            end_pos: source_len,
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.toks
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| Span::point(self.end_pos))
    }

    fn bump(&mut self) {
        if self.pos < self.toks.len() {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> PrepareError {
        match self.peek() {
            None => PrepareError::Syntax {
                kind: SyntaxError::UnexpectedEof,
                span: self.peek_span(),
            },
            Some(t) => PrepareError::Syntax {
                kind: SyntaxError::UnexpectedToken {
                    found: format!("{t:?}"),
                },
                span: self.peek_span(),
            },
        }
    }

    fn expect(&mut self, want: &Tok) -> Result<Span, PrepareError> {
        match self.peek() {
            Some(t) if t == want => {
                let s = self.peek_span();
                self.bump();
                Ok(s)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn expect_ident(&mut self) -> Result<String, PrepareError> {
        match self.peek().cloned() {
            Some(Tok::Ident(s)) => {
                self.bump();
                Ok(s)
            }
            _ => Err(self.unexpected()),
        }
    }
}

fn parse_select(ts: &mut TokStream) -> Result<SelectStatement, PrepareError> {
    ts.expect(&Tok::Select)?;
    let outputs = parse_output_list(ts)?;

    // FROM is optional: a SELECT with no aggregates and no FROM/GROUP BY
    // is syntactically well-formed and left to fail at load time with a
    // semantic "no aggregates" error, not a parse error.
    let table = if matches!(ts.peek(), Some(Tok::From)) {
        ts.bump();
        ts.expect_ident()?
    } else {
        String::new()
    };

    let mut groupby_columns = Vec::new();
    if matches!(ts.peek(), Some(Tok::Group)) {
        ts.bump();
        ts.expect(&Tok::By)?;
        groupby_columns = parse_ident_list(ts)?;
    }

    if matches!(ts.peek(), Some(Tok::Semi)) {
        ts.bump();
    }
    if ts.peek().is_some() {
        return Err(ts.unexpected());
    }

    Ok(SelectStatement {
        outputs,
        table,
        groupby_columns,
    })
}

fn parse_output_list(ts: &mut TokStream) -> Result<Vec<Output>, PrepareError> {
    let mut outs = vec![parse_output(ts)?];
    while matches!(ts.peek(), Some(Tok::Comma)) {
        ts.bump();
        outs.push(parse_output(ts)?);
    }
    Ok(outs)
}

fn parse_output(ts: &mut TokStream) -> Result<Output, PrepareError> {
    match ts.peek() {
        Some(Tok::Count) => parse_agg(ts, AggFn::Count),
        Some(Tok::Sum) => parse_agg(ts, AggFn::Sum),
        Some(Tok::Min) => parse_agg(ts, AggFn::Min),
        Some(Tok::Max) => parse_agg(ts, AggFn::Max),
        Some(Tok::Ident(_)) => {
            let name = ts.expect_ident()?;
            Ok(Output::Column(name))
        }
        _ => Err(ts.unexpected()),
    }
}

fn parse_agg(ts: &mut TokStream, func: AggFn) -> Result<Output, PrepareError> {
    ts.bump(); // the agg-function keyword
    ts.expect(&Tok::LParen)?;
    let arg = if matches!(ts.peek(), Some(Tok::Star)) {
        let star_span = ts.peek_span();
        if func != AggFn::Count {
            return Err(PrepareError::Syntax {
                kind: SyntaxError::UnexpectedToken {
                    found: "*".to_string(),
                },
                span: star_span,
            });
        }
        ts.bump();
        None
    } else {
        Some(parse_expr(ts)?)
    };
    ts.expect(&Tok::RParen)?;
    Ok(Output::Aggregate { func, arg })
}

fn parse_expr(ts: &mut TokStream) -> Result<AstExpr, PrepareError> {
    let mut node = parse_term(ts)?;
    loop {
        let op = match ts.peek() {
            Some(Tok::Plus) => AstOp::Add,
            Some(Tok::Minus) => AstOp::Sub,
            _ => break,
        };
        ts.bump();
        let rhs = parse_term(ts)?;
        node = AstExpr::Binary(op, Box::new(node), Box::new(rhs));
    }
    Ok(node)
}

fn parse_term(ts: &mut TokStream) -> Result<AstExpr, PrepareError> {
    let mut node = parse_factor(ts)?;
    loop {
        let op = match ts.peek() {
            Some(Tok::Mul) => AstOp::Mul,
            Some(Tok::Div) => AstOp::Div,
            Some(Tok::Rem) => AstOp::Rem,
            _ => break,
        };
        ts.bump();
        let rhs = parse_factor(ts)?;
        node = AstExpr::Binary(op, Box::new(node), Box::new(rhs));
    }
    Ok(node)
}

fn parse_factor(ts: &mut TokStream) -> Result<AstExpr, PrepareError> {
    match ts.peek() {
        Some(Tok::LParen) => {
            ts.bump();
            let e = parse_expr(ts)?;
            ts.expect(&Tok::RParen)?;
            Ok(e)
        }
        Some(Tok::Ident(_)) => {
            let name = ts.expect_ident()?;
            Ok(AstExpr::Column(name))
        }
        _ => Err(ts.unexpected()),
    }
}

fn parse_ident_list(ts: &mut TokStream) -> Result<Vec<String>, PrepareError> {
    let mut v = vec![ts.expect_ident()?];
    while matches!(ts.peek(), Some(Tok::Comma)) {
        ts.bump();
        v.push(ts.expect_ident()?);
    }
    Ok(v)
}

/// Parses `source`. On failure returns the triggering diagnostic
/// alongside the source bytes with every destructive lexer edit undone
/// (spec §7 "Source restoration") — byte-identical to the input.
pub fn parse(source: &[u8]) -> Result<SelectStatement, (PrepareError, Vec<u8>)> {
    if source.is_empty() {
        return Err((
            PrepareError::Syntax {
                kind: SyntaxError::EmptyInput,
                span: Span::new(0, 0),
            },
            Vec::new(),
        ));
    }

    let mut buf = source.to_vec();
    let mut lexer = Lexer::new(&mut buf);
    let tok_result = lexer.tokenize();
    let undo = lexer.undo.clone();

    let toks = match tok_result {
        Ok(t) => t,
        Err(e) => {
            undo.replay(&mut buf);
            return Err((e, buf));
        }
    };

    // Identifier text was already extracted into owned `String`s while
    // scanning; restore the working buffer now so a later syntax error
    // can still print byte-identical source.
    undo.replay(&mut buf);

    let mut ts = TokStream::new(&toks, source.len());
    match parse_select(&mut ts) {
        Ok(stmt) => Ok(stmt),
        Err(e) => Err((e, buf)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(sql: &str) -> SelectStatement {
        parse(sql.as_bytes()).unwrap_or_else(|(e, _)| panic!("expected parse to succeed: {e}"))
    }

    #[test]
    fn parses_count_and_sum_with_group_by() {
        let stmt = parse_ok("select count(a), sum(b) from t group by a;");
        assert_eq!(stmt.table, "t");
        assert_eq!(stmt.groupby_columns, vec!["a".to_string()]);
        assert_eq!(stmt.outputs.len(), 2);
        assert!(matches!(
            stmt.outputs[0],
            Output::Aggregate {
                func: AggFn::Count,
                ..
            }
        ));
    }

    #[test]
    fn count_star_has_no_argument() {
        let stmt = parse_ok("select count(*) from t");
        match &stmt.outputs[0] {
            Output::Aggregate { func, arg } => {
                assert_eq!(*func, AggFn::Count);
                assert!(arg.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shared_subexpression_parses_into_one_ast_shape_twice() {
        let stmt = parse_ok("select sum((a+b)*(a+b)) from t");
        match &stmt.outputs[0] {
            Output::Aggregate {
                func: AggFn::Sum,
                arg: Some(AstExpr::Binary(AstOp::Mul, l, r)),
            } => {
                assert_eq!(l, r, "both multiplicands parse to the same AST shape");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn from_clause_is_optional() {
        let stmt = parse_ok("select a;");
        assert_eq!(stmt.table, "");
        assert_eq!(stmt.outputs, vec![Output::Column("a".to_string())]);
    }

    #[test]
    fn empty_input_is_a_syntax_error() {
        let (err, _) = parse(b"").unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Syntax {
                kind: SyntaxError::EmptyInput,
                ..
            }
        ));
    }

    #[test]
    fn trailing_group_by_with_no_columns_is_unexpected_eof() {
        let (err, restored) = parse(b"select count(*) from t group by").unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Syntax {
                kind: SyntaxError::UnexpectedEof,
                ..
            }
        ));
        assert_eq!(restored, b"select count(*) from t group by");
    }

    #[test]
    fn illegal_byte_is_reported_at_offset_zero() {
        let (err, _) = parse(&[0xf8]).unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Lex {
                kind: LexError::IllegalByte,
                span: Span { pos: 0, len: 1 },
            }
        ));
    }

    #[test]
    fn doubled_backtick_escapes_a_literal_backtick_and_restores_on_error() {
        // `a``b` names a column literally called a`b; force a later
        // syntax error so the restoration path runs too.
        let (err, restored) = parse("select `a``b` from".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            PrepareError::Syntax {
                kind: SyntaxError::UnexpectedEof,
                ..
            }
        ));
        assert_eq!(restored, b"select `a``b` from");
    }

    #[test]
    fn quoted_identifier_unescapes_doubled_backtick() {
        let stmt = parse_ok("select `a``b` from t");
        assert_eq!(stmt.outputs[0], Output::Column("a`b".to_string()));
    }
}
