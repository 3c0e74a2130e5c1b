//! Structured diagnostics for every stage of the prepare pipeline (spec
//! §7). The teacher (`sqlite3_rs`) represents all of SQLite's error
//! space as one bare `#[repr(i32)] enum SQLiteErr` with no `Display`
//! impl, because it only needs to cross a C ABI as an integer code. This
//! crate has no C boundary and is expected to render human diagnostics
//! (§7's caret-annotated reporter), so each stage gets its own
//! `thiserror`-derived enum with a real message, and they're unified
//! under `PrepareError` the way a library surfaces "the thing that went
//! wrong" to a caller.

use thiserror::Error;

/// Half-open byte range `[pos, pos+len)` into the original source text,
/// carried by every lexical/syntactic diagnostic so the reporter can
/// draw a caret under the offending span.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub pos: usize,
    pub len: usize,
}

impl Span {
    pub fn new(pos: usize, len: usize) -> Self {
        Span { pos, len }
    }

    pub fn point(pos: usize) -> Self {
        Span { pos, len: 1 }
    }
}

#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected NUL byte in source")]
    UnexpectedNul,
    #[error("illegal UTF-8 leading byte 0xF8-0xFF")]
    IllegalByte,
    #[error("overlong UTF-8 encoding")]
    OverlongEncoding,
    #[error("code point above U+10FFFF")]
    CodePointTooLarge,
    #[error("UTF-16 surrogate code point in source")]
    SurrogateCodePoint,
    #[error("non-BMP code point used in an identifier")]
    NonBmpInIdentifier,
    #[error("illegal token")]
    IllegalToken,
    #[error("unterminated quoted identifier")]
    UnterminatedQuotedIdentifier,
    #[error("invalid UTF-8 encoding")]
    InvalidUtf8,
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("empty input")]
    EmptyInput,
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected token {found:?}")]
    UnexpectedToken { found: String },
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum LoadError {
    #[error("unknown table {name:?}")]
    UnknownTable { name: String },
    #[error("unknown column {name:?}")]
    UnknownColumn { name: String },
    #[error("bare column {name:?} is neither aggregated nor in GROUP BY")]
    BareColumnNotGrouped { name: String },
    #[error("SELECT list is empty")]
    EmptySelect,
    #[error("no aggregates")]
    NoAggregates,
}

#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    #[error("register pressure exceeds the {available}-register file")]
    RegisterPressure { available: u32 },
    #[error("aggregate list is empty")]
    NoAggregates,
    #[error("compiler API used outside the PROGRAMMING state")]
    NotProgramming,
}

#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("bad magic number in bytecode header")]
    BadMagic,
    #[error("truncated instruction stream")]
    TruncatedProgram,
    #[error("register index {0} out of range")]
    RegisterOutOfRange(u32),
    #[error("aggregate slot index {0} out of range")]
    SlotOutOfRange(u32),
    #[error("column {col} cannot be coerced to the declared operand type")]
    TypeMismatch { col: u32 },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("VM used before Init() or after Finalize() without re-Init()")]
    NotInitialised,
}

#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceError {
    #[error("allocation of {requested} bytes exceeds the arena's limit")]
    AllocationTooLarge { requested: usize },
    #[error("arena out of memory")]
    OutOfMemory,
}

/// The top-level error `Prepare` returns from any stage. Carries the
/// byte span for diagnostics that have one.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum PrepareError {
    #[error("{kind}")]
    Lex { kind: LexError, span: Span },
    #[error("{kind}")]
    Syntax { kind: SyntaxError, span: Span },
    #[error("{0}")]
    Load(LoadError),
    #[error("{0}")]
    Compile(CompileError),
    #[error("{0}")]
    Runtime(RuntimeError),
    #[error("{0}")]
    Resource(ResourceError),
}

impl PrepareError {
    /// The byte span to underline, if this diagnostic has one
    /// (lexical/syntactic errors always do; later stages don't since
    /// they operate on the already-resolved DAG/bytecode).
    pub fn span(&self) -> Option<Span> {
        match self {
            PrepareError::Lex { span, .. } | PrepareError::Syntax { span, .. } => Some(*span),
            _ => None,
        }
    }
}

impl From<LoadError> for PrepareError {
    fn from(e: LoadError) -> Self {
        PrepareError::Load(e)
    }
}

impl From<CompileError> for PrepareError {
    fn from(e: CompileError) -> Self {
        PrepareError::Compile(e)
    }
}

impl From<RuntimeError> for PrepareError {
    fn from(e: RuntimeError) -> Self {
        PrepareError::Runtime(e)
    }
}

impl From<ResourceError> for PrepareError {
    fn from(e: ResourceError) -> Self {
        PrepareError::Resource(e)
    }
}
