//! The staged pipeline: parse -> load -> compile -> execute/print (spec
//! §5). Mirrors `RestSQLPreparer`'s `Status` state machine
//! (`examples/original_source/parser-and-compiler/RestSQLPreparer.cpp`)
//! almost method-for-method: each stage asserts it's being called in
//! order (calling out of order is a caller bug, not a recoverable
//! error, so it panics rather than returning `Result`), while landing in
//! `Failed` is sticky and idempotent — once failed, every stage method
//! just hands back the same diagnostic again instead of re-running.

use crate::agg::AggKind;
use crate::arena::Arena;
use crate::bytecode::Program;
use crate::catalog::Catalog;
use crate::compiler::AggCompiler;
use crate::errors::{LoadError, PrepareError};
use crate::expr::{ExprId, Op as ExprOp};
use crate::parser::{self, AggFn, AstExpr, AstOp, Output, SelectStatement};
use crate::record::Record;
use crate::vm::{AggVm, GroupResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Initialised,
    Parsing,
    Parsed,
    Loading,
    Loaded,
    Compiling,
    Compiled,
    Failed,
}

/// What one declared SELECT output is, independent of whether it ends
/// up in a `GroupResult`'s key cells or its aggregate values — useful
/// for a caller that wants to print a result header in SELECT-list
/// order (spec §4.5's `Print()`, and the CLI's output).
#[derive(Clone, Debug, PartialEq)]
pub enum OutputKind {
    GroupBy(String),
    Aggregate(AggKind),
}

fn to_agg_kind(func: AggFn) -> AggKind {
    match func {
        AggFn::Count => AggKind::Count,
        AggFn::Sum => AggKind::Sum,
        AggFn::Min => AggKind::Min,
        AggFn::Max => AggKind::Max,
    }
}

fn to_expr_op(op: AstOp) -> ExprOp {
    match op {
        AstOp::Add => ExprOp::Add,
        AstOp::Sub => ExprOp::Minus,
        AstOp::Mul => ExprOp::Mul,
        AstOp::Div => ExprOp::Div,
        AstOp::Rem => ExprOp::Rem,
    }
}

fn resolve_column<C: Catalog>(catalog: &mut C, name: &str) -> Result<u32, LoadError> {
    catalog
        .col_index(name)
        .or_else(|| catalog.intern(name))
        .ok_or_else(|| LoadError::UnknownColumn {
            name: name.to_string(),
        })
}

fn lower_expr<C: Catalog>(
    compiler: &mut AggCompiler,
    catalog: &mut C,
    expr: &AstExpr,
) -> Result<ExprId, PrepareError> {
    match expr {
        AstExpr::Column(name) => {
            let idx = resolve_column(catalog, name)?;
            Ok(compiler.load(idx)?)
        }
        AstExpr::Binary(op, left, right) => {
            let l = lower_expr(compiler, catalog, left)?;
            let r = lower_expr(compiler, catalog, right)?;
            Ok(compiler.binary(to_expr_op(*op), l, r)?)
        }
    }
}

/// Drives one query end to end. `C` is whatever `Catalog` the embedder
/// supplies; `Prepare` never constructs one itself.
pub struct Prepare<C: Catalog> {
    source: Vec<u8>,
    catalog: C,
    stage: Stage,
    error: Option<PrepareError>,
    /// Set only on a lex/syntax failure: the source with every
    /// destructive lexer edit undone, byte-identical to what was passed
    /// to `new`, for the caret reporter to print against.
    restored_source: Option<Vec<u8>>,
    ast: Option<SelectStatement>,
    compiler: Option<AggCompiler>,
    groupby_cols: Vec<u32>,
    agg_kinds: Vec<AggKind>,
    outputs: Vec<OutputKind>,
    program: Option<Program>,
    arena: Arena,
}

impl<C: Catalog> Prepare<C> {
    /// `source` is raw bytes, not `String`: the lexer is responsible for
    /// discovering whether it's valid UTF-8 at all (spec §7's
    /// `LEX_U_ILLEGAL_BYTE`/`LEX_U_INVALID_UTF8` kinds), so it must never
    /// be rejected or silently lossy-converted before reaching it.
    pub fn new(source: impl Into<Vec<u8>>, catalog: C) -> Self {
        Prepare {
            source: source.into(),
            catalog,
            stage: Stage::Initialised,
            error: None,
            restored_source: None,
            ast: None,
            compiler: None,
            groupby_cols: Vec::new(),
            agg_kinds: Vec::new(),
            outputs: Vec::new(),
            program: None,
            arena: Arena::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn error(&self) -> Option<&PrepareError> {
        self.error.as_ref()
    }

    /// The original source with any destructive lexer edits undone,
    /// available once a lex/syntax error has put this in `Failed`.
    pub fn restored_source(&self) -> Option<&[u8]> {
        self.restored_source.as_deref()
    }

    pub fn outputs(&self) -> &[OutputKind] {
        &self.outputs
    }

    fn fail(&mut self, err: PrepareError) -> PrepareError {
        self.stage = Stage::Failed;
        self.error = Some(err.clone());
        err
    }

    pub fn parse(&mut self) -> Result<(), PrepareError> {
        if self.stage == Stage::Failed {
            return Err(self.error.clone().unwrap());
        }
        assert_eq!(self.stage, Stage::Initialised, "parse() called out of order");
        self.stage = Stage::Parsing;

        match parser::parse(&self.source) {
            Ok(stmt) => {
                self.ast = Some(stmt);
                self.stage = Stage::Parsed;
                Ok(())
            }
            Err((e, restored)) => {
                self.restored_source = Some(restored);
                Err(self.fail(e))
            }
        }
    }

    pub fn load(&mut self) -> Result<(), PrepareError> {
        if self.stage == Stage::Failed {
            return Err(self.error.clone().unwrap());
        }
        assert_eq!(self.stage, Stage::Parsed, "load() called out of order");
        self.stage = Stage::Loading;

        let stmt = self.ast.take().expect("Parsed implies ast is set");

        if stmt.outputs.is_empty() {
            return Err(self.fail(LoadError::EmptySelect.into()));
        }

        // A SELECT naming no aggregate at all is rejected outright: this
        // system only ever produces per-group aggregate results, so a
        // purely-projective query (however its bare columns relate to
        // GROUP BY) is meaningless here, not merely miscompiled.
        if !stmt
            .outputs
            .iter()
            .any(|o| matches!(o, Output::Aggregate { .. }))
        {
            return Err(self.fail(LoadError::NoAggregates.into()));
        }

        let mut groupby_cols = Vec::with_capacity(stmt.groupby_columns.len());
        for name in &stmt.groupby_columns {
            match resolve_column(&mut self.catalog, name) {
                Ok(idx) => groupby_cols.push(idx),
                Err(e) => return Err(self.fail(e.into())),
            }
        }

        let mut compiler = AggCompiler::new();
        let mut agg_kinds = Vec::new();
        let mut outputs = Vec::new();

        for output in &stmt.outputs {
            match output {
                Output::Column(name) => {
                    let idx = match resolve_column(&mut self.catalog, name) {
                        Ok(idx) => idx,
                        Err(e) => return Err(self.fail(e.into())),
                    };
                    if !groupby_cols.contains(&idx) {
                        return Err(self.fail(
                            LoadError::BareColumnNotGrouped {
                                name: name.clone(),
                            }
                            .into(),
                        ));
                    }
                    outputs.push(OutputKind::GroupBy(name.clone()));
                }
                Output::Aggregate { func, arg } => {
                    let expr_id = match arg {
                        Some(e) => match lower_expr(&mut compiler, &mut self.catalog, e) {
                            Ok(id) => id,
                            Err(e) => return Err(self.fail(e)),
                        },
                        // COUNT(*) carries no expression; a placeholder
                        // Load is compiled and then dropped by dead-code
                        // elimination, since Count never reads it.
                        None => match compiler.load(0) {
                            Ok(id) => id,
                            Err(e) => return Err(self.fail(e.into())),
                        },
                    };
                    let kind = to_agg_kind(*func);
                    if let Err(e) = compiler.aggregate(kind, expr_id) {
                        return Err(self.fail(e.into()));
                    }
                    agg_kinds.push(kind);
                    outputs.push(OutputKind::Aggregate(kind));
                }
            }
        }

        self.compiler = Some(compiler);
        self.groupby_cols = groupby_cols;
        self.agg_kinds = agg_kinds;
        self.outputs = outputs;
        self.stage = Stage::Loaded;
        tracing::debug!(stage = ?self.stage, "loaded");
        Ok(())
    }

    pub fn compile(&mut self) -> Result<(), PrepareError> {
        if self.stage == Stage::Failed {
            return Err(self.error.clone().unwrap());
        }
        assert_eq!(self.stage, Stage::Loaded, "compile() called out of order");
        self.stage = Stage::Compiling;

        let compiler = self.compiler.take().expect("Loaded implies compiler is set");
        let groupby_cols = self.groupby_cols.clone();

        match compiler.compile(groupby_cols) {
            Ok(program) => {
                let encoded: Vec<u8> = program
                    .encode()
                    .iter()
                    .flat_map(|w| w.to_le_bytes())
                    .collect();
                // Defensive arena copy per spec §4.3: the program also
                // lives as plain owned data in `self.program` so `Prepare`
                // never hands back an arena-tied reference.
                if let Err(e) = self.arena.alloc_copy(&encoded) {
                    return Err(self.fail(e.into()));
                }
                self.program = Some(program);
                self.stage = Stage::Compiled;
                tracing::debug!("compiled");
                Ok(())
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Renders the compiled program's disassembly (spec §4.5 `Print()`).
    pub fn print(&self) -> Result<String, PrepareError> {
        if self.stage == Stage::Failed {
            return Err(self.error.clone().unwrap());
        }
        assert_eq!(self.stage, Stage::Compiled, "print() called out of order");
        Ok(self
            .program
            .as_ref()
            .expect("Compiled implies program is set")
            .disassemble())
    }

    /// Runs the compiled program over `records` and returns one
    /// `GroupResult` per distinct GROUP BY key, in first-seen order.
    /// May be called more than once; each call starts from a fresh
    /// group table.
    pub fn execute<'r>(
        &mut self,
        records: impl IntoIterator<Item = &'r Record>,
    ) -> Result<Vec<GroupResult>, PrepareError> {
        if self.stage == Stage::Failed {
            return Err(self.error.clone().unwrap());
        }
        assert_eq!(self.stage, Stage::Compiled, "execute() called out of order");

        let program = self
            .program
            .clone()
            .expect("Compiled implies program is set");
        let mut vm = AggVm::new(program, self.agg_kinds.clone());
        vm.init().map_err(PrepareError::from)?;
        for record in records {
            vm.process_record(record).map_err(PrepareError::from)?;
        }
        Ok(vm.finalize())
    }
}
