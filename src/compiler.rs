//! `AggCompiler`: the public construction API from spec §4.1 (`load`,
//! `binary`, `aggregate`) plus the `PROGRAMMING -> COMPILING ->
//! {COMPILED, FAILED}` state machine it drives. Owns the `ExprArena`
//! DAG and `AggList` output set; `compile()` hands both to `Codegen`.
//!
//! Grounded on `AggregationAPICompiler` in
//! `examples/original_source/parser-and-compiler/AggregationAPICompiler.hpp`,
//! whose `Status` enum and `Load`/arithmetic/aggregate method families
//! this mirrors, re-architected per spec §9 onto dense indices instead
//! of raw `Expr*` pointers.

use crate::agg::{AggKind, AggList};
use crate::bytecode::Program;
use crate::codegen::Codegen;
use crate::errors::CompileError;
use crate::expr::{ExprArena, ExprId, Op};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompilerState {
    Programming,
    Compiling,
    Compiled,
    Failed,
}

pub struct AggCompiler {
    arena: ExprArena,
    aggs: AggList,
    state: CompilerState,
}

impl AggCompiler {
    pub fn new() -> Self {
        AggCompiler {
            arena: ExprArena::new(),
            aggs: AggList::new(),
            state: CompilerState::Programming,
        }
    }

    pub fn state(&self) -> CompilerState {
        self.state
    }

    /// Interned `Load` node for `colidx` (spec §4.1: two calls with the
    /// same column return the same node).
    pub fn load(&mut self, colidx: u32) -> Result<ExprId, CompileError> {
        self.require_programming()?;
        Ok(self.arena.load(colidx))
    }

    /// Hash-consed binary arithmetic node (spec §4.1: keyed on
    /// `(op, left, right)`, not commutative).
    pub fn binary(&mut self, op: Op, left: ExprId, right: ExprId) -> Result<ExprId, CompileError> {
        self.require_programming()?;
        Ok(self.arena.binary(op, left, right))
    }

    /// Records `(kind, expr)` as the next declared SELECT aggregate
    /// output and bumps `expr`'s reference count.
    pub fn aggregate(&mut self, kind: AggKind, expr: ExprId) -> Result<u32, CompileError> {
        self.require_programming()?;
        self.arena.mark_referenced(expr);
        Ok(self.aggs.push(kind, expr))
    }

    fn require_programming(&self) -> Result<(), CompileError> {
        if self.state != CompilerState::Programming {
            return Err(CompileError::NotProgramming);
        }
        Ok(())
    }

    /// `kind` of every declared aggregate, in declaration (slot) order —
    /// what `AggVm::new` needs to know how to fold each result slot.
    pub fn agg_kinds(&self) -> Vec<AggKind> {
        self.aggs.iter().map(|(_, a)| a.kind).collect()
    }

    /// Runs the code generator and lowers the DAG + aggregate list into
    /// a `bytecode::Program`, filling in `groupby_cols` (resolved by the
    /// caller, which owns GROUP BY column lookup — spec §4.5 `load()`).
    /// Consumes `self`: per spec §5 this is a one-shot transition, never
    /// re-entered.
    pub fn compile(mut self, groupby_cols: Vec<u32>) -> Result<Program, CompileError> {
        self.state = CompilerState::Compiling;
        if self.aggs.is_empty() {
            self.state = CompilerState::Failed;
            return Err(CompileError::NoAggregates);
        }

        let codegen = Codegen::new(&self.arena);
        match codegen.compile(&self.aggs) {
            Ok(mut program) => {
                program.groupby_cols = groupby_cols;
                self.state = CompilerState::Compiled;
                tracing::debug!(
                    num_aggs = self.aggs.len(),
                    num_instrs = program.instrs.len(),
                    "AggCompiler compiled"
                );
                Ok(program)
            }
            Err(e) => {
                self.state = CompilerState::Failed;
                Err(e)
            }
        }
    }
}

impl Default for AggCompiler {
    fn default() -> Self {
        Self::new()
    }
}
