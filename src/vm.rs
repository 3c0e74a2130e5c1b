//! The aggregation interpreter, "AggVM" (spec §4.4).
//!
//! Registers and aggregate-result slots carry a runtime type tag
//! (`Value`) rather than trusting the bytecode's static per-instruction
//! type flags for arithmetic: a `Catalog` (spec §6.3) only maps column
//! names to indices, never declares a column's type, so there is no
//! static signal the code generator could use to pick a type ahead of
//! time. Per the spec's own Design Notes §9 ("the VM's hot loop should
//! not depend on the wire bit-layout"), the interpreter promotes types
//! dynamically from whatever a `LoadCol` actually reads off the record,
//! the same way SQLite's own dynamically-typed columns behave. This is
//! recorded as an explicit interpretation decision in `DESIGN.md`.

use std::collections::HashMap;

use crate::agg::AggKind;
use crate::bytecode::{Opcode, Program};
use crate::errors::RuntimeError;
use crate::record::{Cell, Record};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    I64(i64),
    U64(u64),
    F64(f64),
}

impl Value {
    fn to_f64(self) -> f64 {
        match self {
            Value::I64(v) => v as f64,
            Value::U64(v) => v as f64,
            Value::F64(v) => v,
        }
    }

    /// Reinterprets the bit pattern as unsigned, the "wraparound
    /// two's-complement" rule from spec §4.3.
    fn to_u64(self) -> u64 {
        match self {
            Value::I64(v) => v as u64,
            Value::U64(v) => v,
            Value::F64(v) => v as u64,
        }
    }

    fn to_i64(self) -> i64 {
        match self {
            Value::I64(v) => v,
            Value::U64(v) => v as i64,
            Value::F64(v) => v as i64,
        }
    }
}

/// `Err` marks a value tainted by an integer division-by-zero upstream
/// in the same expression; it propagates through further arithmetic and
/// turns whichever aggregate slot consumes it into a NULL-like result
/// (spec §4.3: "a per-group error state that is later reported as a
/// NULL-like result").
type RegValue = Result<Value, ()>;

fn promote(a: Value, b: Value) -> (Value, Value) {
    match (a, b) {
        (Value::F64(_), _) | (_, Value::F64(_)) => (Value::F64(a.to_f64()), Value::F64(b.to_f64())),
        (Value::U64(_), _) | (_, Value::U64(_)) => (Value::U64(a.to_u64()), Value::U64(b.to_u64())),
        _ => (a, b),
    }
}

fn apply_arith(op: Opcode, a: Value, b: Value) -> RegValue {
    let (a, b) = promote(a, b);
    match (a, b) {
        (Value::F64(x), Value::F64(y)) => Ok(Value::F64(match op {
            Opcode::Plus => x + y,
            Opcode::Minus => x - y,
            Opcode::Mul => x * y,
            Opcode::Div => x / y, // IEEE result: may be inf/NaN, not an error
            Opcode::Rem => x % y,
            _ => unreachable!(),
        })),
        (Value::U64(x), Value::U64(y)) => {
            if matches!(op, Opcode::Div | Opcode::Rem) && y == 0 {
                return Err(());
            }
            Ok(Value::U64(match op {
                Opcode::Plus => x.wrapping_add(y),
                Opcode::Minus => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => x / y,
                Opcode::Rem => x % y,
                _ => unreachable!(),
            }))
        }
        (Value::I64(x), Value::I64(y)) => {
            if matches!(op, Opcode::Div | Opcode::Rem) && y == 0 {
                return Err(());
            }
            Ok(Value::I64(match op {
                Opcode::Plus => x.wrapping_add(y),
                Opcode::Minus => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => x.wrapping_div(y),
                Opcode::Rem => x.wrapping_rem(y),
                _ => unreachable!(),
            }))
        }
        _ => unreachable!("promote() always unifies both sides"),
    }
}

/// Tuple of group-by column values identifying one group. Hashable so
/// it can key the group table directly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey(Vec<GroupKeyCell>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum GroupKeyCell {
    I64(i64),
    // unsigned/float group keys are hashed on their bit pattern so
    // equal values always land in the same bucket.
    Bits(u64),
    Str(String),
}

impl GroupKeyCell {
    fn from_cell(cell: &Cell) -> Self {
        match cell {
            Cell::I64(v) => GroupKeyCell::I64(*v),
            Cell::U64(v) => GroupKeyCell::Bits(*v),
            Cell::F64(v) => GroupKeyCell::Bits(v.to_bits()),
            Cell::Varchar(s) => GroupKeyCell::Str(s.clone()),
        }
    }
}

#[derive(Clone, Debug)]
enum AggSlot {
    Sum { value: Value, poisoned: bool },
    Count { value: u64 },
    Min { value: Option<Value>, poisoned: bool },
    Max { value: Option<Value>, poisoned: bool },
}

impl AggSlot {
    fn identity(kind: AggKind) -> Self {
        match kind {
            AggKind::Sum => AggSlot::Sum {
                value: Value::I64(0),
                poisoned: false,
            },
            AggKind::Count => AggSlot::Count { value: 0 },
            AggKind::Min => AggSlot::Min {
                value: None,
                poisoned: false,
            },
            AggKind::Max => AggSlot::Max {
                value: None,
                poisoned: false,
            },
        }
    }

    fn fold(&mut self, src: RegValue) {
        match self {
            AggSlot::Sum { value, poisoned } => match src {
                Err(()) => *poisoned = true,
                Ok(v) if !*poisoned => {
                    let (a, b) = promote(*value, v);
                    *value = match (a, b) {
                        (Value::F64(x), Value::F64(y)) => Value::F64(x + y),
                        (Value::U64(x), Value::U64(y)) => Value::U64(x.wrapping_add(y)),
                        (Value::I64(x), Value::I64(y)) => Value::I64(x.wrapping_add(y)),
                        _ => unreachable!(),
                    };
                }
                Ok(_) => {}
            },
            AggSlot::Count { value } => {
                *value += 1;
            }
            AggSlot::Min { value, poisoned } => match src {
                Err(()) => *poisoned = true,
                Ok(v) if !*poisoned => {
                    *value = Some(match *value {
                        None => v,
                        Some(cur) => {
                            let (a, b) = promote(cur, v);
                            if lt(b, a) {
                                v
                            } else {
                                cur
                            }
                        }
                    });
                }
                Ok(_) => {}
            },
            AggSlot::Max { value, poisoned } => match src {
                Err(()) => *poisoned = true,
                Ok(v) if !*poisoned => {
                    *value = Some(match *value {
                        None => v,
                        Some(cur) => {
                            let (a, b) = promote(cur, v);
                            if gt(b, a) {
                                v
                            } else {
                                cur
                            }
                        }
                    });
                }
                Ok(_) => {}
            },
        }
    }

    /// `None` renders as the NULL-like result from an integer
    /// division-by-zero, or an untouched `Min`/`Max` with no rows.
    fn finalize(&self) -> Option<Value> {
        match self {
            AggSlot::Sum { value, poisoned } => (!poisoned).then_some(*value),
            AggSlot::Count { value } => Some(Value::U64(*value)),
            AggSlot::Min { value, poisoned } => (!poisoned).then(|| (*value)).flatten(),
            AggSlot::Max { value, poisoned } => (!poisoned).then(|| (*value)).flatten(),
        }
    }
}

fn lt(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::F64(x), Value::F64(y)) => x < y,
        (Value::U64(x), Value::U64(y)) => x < y,
        (Value::I64(x), Value::I64(y)) => x < y,
        _ => unreachable!(),
    }
}

fn gt(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::F64(x), Value::F64(y)) => x > y,
        (Value::U64(x), Value::U64(y)) => x > y,
        (Value::I64(x), Value::I64(y)) => x > y,
        _ => unreachable!(),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum VmState {
    Constructed,
    Initialised,
    Finalised,
}

/// One row of the finalized result set: the group key's original cells
/// and one value per aggregate output, in declaration order.
#[derive(Clone, Debug)]
pub struct GroupResult {
    pub key_cells: Vec<Cell>,
    pub values: Vec<Option<Value>>,
}

/// The register/grouping interpreter. Owns the group table exclusively;
/// `ProcessRec` calls are expected to be serialised (spec §5).
pub struct AggVm {
    program: Program,
    kinds: Vec<AggKind>,
    state: VmState,
    registers: [Option<RegValue>; crate::bytecode::REGS as usize],
    groups: HashMap<GroupKey, (Vec<Cell>, Vec<AggSlot>)>,
    insertion_order: Vec<GroupKey>,
}

impl AggVm {
    pub fn new(program: Program, kinds: Vec<AggKind>) -> Self {
        AggVm {
            program,
            kinds,
            state: VmState::Constructed,
            registers: Default::default(),
            groups: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Validates the header and clears the group table. Re-`init`
    /// is permitted at any time and leaves no residue from a prior run.
    pub fn init(&mut self) -> Result<(), RuntimeError> {
        if self.program.result_types.len() != self.kinds.len() {
            return Err(RuntimeError::TruncatedProgram);
        }
        tracing::debug!(
            num_groupby = self.program.groupby_cols.len(),
            num_aggs = self.kinds.len(),
            "AggVM initialised"
        );
        self.groups.clear();
        self.insertion_order.clear();
        self.registers = Default::default();
        self.state = VmState::Initialised;
        Ok(())
    }

    pub fn process_record(&mut self, record: &Record) -> Result<(), RuntimeError> {
        if self.state == VmState::Constructed {
            return Err(RuntimeError::NotInitialised);
        }
        self.state = VmState::Initialised;

        let key = self.build_group_key(record)?;
        if !self.groups.contains_key(&key) {
            let key_cells: Result<Vec<Cell>, RuntimeError> = self
                .program
                .groupby_cols
                .iter()
                .map(|&c| {
                    record
                        .get(c)
                        .cloned()
                        .ok_or(RuntimeError::TypeMismatch { col: c })
                })
                .collect();
            let slots = self.kinds.iter().map(|&k| AggSlot::identity(k)).collect();
            self.groups.insert(key.clone(), (key_cells?, slots));
            self.insertion_order.push(key.clone());
            tracing::debug!(num_groups = self.groups.len(), "new group created");
        }

        self.registers = Default::default();

        for instr in &self.program.instrs {
            self.exec(instr, record, &key)?;
        }
        Ok(())
    }

    fn build_group_key(&self, record: &Record) -> Result<GroupKey, RuntimeError> {
        let mut cells = Vec::with_capacity(self.program.groupby_cols.len());
        for &col in &self.program.groupby_cols {
            let cell = record
                .get(col)
                .ok_or(RuntimeError::TypeMismatch { col })?;
            cells.push(GroupKeyCell::from_cell(cell));
        }
        Ok(GroupKey(cells))
    }

    fn exec(
        &mut self,
        instr: &crate::bytecode::Instr,
        record: &Record,
        key: &GroupKey,
    ) -> Result<(), RuntimeError> {
        use crate::bytecode::Opcode::*;

        match instr.op {
            LoadCol => {
                let col = instr.imm;
                let cell = record
                    .get(col)
                    .ok_or(RuntimeError::TypeMismatch { col })?;
                let value = match cell {
                    Cell::I64(v) => Value::I64(*v),
                    Cell::U64(v) => Value::U64(*v),
                    Cell::F64(v) => Value::F64(*v),
                    Cell::Varchar(_) => return Err(RuntimeError::TypeMismatch { col }),
                };
                // `imm` is the column index being read, not a register;
                // the destination register the allocator picked travels
                // in `reg_b` for this op (see `bytecode::Instr::encode`).
                self.set_reg(instr.reg_b, Ok(value))?;
            }
            Mov => {
                let v = self.get_reg(instr.reg_b)?;
                self.set_reg(instr.imm_reg(), v)?;
            }
            Plus | Minus | Mul | Div | Rem => {
                let a = self.get_reg(instr.imm_reg())?;
                let b = self.get_reg(instr.reg_b)?;
                let result = match (a, b) {
                    (Ok(a), Ok(b)) => apply_arith(instr.op, a, b),
                    _ => Err(()),
                };
                self.set_reg(instr.imm_reg(), result)?;
            }
            Sum | Min | Max | Count => {
                let slot_idx = instr.imm as usize;
                let src = if instr.op == Count {
                    Ok(Value::I64(0))
                } else {
                    self.get_reg(instr.reg_b)?
                };
                let (_, slots) = self.groups.get_mut(key).expect("group just inserted");
                let kind = match instr.op {
                    Sum => AggKind::Sum,
                    Min => AggKind::Min,
                    Max => AggKind::Max,
                    Count => AggKind::Count,
                    _ => unreachable!(),
                };
                debug_assert_eq!(std::mem::discriminant(&slots[slot_idx]), {
                    let template = AggSlot::identity(kind);
                    std::mem::discriminant(&template)
                });
                slots[slot_idx].fold(src);
            }
        }
        Ok(())
    }

    fn get_reg(&self, idx: u32) -> Result<RegValue, RuntimeError> {
        self.registers
            .get(idx as usize)
            .copied()
            .flatten()
            .ok_or(RuntimeError::RegisterOutOfRange(idx))
    }

    fn set_reg(&mut self, idx: u32, v: RegValue) -> Result<(), RuntimeError> {
        let slot = self
            .registers
            .get_mut(idx as usize)
            .ok_or(RuntimeError::RegisterOutOfRange(idx))?;
        *slot = Some(v);
        Ok(())
    }

    /// Produces `(group_key, [agg_result, ...])` per group, in the
    /// order groups were first seen.
    pub fn finalize(&mut self) -> Vec<GroupResult> {
        self.state = VmState::Finalised;
        self.insertion_order
            .iter()
            .map(|key| {
                let (key_cells, slots) = &self.groups[key];
                GroupResult {
                    key_cells: key_cells.clone(),
                    values: slots.iter().map(AggSlot::finalize).collect(),
                }
            })
            .collect()
    }
}

impl crate::bytecode::Instr {
    /// For `Mov`/arithmetic, `imm` holds the destination register
    /// (arithmetic ops are in-place, `R[dest] <- R[dest] op R[src]`, so
    /// reading `imm_reg()` yields the current left-operand value too).
    /// Not meaningful for `LoadCol`, whose `imm` is a column index, or
    /// for aggregate ops, whose `imm` is a result-slot index.
    fn imm_reg(&self) -> u32 {
        self.imm
    }
}
