//! Fixed-width 32-bit bytecode encoding (spec §4.3, §6.1).
//!
//! The original C macros pack operand registers and type/sign flags
//! into overlapping bit ranges in a way the spec itself calls out as
//! likely buggy (spec §9, Open Question 2). Per that question's
//! resolution we keep the *documented* shape — opcode in the top 6
//! bits, sign/type flags per operand, `reg_a`/`reg_b` as the high/next
//! nibble of the 16-bit immediate for binary ops, a bare 16-bit
//! index for `LoadCol`/aggregate ops — without reproducing the
//! source's overlapping macros.
//!
//! ```text
//! bit  31..26   opcode (6 bits)
//! bit  25       sign flag, operand A (1 = unsigned)
//! bit  24       operand A is Double
//! bit  23       sign flag, operand B (1 = unsigned; binary ops only)
//! bit  22       operand B is Double
//! bits 21..20   reserved, always zero
//! bits 19..16   LoadCol -> destination register; Sum/Min/Max/Count ->
//!               source register; Mov/arithmetic -> unused (both
//!               registers are packed into bits 15..0 instead)
//! bits 15..0    immediate:
//!                 LoadCol            -> column index
//!                 Sum/Min/Max/Count  -> aggregate result slot index
//!                 Mov/arithmetic     -> reg_a in [15:12], reg_b in [11:8]
//! ```

use bitflags::bitflags;

use crate::errors::RuntimeError;

/// Magic tag gating version mismatch (spec §6.1).
pub const MAGIC: u16 = 0x0721;

/// Number of typed registers in the VM's register file.
pub const REGS: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Count = 0,
    LoadCol = 1,
    Sum = 2,
    Min = 3,
    Max = 4,
    Plus = 5,
    Minus = 6,
    Mul = 7,
    Div = 8,
    Rem = 9,
    Mov = 10,
}

impl Opcode {
    fn from_u8(v: u8) -> Result<Self, RuntimeError> {
        Ok(match v {
            0 => Opcode::Count,
            1 => Opcode::LoadCol,
            2 => Opcode::Sum,
            3 => Opcode::Min,
            4 => Opcode::Max,
            5 => Opcode::Plus,
            6 => Opcode::Minus,
            7 => Opcode::Mul,
            8 => Opcode::Div,
            9 => Opcode::Rem,
            10 => Opcode::Mov,
            _ => return Err(RuntimeError::TruncatedProgram),
        })
    }

    pub fn is_arith(self) -> bool {
        matches!(
            self,
            Opcode::Plus | Opcode::Minus | Opcode::Mul | Opcode::Div | Opcode::Rem
        )
    }

    pub fn is_aggregate(self) -> bool {
        matches!(self, Opcode::Sum | Opcode::Min | Opcode::Max | Opcode::Count)
    }
}

/// Declared type of a register value or an aggregate result slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer (wraparound two's-complement arithmetic).
    U64,
    /// IEEE-754 binary64.
    F64,
}

impl ValueType {
    fn is_double(self) -> bool {
        matches!(self, ValueType::F64)
    }

    fn is_unsigned(self) -> bool {
        matches!(self, ValueType::U64)
    }

    fn from_flags(is_double: bool, is_unsigned: bool) -> Self {
        if is_double {
            ValueType::F64
        } else if is_unsigned {
            ValueType::U64
        } else {
            ValueType::I64
        }
    }
}

bitflags! {
    /// Per-operand flag nibble packed into bits [25:22] of a word.
    #[repr(transparent)]
    struct OperandFlags: u32 {
        const SIGN_A   = 1 << 25;
        const DOUBLE_A = 1 << 24;
        const SIGN_B   = 1 << 23;
        const DOUBLE_B = 1 << 22;
    }
}

/// One decoded instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub type_a: ValueType,
    pub type_b: ValueType,
    /// Column index, aggregate slot, or `reg_a` depending on `op`.
    pub imm: u32,
    /// `reg_b`, valid only for `Mov`/arithmetic.
    pub reg_b: u32,
}

impl Instr {
    pub fn encode(self) -> u32 {
        let mut flags = OperandFlags::empty();
        if self.type_a.is_unsigned() {
            flags |= OperandFlags::SIGN_A;
        }
        if self.type_a.is_double() {
            flags |= OperandFlags::DOUBLE_A;
        }
        if self.type_b.is_unsigned() {
            flags |= OperandFlags::SIGN_B;
        }
        if self.type_b.is_double() {
            flags |= OperandFlags::DOUBLE_B;
        }

        let (reg_field, imm16) = if self.op == Opcode::Mov || self.op.is_arith() {
            (0, ((self.imm & 0xF) << 12) | ((self.reg_b & 0xF) << 8))
        } else if self.op == Opcode::LoadCol || self.op.is_aggregate() {
            (self.reg_b & 0xF, self.imm & 0xFFFF)
        } else {
            (0, self.imm & 0xFFFF)
        };

        ((self.op as u32) << 26) | flags.bits() | (reg_field << 16) | imm16
    }

    pub fn decode(word: u32) -> Result<Self, RuntimeError> {
        let op = Opcode::from_u8(((word >> 26) & 0x3F) as u8)?;
        let flags = OperandFlags::from_bits_truncate(word);
        let type_a = ValueType::from_flags(
            flags.contains(OperandFlags::DOUBLE_A),
            flags.contains(OperandFlags::SIGN_A),
        );
        let type_b = ValueType::from_flags(
            flags.contains(OperandFlags::DOUBLE_B),
            flags.contains(OperandFlags::SIGN_B),
        );
        let reg_field = (word >> 16) & 0xF;
        let imm16 = word & 0xFFFF;

        let (imm, reg_b) = if op == Opcode::Mov || op.is_arith() {
            ((imm16 >> 12) & 0xF, (imm16 >> 8) & 0xF)
        } else if op == Opcode::LoadCol || op.is_aggregate() {
            (imm16, reg_field)
        } else {
            (imm16, 0)
        };

        Ok(Instr {
            op,
            type_a,
            type_b,
            imm,
            reg_b,
        })
    }
}

/// A fully assembled, self-describing bytecode program: header words
/// (magic/length, group-by columns, aggregate result types) followed by
/// the instruction stream. Position-independent — the VM only ever
/// reads it start to finish.
#[derive(Clone, Debug)]
pub struct Program {
    pub groupby_cols: Vec<u32>,
    pub result_types: Vec<ValueType>,
    pub instrs: Vec<Instr>,
}

impl Program {
    pub fn encode(&self) -> Vec<u32> {
        let header_len = 2 + self.groupby_cols.len() + self.result_types.len();
        let total_len = header_len + self.instrs.len();
        let mut words = Vec::with_capacity(total_len);

        words.push(((MAGIC as u32) << 16) | (total_len as u32 & 0xFFFF));
        words.push(((self.groupby_cols.len() as u32) << 16) | (self.result_types.len() as u32));
        words.extend(self.groupby_cols.iter().copied());
        words.extend(self.result_types.iter().map(|t| encode_value_type(*t)));
        words.extend(self.instrs.iter().map(|i| i.encode()));
        words
    }

    pub fn decode(words: &[u32]) -> Result<Self, RuntimeError> {
        if words.len() < 2 {
            return Err(RuntimeError::TruncatedProgram);
        }
        let magic = (words[0] >> 16) as u16;
        if magic != MAGIC {
            return Err(RuntimeError::BadMagic);
        }
        let total_len = (words[0] & 0xFFFF) as usize;
        if total_len != words.len() {
            return Err(RuntimeError::TruncatedProgram);
        }

        let num_groupby = (words[1] >> 16) as usize;
        let num_results = (words[1] & 0xFFFF) as usize;
        let mut idx = 2;

        if words.len() < idx + num_groupby + num_results {
            return Err(RuntimeError::TruncatedProgram);
        }
        let groupby_cols = words[idx..idx + num_groupby].to_vec();
        idx += num_groupby;

        let result_types = words[idx..idx + num_results]
            .iter()
            .map(|w| decode_value_type(*w))
            .collect();
        idx += num_results;

        let instrs = words[idx..]
            .iter()
            .map(|w| Instr::decode(*w))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Program {
            groupby_cols,
            result_types,
            instrs,
        })
    }
}

impl Program {
    /// Human-readable disassembly for `Prepare::print()` (spec §4.5):
    /// register names, aggregate slots numbered, one line per
    /// instruction in emission order.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "program: {} group-by col(s), {} result(s), {} instr(s)\n",
            self.groupby_cols.len(),
            self.result_types.len(),
            self.instrs.len(),
        ));
        for (i, instr) in self.instrs.iter().enumerate() {
            out.push_str(&format!("  {i:>3}: {}\n", format_instr(instr)));
        }
        out
    }
}

fn format_instr(i: &Instr) -> String {
    let (a, b) = (i.imm, i.reg_b);
    match i.op {
        Opcode::LoadCol => format!("LoadCol  R{b} <- col[{a}]"),
        Opcode::Mov => format!("Mov      R{a} <- R{b}"),
        Opcode::Plus => format!("Add      R{a} <- R{a}, R{b}"),
        Opcode::Minus => format!("Sub      R{a} <- R{a}, R{b}"),
        Opcode::Mul => format!("Mul      R{a} <- R{a}, R{b}"),
        Opcode::Div => format!("Div      R{a} <- R{a}, R{b}"),
        Opcode::Rem => format!("Rem      R{a} <- R{a}, R{b}"),
        Opcode::Sum => format!("Sum      slot[{a}] <- R{b}"),
        Opcode::Min => format!("Min      slot[{a}] <- R{b}"),
        Opcode::Max => format!("Max      slot[{a}] <- R{b}"),
        Opcode::Count => format!("Count    slot[{a}]"),
    }
}

fn encode_value_type(t: ValueType) -> u32 {
    match t {
        ValueType::I64 => 0,
        ValueType::U64 => 1,
        ValueType::F64 => 2,
    }
}

fn decode_value_type(w: u32) -> ValueType {
    match w {
        1 => ValueType::U64,
        2 => ValueType::F64,
        _ => ValueType::I64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instr_roundtrips_through_encoding() {
        let i = Instr {
            op: Opcode::Plus,
            type_a: ValueType::I64,
            type_b: ValueType::U64,
            imm: 5,
            reg_b: 9,
        };
        let word = i.encode();
        assert_eq!(Instr::decode(word).unwrap(), i);
    }

    #[test]
    fn loadcol_keeps_full_16_bit_immediate() {
        let i = Instr {
            op: Opcode::LoadCol,
            type_a: ValueType::F64,
            type_b: ValueType::I64,
            imm: 40000,
            reg_b: 0,
        };
        let word = i.encode();
        let back = Instr::decode(word).unwrap();
        assert_eq!(back.imm, 40000);
    }

    #[test]
    fn loadcol_dest_register_survives_encoding_even_when_it_differs_from_the_column_index() {
        // Column 2's value loaded into register 5: column index and
        // destination register must round-trip independently.
        let i = Instr {
            op: Opcode::LoadCol,
            type_a: ValueType::I64,
            type_b: ValueType::I64,
            imm: 2,
            reg_b: 5,
        };
        let back = Instr::decode(i.encode()).unwrap();
        assert_eq!(back.imm, 2, "column index");
        assert_eq!(back.reg_b, 5, "destination register");
    }

    #[test]
    fn aggregate_source_register_survives_encoding() {
        let i = Instr {
            op: Opcode::Sum,
            type_a: ValueType::I64,
            type_b: ValueType::I64,
            imm: 3,  // result slot
            reg_b: 7, // source register
        };
        let back = Instr::decode(i.encode()).unwrap();
        assert_eq!(back.imm, 3);
        assert_eq!(back.reg_b, 7);
    }

    #[test]
    fn program_roundtrips_through_header() {
        let prog = Program {
            groupby_cols: vec![0],
            result_types: vec![ValueType::I64, ValueType::F64],
            instrs: vec![
                Instr {
                    op: Opcode::LoadCol,
                    type_a: ValueType::I64,
                    type_b: ValueType::I64,
                    imm: 1,
                    reg_b: 0,
                },
                Instr {
                    op: Opcode::Sum,
                    type_a: ValueType::F64,
                    type_b: ValueType::F64,
                    imm: 1,
                    reg_b: 0,
                },
            ],
        };
        let words = prog.encode();
        let back = Program::decode(&words).unwrap();
        assert_eq!(back.groupby_cols, prog.groupby_cols);
        assert_eq!(back.result_types, prog.result_types);
        assert_eq!(back.instrs, prog.instrs);
    }

    #[test]
    fn bad_magic_rejected() {
        let words = vec![0u32, 0u32];
        assert!(matches!(
            Program::decode(&words),
            Err(RuntimeError::BadMagic)
        ));
    }

    #[test]
    fn truncated_program_rejected() {
        let words = vec![((MAGIC as u32) << 16) | 10, 0u32];
        assert!(matches!(
            Program::decode(&words),
            Err(RuntimeError::TruncatedProgram)
        ));
    }
}
