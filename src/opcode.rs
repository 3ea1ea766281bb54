//! Opcodes and their pure numeric behavior (`OpBehavior`).

use anyhow::{anyhow, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The full set of p-code opcodes. Discriminants are stable and match the
/// ordering a translator would emit them in; `TryFromPrimitive` lets the
/// bank and the emulator round-trip an opcode through its wire number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Copy = 1,
    Load = 2,
    Store = 3,
    Branch = 4,
    CBranch = 5,
    BranchInd = 6,
    Call = 7,
    CallInd = 8,
    CallOther = 9,
    Return = 10,
    IntEqual = 11,
    IntNotEqual = 12,
    IntSLess = 13,
    IntSLessEqual = 14,
    IntLess = 15,
    IntLessEqual = 16,
    IntZExt = 17,
    IntSExt = 18,
    IntAdd = 19,
    IntSub = 20,
    IntCarry = 21,
    IntSCarry = 22,
    IntSBorrow = 23,
    Int2Comp = 24,
    IntNegate = 25,
    IntXor = 26,
    IntAnd = 27,
    IntOr = 28,
    IntLeft = 29,
    IntRight = 30,
    IntSRight = 31,
    IntMult = 32,
    IntDiv = 33,
    IntSDiv = 34,
    IntRem = 35,
    IntSRem = 36,
    BoolNegate = 37,
    BoolXor = 38,
    BoolAnd = 39,
    BoolOr = 40,
    FloatEqual = 41,
    FloatNotEqual = 42,
    FloatLess = 43,
    FloatLessEqual = 44,
    FloatNan = 46,
    FloatAdd = 47,
    FloatDiv = 48,
    FloatMult = 49,
    FloatSub = 50,
    FloatNeg = 51,
    FloatAbs = 52,
    FloatSqrt = 53,
    FloatInt2Float = 54,
    FloatFloat2Float = 55,
    FloatTrunc = 56,
    FloatCeil = 57,
    FloatFloor = 58,
    FloatRound = 59,
    MultiEqual = 60,
    Indirect = 61,
    Piece = 62,
    SubPiece = 63,
    Cast = 64,
    PtrAdd = 65,
    PtrSub = 66,
    SegmentOp = 67,
    CPoolRef = 68,
    New = 69,
    Insert = 70,
    Extract = 71,
    PopCount = 72,
    LzCount = 73,
}

/// How many input slots an opcode's behavior expects, and whether it carries
/// the "special" (irregular-arity) semantics, named per-opcode below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Unary,
    Binary,
    Ternary,
    /// LOAD=2 (first input encodes a space), STORE=3, CBRANCH=2,
    /// BRANCHIND=1, CALL*/RETURN/CALLOTHER variable.
    Special(u32),
}

impl OpCode {
    pub fn arity(self) -> Arity {
        use OpCode::*;
        match self {
            Load => Arity::Special(2),
            Store => Arity::Special(3),
            CBranch => Arity::Special(2),
            BranchInd | Branch | CallInd | Return => Arity::Special(1),
            Call | CallOther | SegmentOp | CPoolRef | New => Arity::Special(0),
            MultiEqual | Indirect | Piece => Arity::Special(0),
            IntZExt | IntSExt | Int2Comp | IntNegate | BoolNegate | FloatNeg | FloatAbs
            | FloatSqrt | FloatInt2Float | FloatFloat2Float | FloatTrunc | FloatCeil
            | FloatFloor | FloatRound | FloatNan | Cast | PopCount | LzCount => Arity::Unary,
            IntAdd | IntSub | IntXor | IntAnd | IntOr | IntLeft | IntRight | IntSRight
            | IntMult | IntDiv | IntSDiv | IntRem | IntSRem | IntEqual | IntNotEqual
            | IntSLess | IntSLessEqual | IntLess | IntLessEqual | IntCarry | IntSCarry
            | IntSBorrow | BoolXor | BoolAnd | BoolOr | FloatEqual | FloatNotEqual
            | FloatLess | FloatLessEqual | FloatAdd | FloatDiv | FloatMult | FloatSub
            | PtrAdd | PtrSub | SubPiece => Arity::Binary,
            Insert | Extract => Arity::Ternary,
        }
    }

    pub fn is_commutative(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            IntAdd | IntXor | IntAnd | IntOr | IntMult | IntEqual | IntNotEqual
                | FloatAdd | FloatMult | FloatEqual | FloatNotEqual | BoolXor | BoolAnd | BoolOr
        )
    }

    pub fn is_branch(self) -> bool {
        matches!(self, OpCode::Branch | OpCode::CBranch | OpCode::BranchInd)
    }

    pub fn is_call(self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallInd | OpCode::CallOther)
    }

    /// Participates in phi/indirect SSA semantics and requires a heritaged
    /// address space (PcodeOp invariant, GLOSSARY "Heritaged").
    pub fn is_marker(self) -> bool {
        matches!(self, OpCode::MultiEqual | OpCode::Indirect)
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Copy => "COPY",
            Load => "LOAD",
            Store => "STORE",
            Branch => "BRANCH",
            CBranch => "CBRANCH",
            BranchInd => "BRANCHIND",
            Call => "CALL",
            CallInd => "CALLIND",
            CallOther => "CALLOTHER",
            Return => "RETURN",
            IntEqual => "INT_EQUAL",
            IntNotEqual => "INT_NOTEQUAL",
            IntSLess => "INT_SLESS",
            IntSLessEqual => "INT_SLESSEQUAL",
            IntLess => "INT_LESS",
            IntLessEqual => "INT_LESSEQUAL",
            IntZExt => "INT_ZEXT",
            IntSExt => "INT_SEXT",
            IntAdd => "INT_ADD",
            IntSub => "INT_SUB",
            IntCarry => "INT_CARRY",
            IntSCarry => "INT_SCARRY",
            IntSBorrow => "INT_SBORROW",
            Int2Comp => "INT_2COMP",
            IntNegate => "INT_NEGATE",
            IntXor => "INT_XOR",
            IntAnd => "INT_AND",
            IntOr => "INT_OR",
            IntLeft => "INT_LEFT",
            IntRight => "INT_RIGHT",
            IntSRight => "INT_SRIGHT",
            IntMult => "INT_MULT",
            IntDiv => "INT_DIV",
            IntSDiv => "INT_SDIV",
            IntRem => "INT_REM",
            IntSRem => "INT_SREM",
            BoolNegate => "BOOL_NEGATE",
            BoolXor => "BOOL_XOR",
            BoolAnd => "BOOL_AND",
            BoolOr => "BOOL_OR",
            FloatEqual => "FLOAT_EQUAL",
            FloatNotEqual => "FLOAT_NOTEQUAL",
            FloatLess => "FLOAT_LESS",
            FloatLessEqual => "FLOAT_LESSEQUAL",
            FloatNan => "FLOAT_NAN",
            FloatAdd => "FLOAT_ADD",
            FloatDiv => "FLOAT_DIV",
            FloatMult => "FLOAT_MULT",
            FloatSub => "FLOAT_SUB",
            FloatNeg => "FLOAT_NEG",
            FloatAbs => "FLOAT_ABS",
            FloatSqrt => "FLOAT_SQRT",
            FloatInt2Float => "FLOAT_INT2FLOAT",
            FloatFloat2Float => "FLOAT_FLOAT2FLOAT",
            FloatTrunc => "FLOAT_TRUNC",
            FloatCeil => "FLOAT_CEIL",
            FloatFloor => "FLOAT_FLOOR",
            FloatRound => "FLOAT_ROUND",
            MultiEqual => "MULTIEQUAL",
            Indirect => "INDIRECT",
            Piece => "PIECE",
            SubPiece => "SUBPIECE",
            Cast => "CAST",
            PtrAdd => "PTRADD",
            PtrSub => "PTRSUB",
            SegmentOp => "SEGMENTOP",
            CPoolRef => "CPOOLREF",
            New => "NEW",
            Insert => "INSERT",
            Extract => "EXTRACT",
            PopCount => "POPCOUNT",
            LzCount => "LZCOUNT",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

fn mask_for(bytes: u32) -> u64 {
    let bits = (bytes * 8).min(64);
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend(value: u64, bytes: u32) -> i64 {
    let bits = bytes * 8;
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Pure per-opcode numeric evaluator (`OpBehavior`). No per-op
/// state: given input byte sizes and values it returns the output value
/// within its declared size, or an evaluation failure.
pub struct OpBehavior;

impl OpBehavior {
    /// Evaluate a unary or binary integer opcode. `sizes` are the byte
    /// sizes of each input; `out_size` is the output's byte size.
    pub fn evaluate_integer(opcode: OpCode, inputs: &[u64], sizes: &[u32], out_size: u32) -> Result<u64> {
        use OpCode::*;
        let mask_out = mask_for(out_size);
        let result: u64 = match (opcode, inputs, sizes) {
            (Copy, [a], _) => *a,
            (IntNegate, [a], [s]) => !a & mask_for(*s),
            (Int2Comp, [a], [s]) => (!a).wrapping_add(1) & mask_for(*s),
            (BoolNegate, [a], _) => u64::from(*a == 0),
            (IntZExt, [a], _) => *a,
            (IntSExt, [a], [s]) => (sign_extend(*a, *s) as u64) & mask_out,
            (IntAdd, [a, b], [s, _]) => a.wrapping_add(*b) & mask_for(*s),
            (IntSub, [a, b], [s, _]) => a.wrapping_sub(*b) & mask_for(*s),
            (IntXor, [a, b], _) => a ^ b,
            (IntAnd, [a, b], _) => a & b,
            (IntOr, [a, b], _) => a | b,
            (IntLeft, [a, b], [s, _]) => {
                let shift = *b as u32;
                if shift >= s * 8 {
                    0
                } else {
                    (a << shift) & mask_for(*s)
                }
            }
            (IntRight, [a, b], [s, _]) => {
                let shift = *b as u32;
                if shift >= s * 8 {
                    0
                } else {
                    a >> shift
                }
            }
            (IntSRight, [a, b], [s, _]) => {
                let shift = *b as u32;
                let signed = sign_extend(*a, *s);
                let shifted = if shift >= 64 {
                    if signed < 0 { -1 } else { 0 }
                } else {
                    signed >> shift
                };
                (shifted as u64) & mask_for(*s)
            }
            (IntMult, [a, b], [s, _]) => a.wrapping_mul(*b) & mask_for(*s),
            (IntDiv, [a, b], [s, _]) => {
                if *b == 0 {
                    return Err(anyhow!("INT_DIV by zero"));
                }
                a.wrapping_div(*b) & mask_for(*s)
            }
            (IntSDiv, [a, b], [s, _]) => {
                if *b == 0 {
                    return Err(anyhow!("INT_SDIV by zero"));
                }
                let sa = sign_extend(*a, *s);
                let sb = sign_extend(*b, *s);
                (sa.wrapping_div(sb) as u64) & mask_for(*s)
            }
            (IntRem, [a, b], [s, _]) => {
                if *b == 0 {
                    return Err(anyhow!("INT_REM by zero"));
                }
                a.wrapping_rem(*b) & mask_for(*s)
            }
            (IntSRem, [a, b], [s, _]) => {
                if *b == 0 {
                    return Err(anyhow!("INT_SREM by zero"));
                }
                let sa = sign_extend(*a, *s);
                let sb = sign_extend(*b, *s);
                (sa.wrapping_rem(sb) as u64) & mask_for(*s)
            }
            (IntEqual, [a, b], _) => u64::from(a == b),
            (IntNotEqual, [a, b], _) => u64::from(a != b),
            (IntLess, [a, b], _) => u64::from(a < b),
            (IntLessEqual, [a, b], _) => u64::from(a <= b),
            (IntSLess, [a, b], [s, _]) => u64::from(sign_extend(*a, *s) < sign_extend(*b, *s)),
            (IntSLessEqual, [a, b], [s, _]) => u64::from(sign_extend(*a, *s) <= sign_extend(*b, *s)),
            (IntCarry, [a, b], [s, _]) => u64::from(a.wrapping_add(*b) & mask_for(*s) < *a & mask_for(*s)),
            (IntSCarry, [a, b], [s, _]) => {
                let sa = sign_extend(*a, *s);
                let sb = sign_extend(*b, *s);
                let sum = sa.wrapping_add(sb);
                u64::from((sa >= 0) == (sb >= 0) && (sum >= 0) != (sa >= 0))
            }
            (IntSBorrow, [a, b], [s, _]) => {
                let sa = sign_extend(*a, *s);
                let sb = sign_extend(*b, *s);
                let diff = sa.wrapping_sub(sb);
                u64::from((sa >= 0) != (sb >= 0) && (diff >= 0) != (sa >= 0))
            }
            (BoolXor, [a, b], _) => u64::from((*a != 0) != (*b != 0)),
            (BoolAnd, [a, b], _) => u64::from(*a != 0 && *b != 0),
            (BoolOr, [a, b], _) => u64::from(*a != 0 || *b != 0),
            (PtrAdd, [base, idx], _) => base.wrapping_add(*idx),
            (PtrSub, [base, off], _) => base.wrapping_add(*off),
            (PopCount, [a], _) => a.count_ones() as u64,
            (LzCount, [a], [s]) => (a.leading_zeros() - (64 - s * 8)) as u64,
            (SubPiece, [a, shift], [s, _]) => (a >> (shift * 8)) & mask_for(out_size.min(*s)),
            _ => return Err(anyhow!("OpBehavior has no integer evaluator for {opcode} with {} inputs", inputs.len())),
        };
        Ok(result & mask_out)
    }
}
