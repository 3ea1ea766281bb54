//! A single three-address operation (`PcodeOp`).

use std::cmp::Ordering;

use crate::flags_to_struct;
use crate::opcode::{Arity, OpBehavior, OpCode};
use crate::space::Address;
use crate::varnode::{NZMask, VarnodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// `(address, order, time)`. Full ordering: address, then time.
/// `order` disambiguates operations emitted for one address but does not
/// itself participate in comparison once `time` is assigned, matching the
/// source's behavior of using `time` as the real tiebreaker after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNum {
    pub address: Address,
    pub order: u32,
    pub time: u64,
}

impl SeqNum {
    pub fn new(address: Address, order: u32, time: u64) -> Self {
        Self { address, order, time }
    }
}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address).then(self.time.cmp(&other.time))
    }
}

const BRANCH: u32 = 1 << 0;
const CALL: u32 = 1 << 1;
const MARKER: u32 = 1 << 2;
const COMMUTATIVE: u32 = 1 << 3;
const UNARY: u32 = 1 << 4;
const BINARY: u32 = 1 << 5;
const SPECIAL: u32 = 1 << 6;
const TERNARY: u32 = 1 << 7;
const BOOL_OUTPUT: u32 = 1 << 8;

flags_to_struct!(
    PrimaryFlags, u32,
    BRANCH is_branch_flag "Unconditional/conditional/indirect branch.",
    CALL is_call_flag "CALL/CALLIND/CALLOTHER.",
    MARKER is_marker_flag "MULTIEQUAL/INDIRECT SSA marker.",
    COMMUTATIVE is_commutative_flag "Operand order does not affect the result.",
    UNARY is_unary_flag "Exactly one input.",
    BINARY is_binary_flag "Exactly two inputs.",
    SPECIAL is_special_flag "Irregular-arity semantics (LOAD/STORE/branches/calls/...).",
    TERNARY is_ternary_flag "Exactly three inputs.",
    BOOL_OUTPUT is_bool_output_flag "Output is a size-1 boolean.",
);

const WARNING: u32 = 1 << 0;
const INCIDENTAL_COPY: u32 = 1 << 1;
const STOP_TYPE_PROPAGATION: u32 = 1 << 2;
const DEAD: u32 = 1 << 3;

flags_to_struct!(
    SecondaryFlags, u32,
    WARNING has_warning "A user warning was recorded against this op.",
    INCIDENTAL_COPY incidental_copy "A COPY introduced to satisfy SSA, not by the user program.",
    STOP_TYPE_PROPAGATION stop_type_propagation "Blocks datatype inference through this op.",
    DEAD is_dead "Resides in the dead list, not the alive list.",
);

/// A single three-address operation. `output.def == self` is
/// maintained by `Funcdata`/`PcodeOpBank`'s edit primitives, never by this
/// type directly — see DESIGN.md "Emulation of C++ friendship".
#[derive(Debug, Clone)]
pub struct PcodeOp {
    pub id: OpId,
    pub opcode: OpCode,
    pub inputs: Vec<VarnodeId>,
    pub output: Option<VarnodeId>,
    pub seq: SeqNum,
    pub parent: Option<BlockId>,
    pub block_pos: Option<u32>,
    pub primary: PrimaryFlags,
    pub secondary: SecondaryFlags,
    /// Position in the intrusive alive/dead doubly-linked list, maintained
    /// by `PcodeOpBank` so removal stays O(1).
    pub(crate) list_prev: Option<OpId>,
    pub(crate) list_next: Option<OpId>,
}

impl PcodeOp {
    pub(crate) fn primary_flags_for(opcode: OpCode) -> PrimaryFlags {
        let mut bits = 0;
        if opcode.is_branch() {
            bits |= BRANCH;
        }
        if opcode.is_call() {
            bits |= CALL;
        }
        if opcode.is_marker() {
            bits |= MARKER;
        }
        if opcode.is_commutative() {
            bits |= COMMUTATIVE;
        }
        match opcode.arity() {
            Arity::Unary => bits |= UNARY,
            Arity::Binary => bits |= BINARY,
            Arity::Ternary => bits |= TERNARY,
            Arity::Special(_) => bits |= SPECIAL,
        }
        PrimaryFlags(bits)
    }

    pub fn is_dead(&self) -> bool {
        self.secondary.is_dead()
    }

    /// For an op whose every input is constant and whose output fits in
    /// integer precision, evaluate via `OpBehavior`. Returns the resulting
    /// integer plus whether any input carried a symbol-entry annotation
    /// that must be propagated onto the produced constant (`collapse`).
    pub fn collapse(&self, input_values: &[u64], input_sizes: &[u32], input_marked: &[bool], out_size: u32) -> anyhow::Result<(u64, bool)> {
        let value = OpBehavior::evaluate_integer(self.opcode, input_values, input_sizes, out_size)?;
        let marked = input_marked.iter().any(|&m| m);
        Ok((value, marked))
    }

    /// A superset of the bits that could be 1 in the output
    /// (`getNZMaskLocal`). `input_masks` line up with `self.inputs`;
    /// `loop_clip` skips MULTIEQUAL inputs that flow back from a loop.
    pub fn get_nz_mask_local(&self, input_masks: &[NZMask], out_size: u32, loop_clip: &[bool]) -> NZMask {
        use OpCode::*;
        let full = NZMask::full(out_size);
        match self.opcode {
            IntZExt => input_masks.first().copied().unwrap_or(NZMask::zero()),
            IntSExt => {
                // Sign bit of the input may propagate into every higher bit;
                // conservatively mark every input bit and everything above it.
                let in_mask = input_masks.first().copied().unwrap_or(NZMask::zero());
                if in_mask.0 == 0 {
                    NZMask::zero()
                } else {
                    full
                }
            }
            IntAnd => {
                let (Some(a), Some(b)) = (input_masks.first(), input_masks.get(1)) else {
                    return full;
                };
                a.intersect(*b)
            }
            IntOr | IntXor => {
                let (Some(a), Some(b)) = (input_masks.first(), input_masks.get(1)) else {
                    return full;
                };
                a.union(*b)
            }
            IntLeft => {
                // Constant shift amount unknown here; conservative full mask
                // unless the op can be proven to zero everything (handled by
                // callers that know the shift amount statically).
                full
            }
            IntRight | IntSRight => full,
            PopCount | LzCount => full,
            IntAdd => {
                let (Some(a), Some(b)) = (input_masks.first(), input_masks.get(1)) else {
                    return full;
                };
                // A superset: every bit set in either operand, plus one carry
                // bit above the highest set bit of either (spec: "ADD with
                // carry bound").
                let highest = 64 - (a.0 | b.0).leading_zeros().min(63);
                let carry_bound = if highest < 64 { (1u64 << (highest + 1)).wrapping_sub(1) } else { u64::MAX };
                NZMask((a.0 | b.0 | carry_bound) & full.0)
            }
            IntMult => full,
            Piece => full,
            SubPiece => full,
            MultiEqual => {
                let mut acc = 0u64;
                for (i, m) in input_masks.iter().enumerate() {
                    if loop_clip.get(i).copied().unwrap_or(false) {
                        continue;
                    }
                    acc |= m.0;
                }
                NZMask(acc & full.0)
            }
            Copy | Indirect => input_masks.first().copied().unwrap_or(full),
            _ => full,
        }
    }

    /// Whether this op can be reordered to just before `point` within the
    /// same basic block without violating data-flow or memory effects
    /// (`isMoveable`). `point` is addressed by its `OpId` so the
    /// caller, which holds the intervening ops, can perform the reachability
    /// check; this method captures the static per-opcode rules only.
    pub fn is_moveable_kind(&self) -> MoveableKind {
        use OpCode::*;
        match self.opcode {
            Load => MoveableKind::LoadLike,
            Call | CallInd => MoveableKind::Call,
            op if op.is_special() && op != Load => MoveableKind::Immobile,
            _ => MoveableKind::Ordinary,
        }
    }
}

trait SpecialExt {
    fn is_special(self) -> bool;
}
impl SpecialExt for OpCode {
    fn is_special(self) -> bool {
        matches!(self.arity(), Arity::Special(_))
    }
}

/// Static classification used by `Funcdata::is_moveable` to apply its
/// non-exhaustive rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveableKind {
    Ordinary,
    LoadLike,
    Call,
    Immobile,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceIndex;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    #[test]
    fn seqnum_orders_by_address_then_time() {
        let a = SeqNum::new(addr(0x100), 0, 0);
        let b = SeqNum::new(addr(0x100), 0, 1);
        let c = SeqNum::new(addr(0x104), 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn primary_flags_mark_branch_and_marker() {
        let flags = PcodeOp::primary_flags_for(OpCode::CBranch);
        assert!(flags.is_branch_flag());
        assert!(flags.is_special_flag());
        let phi = PcodeOp::primary_flags_for(OpCode::MultiEqual);
        assert!(phi.is_marker_flag());
    }

    #[test]
    fn and_mask_is_intersection() {
        let op = PcodeOp {
            id: OpId(0),
            opcode: OpCode::IntAnd,
            inputs: vec![],
            output: None,
            seq: SeqNum::new(addr(0), 0, 0),
            parent: None,
            block_pos: None,
            primary: PcodeOp::primary_flags_for(OpCode::IntAnd),
            secondary: SecondaryFlags::empty(),
            list_prev: None,
            list_next: None,
        };
        let masks = [NZMask(0b1111), NZMask(0b0101)];
        let result = op.get_nz_mask_local(&masks, 1, &[]);
        assert_eq!(result.0, 0b0101);
    }
}
