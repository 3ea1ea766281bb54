//! Lane division. Given an op whose output and every input are a whole
//! number of `lane_bytes`-wide lanes (more than one), rewrite it into one
//! narrower op per lane, each reading `SUBPIECE`-extracted operand(s) at the
//! lane's byte offset, with the lane results folded back together with
//! `PIECE`. Covers the commutative bitwise binary ops (`INT_AND`/`INT_OR`/
//! `INT_XOR`, independent lane-by-lane since none carries across a lane
//! boundary) and the unary ops that are equally lane-independent (`COPY`,
//! and `INT_NEGATE`'s bitwise complement).
//!
//! `INT_2COMP`'s arithmetic negation is deliberately excluded even though
//! it's unary: two's-complement negation borrows out of each lane into the
//! next, so splitting it lane-by-lane would drop that carry and silently
//! compute the wrong answer. `MULTIEQUAL`/`INDIRECT`, per-lane `LOAD`/`STORE`
//! pointer materialization, and `ZEXT` lane-copy-plus-zero-fill are not
//! implemented.

use anyhow::Result;

use crate::action::Rule;
use crate::error::RuleAction;
use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::OpId;
use crate::transform::{TransformManager, TransformVarId};

pub struct LaneDivide {
    pub lane_bytes: u32,
}

impl Rule for LaneDivide {
    fn name(&self) -> &str {
        "lane-divide"
    }

    fn opcodes(&self) -> &[OpCode] {
        const OPS: [OpCode; 5] = [OpCode::IntAnd, OpCode::IntOr, OpCode::IntXor, OpCode::Copy, OpCode::IntNegate];
        &OPS
    }

    fn apply(&self, f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
        let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
        let opcode = pcode.opcode;
        let is_binary = matches!(opcode, OpCode::IntAnd | OpCode::IntOr | OpCode::IntXor);
        let is_unary = matches!(opcode, OpCode::Copy | OpCode::IntNegate);
        if !is_binary && !is_unary {
            return Ok(RuleAction::NONE);
        }
        let expected_inputs = if is_binary { 2 } else { 1 };
        if pcode.inputs.len() != expected_inputs {
            return Ok(RuleAction::NONE);
        }
        let Some(out) = pcode.output else { return Ok(RuleAction::NONE) };
        let inputs: Vec<_> = pcode.inputs.clone();
        let Some(block) = pcode.parent else { return Ok(RuleAction::NONE) };
        let Some(pos) = pcode.block_pos else { return Ok(RuleAction::NONE) };

        let size = f.varnode(out).size;
        if self.lane_bytes == 0 || size % self.lane_bytes != 0 || size <= self.lane_bytes {
            return Ok(RuleAction::NONE);
        }
        if inputs.iter().any(|&vn| f.varnode(vn).size != size) {
            return Ok(RuleAction::NONE);
        }
        let lane_count = size / self.lane_bytes;

        let mut mgr = TransformManager::new();
        let input_vars: Vec<TransformVarId> = inputs.iter().map(|&vn| mgr.preexisting(vn, size * 8)).collect();
        let out_var = mgr.preexisting(out, size * 8);

        let mut lane_outputs = Vec::with_capacity(lane_count as usize);
        for lane in 0..lane_count {
            let shift = lane * self.lane_bytes;

            let mut lane_inputs = Vec::with_capacity(input_vars.len());
            for &input_var in &input_vars {
                let shift_const = mgr.new_constant(size * 8, shift as u64);
                let sub = mgr.new_op(OpCode::SubPiece, 2);
                mgr.op_set_input(sub, 0, input_var)?;
                mgr.op_set_input(sub, 1, shift_const)?;
                let lane_in = mgr.new_unique(self.lane_bytes * 8);
                mgr.op_set_output(sub, lane_in)?;
                lane_inputs.push(lane_in);
            }

            let lane_op = mgr.new_op(opcode, lane_inputs.len());
            for (slot, &lane_in) in lane_inputs.iter().enumerate() {
                mgr.op_set_input(lane_op, slot, lane_in)?;
            }
            let lane_out = mgr.new_unique(self.lane_bytes * 8);
            mgr.op_set_output(lane_op, lane_out)?;
            lane_outputs.push(lane_out);
        }

        fold_lanes(&mut mgr, &lane_outputs, self.lane_bytes, op, out_var)?;

        mgr.mark_terminator_reached();
        mgr.apply(f, block, pos as usize)?;
        Ok(RuleAction::made(1))
    }
}

/// Folds per-lane outputs back together low-to-high with `PIECE`; the
/// final `PIECE` retires `op` and produces `out_var` directly.
fn fold_lanes(
    mgr: &mut TransformManager,
    lane_outputs: &[TransformVarId],
    lane_bytes: u32,
    op: OpId,
    out_var: TransformVarId,
) -> Result<()> {
    let mut acc = lane_outputs[0];
    let mut acc_bytes = lane_bytes;
    let last = lane_outputs.len() - 2;
    for (i, &next) in lane_outputs[1..].iter().enumerate() {
        let is_last = i == last;
        let piece = if is_last { mgr.new_op_replace(OpCode::Piece, 2, op) } else { mgr.new_op(OpCode::Piece, 2) };
        mgr.op_set_input(piece, 0, next)?;
        mgr.op_set_input(piece, 1, acc)?;
        acc_bytes += lane_bytes;
        let combined = if is_last { out_var } else { mgr.new_unique(acc_bytes * 8) };
        mgr.op_set_output(piece, combined)?;
        acc = combined;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Address, SpaceIndex};
    use crate::varnode::FlowRole;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    #[test]
    fn splits_a_four_byte_and_into_two_two_byte_lanes() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        let c = f.new_varnode(addr(0x20), 4, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 4, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = LaneDivide { lane_bytes: 2 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(result.did_anything());
        assert!(f.op(op).is_none());

        let block = f.blocks.get(b);
        let ands: Vec<OpId> = block.ops.iter().copied().filter(|&id| f.op(id).unwrap().opcode == OpCode::IntAnd).collect();
        assert_eq!(ands.len(), 2);
        let pieces: Vec<OpId> = block.ops.iter().copied().filter(|&id| f.op(id).unwrap().opcode == OpCode::Piece).collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(f.op(pieces[0]).unwrap().output, Some(out));
        assert_eq!(f.varnode(out).definition, Some(pieces[0]));
    }

    #[test]
    fn does_not_fire_when_size_is_not_a_lane_multiple() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = f.new_varnode(addr(0x10), 3, FlowRole::Free);
        let c = f.new_varnode(addr(0x20), 3, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntOr, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 3, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = LaneDivide { lane_bytes: 2 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }

    #[test]
    fn does_not_fire_when_op_is_already_lane_sized() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = f.new_varnode(addr(0x10), 2, FlowRole::Free);
        let c = f.new_varnode(addr(0x20), 2, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntXor, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 2, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = LaneDivide { lane_bytes: 2 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }

    #[test]
    fn splits_a_unary_bitwise_negate_into_per_lane_negates() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntNegate, 1).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        let out = f.new_varnode(addr(0x30), 4, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = LaneDivide { lane_bytes: 2 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(result.did_anything());
        assert!(f.op(op).is_none());

        let block = f.blocks.get(b);
        let negates: Vec<OpId> = block.ops.iter().copied().filter(|&id| f.op(id).unwrap().opcode == OpCode::IntNegate).collect();
        assert_eq!(negates.len(), 2);
        for &n in &negates {
            assert_eq!(f.op(n).unwrap().inputs.len(), 1);
        }
        let pieces: Vec<OpId> = block.ops.iter().copied().filter(|&id| f.op(id).unwrap().opcode == OpCode::Piece).collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(f.varnode(out).definition, Some(pieces[0]));
    }

    #[test]
    fn does_not_fire_on_arithmetic_negate() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::Int2Comp, 1).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        let out = f.new_varnode(addr(0x30), 4, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = LaneDivide { lane_bytes: 2 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }
}
