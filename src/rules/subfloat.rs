//! Sub-float narrowing. Given a binary float op whose two operands both
//! trace back, through zero or more unary `FLOAT_NEG`/`FLOAT_ABS` steps, to a
//! widening `FLOAT_FLOAT2FLOAT` from exactly `target_bytes`, perform the
//! whole chain at `target_bytes` precision directly on the pre-conversion
//! operand and widen only the final result, instead of widening both
//! operands up front and carrying the extra precision through every
//! intermediate op.
//!
//! `MULTIEQUAL` chains are not propagated through: each arm of a
//! `MULTIEQUAL` can originate in a different block, and `TransformManager`
//! stages a rewrite against a single insertion block, so following a join
//! back across its predecessors has nowhere to commit the staged ops for
//! arms outside the block this rule fires in.

use anyhow::Result;

use crate::action::Rule;
use crate::error::RuleAction;
use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::OpId;
use crate::transform::{TransformManager, TransformVarId};
use crate::varnode::VarnodeId;

const MAX_CHAIN_DEPTH: u32 = 8;

pub struct SubfloatFlow {
    pub target_bytes: u32,
}

impl SubfloatFlow {
    /// Stages `vn`'s defining chain at `target_bytes` precision and returns
    /// the staged narrow value, or `None` if the chain doesn't bottom out in
    /// a `FLOAT_FLOAT2FLOAT` widening from exactly `target_bytes` within
    /// `MAX_CHAIN_DEPTH` unary steps.
    fn narrow_chain(&self, f: &Funcdata, mgr: &mut TransformManager, vn: VarnodeId, depth: u32) -> Option<TransformVarId> {
        let def = f.varnode(vn).definition?;
        let defop = f.op(def)?;
        match defop.opcode {
            OpCode::FloatFloat2Float => {
                let src = *defop.inputs.first()?;
                if f.varnode(src).size != self.target_bytes {
                    return None;
                }
                Some(mgr.preexisting(src, self.target_bytes * 8))
            }
            OpCode::FloatNeg | OpCode::FloatAbs if depth < MAX_CHAIN_DEPTH => {
                let src = *defop.inputs.first()?;
                let narrow_src = self.narrow_chain(f, mgr, src, depth + 1)?;
                let unary = mgr.new_op(defop.opcode, 1);
                mgr.op_set_input(unary, 0, narrow_src).ok()?;
                let narrow_out = mgr.new_unique(self.target_bytes * 8);
                mgr.op_set_output(unary, narrow_out).ok()?;
                Some(narrow_out)
            }
            _ => None,
        }
    }
}

impl Rule for SubfloatFlow {
    fn name(&self) -> &str {
        "subfloat-flow"
    }

    fn opcodes(&self) -> &[OpCode] {
        const OPS: [OpCode; 4] = [OpCode::FloatAdd, OpCode::FloatSub, OpCode::FloatMult, OpCode::FloatDiv];
        &OPS
    }

    fn apply(&self, f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
        let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
        if pcode.inputs.len() != 2 {
            return Ok(RuleAction::NONE);
        }
        let Some(out) = pcode.output else { return Ok(RuleAction::NONE) };
        let opcode = pcode.opcode;
        let out_size = f.varnode(out).size;
        if out_size <= self.target_bytes {
            return Ok(RuleAction::NONE);
        }
        let (a, b) = (pcode.inputs[0], pcode.inputs[1]);
        let Some(block) = pcode.parent else { return Ok(RuleAction::NONE) };
        let Some(pos) = pcode.block_pos else { return Ok(RuleAction::NONE) };

        let mut mgr = TransformManager::new();
        let Some(a_var) = self.narrow_chain(f, &mut mgr, a, 0) else { return Ok(RuleAction::NONE) };
        let Some(b_var) = self.narrow_chain(f, &mut mgr, b, 0) else { return Ok(RuleAction::NONE) };

        let narrow_op = mgr.new_op(opcode, 2);
        mgr.op_set_input(narrow_op, 0, a_var)?;
        mgr.op_set_input(narrow_op, 1, b_var)?;
        let narrow_out = mgr.new_unique(self.target_bytes * 8);
        mgr.op_set_output(narrow_op, narrow_out)?;

        let widen = mgr.new_op_replace(OpCode::FloatFloat2Float, 1, op);
        mgr.op_set_input(widen, 0, narrow_out)?;
        let out_var = mgr.preexisting(out, out_size * 8);
        mgr.op_set_output(widen, out_var)?;

        mgr.mark_terminator_reached();
        mgr.apply(f, block, pos as usize)?;
        Ok(RuleAction::made(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Address, SpaceIndex};
    use crate::varnode::FlowRole;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    fn float2float(f: &mut Funcdata, b: crate::pcodeop::BlockId, pos: usize, at: u64, src_size: u32, dst_size: u32) -> VarnodeId {
        let src = f.new_varnode(addr(at), src_size, FlowRole::Free);
        let op = f.create_op(b, pos, addr(at + 0x1000), 0, OpCode::FloatFloat2Float, 1).unwrap();
        f.op_set_input(op, 0, src).unwrap();
        let out = f.new_varnode(addr(at + 0x2000), dst_size, FlowRole::Free);
        f.op_set_output(op, out).unwrap();
        out
    }

    #[test]
    fn narrows_an_add_whose_operands_are_both_widened_floats() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = float2float(&mut f, b, 0, 0x10, 4, 8);
        let c = float2float(&mut f, b, 1, 0x20, 4, 8);
        let op = f.create_op(b, 2, addr(0x100), 0, OpCode::FloatAdd, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 8, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = SubfloatFlow { target_bytes: 4 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(result.did_anything());
        assert!(f.op(op).is_none());

        let block = f.blocks.get(b);
        let narrow_add = block
            .ops
            .iter()
            .copied()
            .find(|&id| f.op(id).unwrap().opcode == OpCode::FloatAdd)
            .expect("narrowed add present");
        assert_eq!(f.varnode(f.op(narrow_add).unwrap().output.unwrap()).size, 4);

        let widen = block
            .ops
            .iter()
            .copied()
            .find(|&id| f.op(id).unwrap().opcode == OpCode::FloatFloat2Float && f.op(id).unwrap().output == Some(out))
            .expect("final widen present");
        assert_eq!(f.varnode(out).definition, Some(widen));
    }

    #[test]
    fn does_not_fire_when_an_operand_has_no_conversion() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = float2float(&mut f, b, 0, 0x10, 4, 8);
        let c = f.new_varnode(addr(0x20), 8, FlowRole::Free);
        let op = f.create_op(b, 1, addr(0x100), 0, OpCode::FloatAdd, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 8, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = SubfloatFlow { target_bytes: 4 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }

    #[test]
    fn does_not_fire_when_conversion_source_precision_does_not_match_target() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = float2float(&mut f, b, 0, 0x10, 2, 8);
        let c = float2float(&mut f, b, 1, 0x20, 2, 8);
        let op = f.create_op(b, 2, addr(0x100), 0, OpCode::FloatAdd, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 8, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = SubfloatFlow { target_bytes: 4 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }

    #[test]
    fn narrows_through_a_negate_and_abs_chain_on_one_operand() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = float2float(&mut f, b, 0, 0x10, 4, 8);

        let neg = f.create_op(b, 1, addr(0x110), 0, OpCode::FloatNeg, 1).unwrap();
        f.op_set_input(neg, 0, a).unwrap();
        let negated = f.new_varnode(addr(0x120), 8, FlowRole::Free);
        f.op_set_output(neg, negated).unwrap();

        let abs = f.create_op(b, 2, addr(0x130), 0, OpCode::FloatAbs, 1).unwrap();
        f.op_set_input(abs, 0, negated).unwrap();
        let absed = f.new_varnode(addr(0x140), 8, FlowRole::Free);
        f.op_set_output(abs, absed).unwrap();

        let c = float2float(&mut f, b, 3, 0x20, 4, 8);
        let op = f.create_op(b, 4, addr(0x100), 0, OpCode::FloatAdd, 2).unwrap();
        f.op_set_input(op, 0, absed).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 8, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = SubfloatFlow { target_bytes: 4 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(result.did_anything());
        assert!(f.op(op).is_none());

        let block = f.blocks.get(b);
        let narrow_negs: Vec<OpId> = block
            .ops
            .iter()
            .copied()
            .filter(|&id| f.op(id).unwrap().opcode == OpCode::FloatNeg && f.varnode(f.op(id).unwrap().output.unwrap()).size == 4)
            .collect();
        assert_eq!(narrow_negs.len(), 1);
        let narrow_abs: Vec<OpId> = block
            .ops
            .iter()
            .copied()
            .filter(|&id| f.op(id).unwrap().opcode == OpCode::FloatAbs && f.varnode(f.op(id).unwrap().output.unwrap()).size == 4)
            .collect();
        assert_eq!(narrow_abs.len(), 1);
    }

    #[test]
    fn does_not_fire_through_an_unsupported_unary_op() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let a = float2float(&mut f, b, 0, 0x10, 4, 8);

        let sqrt = f.create_op(b, 1, addr(0x110), 0, OpCode::FloatSqrt, 1).unwrap();
        f.op_set_input(sqrt, 0, a).unwrap();
        let rooted = f.new_varnode(addr(0x120), 8, FlowRole::Free);
        f.op_set_output(sqrt, rooted).unwrap();

        let c = float2float(&mut f, b, 2, 0x20, 4, 8);
        let op = f.create_op(b, 3, addr(0x100), 0, OpCode::FloatAdd, 2).unwrap();
        f.op_set_input(op, 0, rooted).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        let out = f.new_varnode(addr(0x30), 8, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = SubfloatFlow { target_bytes: 4 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }
}
