//! Sub-variable flow narrowing. Given an `INT_AND` against a
//! constant mask whose seed operand's nonzero-mask is already confined to
//! that same mask, the AND contributes nothing beyond a truncating copy:
//! collapse it into a `COPY` reading a narrow shadow varnode. Once collapsed,
//! any direct consumer that is itself an `INT_AND` against the same mask is
//! a transparent pass-through (ANDing an already-narrow value with the same
//! mask changes nothing) and collapses the same way, reading the shadow
//! directly rather than routing through the first `COPY` — a forward sweep
//! down a chain of redundant re-masking, rather than a single-op rewrite.
//!
//! Backward tracing through a definition to recompute a mask the nonzero-mask
//! field doesn't already carry, and classifying other op kinds (not just a
//! second `INT_AND`) as transparent, are not implemented; both would
//! duplicate work a separate mask-propagation pass already owns.

use anyhow::Result;

use crate::action::Rule;
use crate::error::RuleAction;
use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::OpId;
use crate::space::{Address, SpaceIndex};
use crate::varnode::{FlowRole, VarnodeId};

fn bytes_for_mask(mask: u64) -> u32 {
    if mask == 0 {
        return 1;
    }
    (64 - mask.leading_zeros()).div_ceil(8).max(1)
}

/// `RuleSubvarAnd` (scenario 6): narrows an `INT_AND x, mask` to a
/// `COPY` of a `bytes_for_mask(mask)`-byte shadow varnode when `x`'s
/// nonzero-mask already fits within `mask`.
pub struct SubvarFlow {
    pub mask: u64,
}

impl Rule for SubvarFlow {
    fn name(&self) -> &str {
        "subvar-and"
    }

    fn opcodes(&self) -> &[OpCode] {
        const OPS: [OpCode; 1] = [OpCode::IntAnd];
        &OPS
    }

    fn apply(&self, f: &mut Funcdata, op: OpId) -> Result<RuleAction> {
        let Some(pcode) = f.op(op) else { return Ok(RuleAction::NONE) };
        if pcode.inputs.len() != 2 {
            return Ok(RuleAction::NONE);
        }
        let inputs = [pcode.inputs[0], pcode.inputs[1]];

        let (var_slot, const_slot) = match (f.varnode(inputs[0]).is_constant(), f.varnode(inputs[1]).is_constant()) {
            (false, true) => (0, 1),
            (true, false) => (1, 0),
            _ => return Ok(RuleAction::NONE),
        };
        if f.varnode(inputs[const_slot]).address.offset != self.mask {
            return Ok(RuleAction::NONE);
        }
        let seed = inputs[var_slot];
        if f.varnode(seed).nonzero_mask.0 & !self.mask != 0 {
            return Ok(RuleAction::NONE);
        }

        let byte_size = bytes_for_mask(self.mask);
        let seed_addr = f.varnode(seed).address;
        let shadow_addr = Address::new(SpaceIndex(u32::MAX), seed_addr.offset);
        let shadow = f.new_varnode(shadow_addr, byte_size, FlowRole::Free);
        f.varnode_mut(shadow).nonzero_mask = f.varnode(seed).nonzero_mask;

        f.op_remove_input(op, const_slot)?;
        f.op_set_opcode(op, OpCode::Copy)?;
        f.op_set_input(op, 0, shadow)?;
        let mut made = 1;
        if let Some(out) = f.op(op).and_then(|o| o.output) {
            made += collapse_transparent_descendants(f, self.mask, shadow, out);
        }
        Ok(RuleAction::made(made))
    }
}

/// Once `out` (an already-narrowed output) is in hand, any direct consumer
/// that is itself `INT_AND out, mask` is redundant re-masking: collapse it
/// into a `COPY` from `shadow` too, and recurse into its own descendants.
fn collapse_transparent_descendants(f: &mut Funcdata, mask: u64, shadow: VarnodeId, out: VarnodeId) -> u32 {
    let mut made = 0;
    let descendants = f.varnode(out).descendants.clone();
    for d in descendants {
        let Some(consumer) = f.op(d.op) else { continue };
        if consumer.opcode != OpCode::IntAnd || consumer.inputs.len() != 2 {
            continue;
        }
        let inputs = [consumer.inputs[0], consumer.inputs[1]];
        let const_slot = match (inputs[0] == out, inputs[1] == out) {
            (true, false) => 1,
            (false, true) => 0,
            _ => continue,
        };
        if !f.varnode(inputs[const_slot]).is_constant() || f.varnode(inputs[const_slot]).address.offset != mask {
            continue;
        }
        let consumer_out = consumer.output;
        if f.op_remove_input(d.op, const_slot).is_err() {
            continue;
        }
        if f.op_set_opcode(d.op, OpCode::Copy).is_err() {
            continue;
        }
        if f.op_set_input(d.op, 0, shadow).is_err() {
            continue;
        }
        made += 1;
        if let Some(next_out) = consumer_out {
            made += collapse_transparent_descendants(f, mask, shadow, next_out);
        }
    }
    made
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceIndex as Space;
    use crate::varnode::NZMask;

    fn addr(off: u64) -> Address {
        Address::new(Space(0), off)
    }

    #[test]
    fn and_collapses_to_copy_from_one_byte_shadow() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let vu = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        f.varnode_mut(vu).nonzero_mask = NZMask(1);
        let mask_const = f.new_varnode(addr(1), 4, FlowRole::Constant);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(op, 0, vu).unwrap();
        f.op_set_input(op, 1, mask_const).unwrap();
        let out = f.new_varnode(addr(0x20), 4, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        let rule = SubvarFlow { mask: 1 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(result.did_anything());
        assert_eq!(f.op(op).unwrap().opcode, OpCode::Copy);
        assert_eq!(f.op(op).unwrap().inputs.len(), 1);
        let shadow = f.op(op).unwrap().inputs[0];
        assert_eq!(f.varnode(shadow).size, 1);
    }

    #[test]
    fn forward_sweep_collapses_a_second_redundant_and_on_the_result() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let vu = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        f.varnode_mut(vu).nonzero_mask = NZMask(1);
        let mask_const = f.new_varnode(addr(1), 4, FlowRole::Constant);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(op, 0, vu).unwrap();
        f.op_set_input(op, 1, mask_const).unwrap();
        let out = f.new_varnode(addr(0x20), 4, FlowRole::Free);
        f.op_set_output(op, out).unwrap();

        // A second AND against the same mask, reading `op`'s result: once
        // `op` collapses to a COPY, this one is redundant too.
        let mask_const2 = f.new_varnode(addr(1), 4, FlowRole::Constant);
        let second = f.create_op(b, 1, addr(0x104), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(second, 0, out).unwrap();
        f.op_set_input(second, 1, mask_const2).unwrap();
        let second_out = f.new_varnode(addr(0x30), 4, FlowRole::Free);
        f.op_set_output(second, second_out).unwrap();

        let rule = SubvarFlow { mask: 1 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(result.did_anything());
        assert_eq!(f.op(op).unwrap().opcode, OpCode::Copy);
        assert_eq!(f.op(second).unwrap().opcode, OpCode::Copy);
        assert_eq!(f.op(second).unwrap().inputs, vec![f.op(op).unwrap().inputs[0]]);
    }

    #[test]
    fn does_not_fire_when_seed_has_bits_outside_mask() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let vu = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        f.varnode_mut(vu).nonzero_mask = NZMask(0xFF);
        let mask_const = f.new_varnode(addr(1), 4, FlowRole::Constant);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(op, 0, vu).unwrap();
        f.op_set_input(op, 1, mask_const).unwrap();

        let rule = SubvarFlow { mask: 1 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
        assert_eq!(f.op(op).unwrap().opcode, OpCode::IntAnd);
    }

    #[test]
    fn does_not_fire_on_a_different_mask_constant() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let vu = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        f.varnode_mut(vu).nonzero_mask = NZMask(1);
        let mask_const = f.new_varnode(addr(0xFF), 4, FlowRole::Constant);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(op, 0, vu).unwrap();
        f.op_set_input(op, 1, mask_const).unwrap();

        let rule = SubvarFlow { mask: 1 };
        let result = rule.apply(&mut f, op).unwrap();
        assert!(!result.did_anything());
    }
}
