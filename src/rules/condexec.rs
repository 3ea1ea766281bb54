//! Conditional-execution simplifier. Collapses a diamond where
//! two predecessor branches recompute the same boolean a join block already
//! branches on, by deleting the join block's redundant recomputation and
//! relinking its predecessors directly to its successors.

use std::collections::HashMap;

use anyhow::Result;

use crate::action::Action;
use crate::error::RuleAction;
use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::{BlockId, OpId};
use crate::space::{Address, SpaceIndex};
use crate::varnode::{FlowRole, VarnodeId};

/// Complementary comparison opcode and whether its operands appear in
/// swapped order relative to the opcode it complements: `a OP1 b` is the
/// negation of `b OP2 a`. `IntEqual`/`IntNotEqual` complement with operands
/// in the same order since equality itself is symmetric under swap.
fn complementary_opcode(opcode: OpCode) -> Option<(OpCode, bool)> {
    use OpCode::*;
    match opcode {
        IntEqual => Some((IntNotEqual, false)),
        IntNotEqual => Some((IntEqual, false)),
        IntLess => Some((IntLessEqual, true)),
        IntLessEqual => Some((IntLess, true)),
        IntSLess => Some((IntSLessEqual, true)),
        IntSLessEqual => Some((IntSLess, true)),
        FloatLess => Some((FloatLessEqual, true)),
        FloatLessEqual => Some((FloatLess, true)),
        _ => None,
    }
}

fn vn_eq(f: &Funcdata, a: VarnodeId, b: VarnodeId) -> bool {
    f.varnode(a).address == f.varnode(b).address
}

fn same_operands(f: &Funcdata, a: &[VarnodeId], b: &[VarnodeId], allow_swap: bool) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let in_order = a.iter().zip(b.iter()).all(|(&x, &y)| vn_eq(f, x, y));
    if in_order {
        return true;
    }
    if allow_swap && a.len() == 2 {
        return vn_eq(f, a[0], b[1]) && vn_eq(f, a[1], b[0]);
    }
    false
}

/// Peels a single layer of `BOOL_NEGATE` wrapping a locally-defined
/// condition, returning the underlying defining op and whether a negation
/// was peeled. Chains of more than one `BOOL_NEGATE` are not unwrapped.
fn unwrap_negate(f: &Funcdata, op: OpId) -> (OpId, bool) {
    let Some(pcode) = f.op(op) else { return (op, false) };
    if pcode.opcode != OpCode::BoolNegate || pcode.inputs.len() != 1 {
        return (op, false);
    }
    match f.varnode(pcode.inputs[0]).definition {
        Some(under) => (under, true),
        None => (op, false),
    }
}

/// Compares the conditions defining two branches, returning `Some(flipped)`
/// where `flipped` is `true` when `b` is the logical complement of `a`
/// (a swapped-operand complementary opcode, or one wrapped in an extra
/// `BOOL_NEGATE`) and `false` when they compute the identical boolean.
/// `None` means no relationship was recognized.
fn conditions_match(f: &Funcdata, a: OpId, b: OpId) -> Option<bool> {
    let (ra, na) = unwrap_negate(f, a);
    let (rb, nb) = unwrap_negate(f, b);
    let op_a = f.op(ra)?;
    let op_b = f.op(rb)?;
    let base_flip = na != nb;

    if op_a.opcode == op_b.opcode {
        if same_operands(f, &op_a.inputs, &op_b.inputs, op_a.opcode.is_commutative()) {
            return Some(base_flip);
        }
        return None;
    }
    let (comp, swapped) = complementary_opcode(op_a.opcode)?;
    if comp != op_b.opcode {
        return None;
    }
    if same_operands(f, &op_a.inputs, &op_b.inputs, swapped) {
        return Some(!base_flip);
    }
    None
}

fn condition_defining_op(f: &Funcdata, branch: OpId) -> Option<OpId> {
    let op = f.op(branch)?;
    let cond = *op.inputs.first()?;
    f.varnode(cond).definition
}

/// Climbs from `start` through a chain of linear (1-in, 1-out) blocks up to
/// (but not including) a block ending in a conditional branch, returning
/// that block ("walking up from each in-edge through linear
/// blocks reaches the same initblock").
fn climb_to_branch_block(f: &Funcdata, start: BlockId) -> Option<BlockId> {
    let mut cur = start;
    loop {
        let block = f.blocks.get(cur);
        let ends_in_branch = block.ops.last().map(|&op| f.op(op).map(|o| o.opcode) == Some(OpCode::CBranch)).unwrap_or(false);
        if ends_in_branch {
            return Some(cur);
        }
        if !f.blocks.is_linear(cur) {
            return None;
        }
        cur = block.in_edges.first()?.target;
    }
}

/// An op in `iblock` other than the condition-defining op is pullable when
/// it is pure (no control-flow/call/marker/memory-effect opcode), produces
/// an output, and every descendant outside `iblock` lives directly in one
/// of `iblock`'s two successor blocks. Descendants further downstream would
/// need dominance analysis this pass doesn't do, so those block collapse.
fn pullable_ops(f: &Funcdata, iblock_ops: &[OpId], icond: OpId, posta: BlockId, postb: BlockId) -> Option<Vec<OpId>> {
    let mut others = Vec::new();
    for &op in iblock_ops {
        if op == icond {
            continue;
        }
        let o = f.op(op)?;
        if o.opcode.is_branch() || o.opcode.is_call() || o.opcode.is_marker() {
            return None;
        }
        if matches!(o.opcode, OpCode::Store | OpCode::Load) {
            return None;
        }
        o.output?;
        others.push(op);
    }
    for &op in &others {
        let output = f.op(op)?.output?;
        for d in &f.varnode(output).descendants {
            if iblock_ops.contains(&d.op) {
                continue;
            }
            let consumer_block = f.op(d.op).and_then(|c| c.parent);
            if consumer_block != Some(posta) && consumer_block != Some(postb) {
                return None;
            }
        }
    }
    Some(others)
}

/// Duplicates every pullable op into both `prea` and `preb`, each with a
/// fresh output varnode, then rewires each op's outside-`iblock`
/// descendants to read from whichever copy now lies on the path reaching
/// their block. The originals are left for the caller to destroy.
fn pull_back(f: &mut Funcdata, others: &[OpId], prea: BlockId, preb: BlockId, path_for_posta: BlockId, path_for_postb: BlockId, posta: BlockId, postb: BlockId) -> Result<()> {
    let mut remap_a: HashMap<VarnodeId, VarnodeId> = HashMap::new();
    let mut remap_b: HashMap<VarnodeId, VarnodeId> = HashMap::new();

    for &op in others {
        let o = f.op(op).expect("validated pullable");
        let opcode = o.opcode;
        let inputs = o.inputs.clone();
        let output = o.output.expect("validated pullable");
        let out_size = f.varnode(output).size;
        let out_addr = f.varnode(output).address;

        let inputs_a: Vec<VarnodeId> = inputs.iter().map(|vn| *remap_a.get(vn).unwrap_or(vn)).collect();
        let pos_a = f.blocks.get(prea).ops.len();
        let new_a = f.create_op(prea, pos_a, out_addr, 0, opcode, inputs_a.len())?;
        for (slot, vn) in inputs_a.iter().enumerate() {
            f.op_set_input(new_a, slot, *vn)?;
        }
        let shadow_a = f.new_varnode(Address::new(SpaceIndex(u32::MAX), out_addr.offset), out_size, FlowRole::Free);
        f.op_set_output(new_a, shadow_a)?;
        remap_a.insert(output, shadow_a);

        let inputs_b: Vec<VarnodeId> = inputs.iter().map(|vn| *remap_b.get(vn).unwrap_or(vn)).collect();
        let pos_b = f.blocks.get(preb).ops.len();
        let new_b = f.create_op(preb, pos_b, out_addr, 0, opcode, inputs_b.len())?;
        for (slot, vn) in inputs_b.iter().enumerate() {
            f.op_set_input(new_b, slot, *vn)?;
        }
        let shadow_b = f.new_varnode(Address::new(SpaceIndex(u32::MAX), out_addr.offset), out_size, FlowRole::Free);
        f.op_set_output(new_b, shadow_b)?;
        remap_b.insert(output, shadow_b);
    }

    for &op in others {
        let output = f.op(op).expect("validated pullable").output.expect("validated pullable");
        let descendants = f.varnode(output).descendants.clone();
        for d in descendants {
            let Some(consumer_block) = f.op(d.op).and_then(|c| c.parent) else { continue };
            let table = if consumer_block == posta {
                if path_for_posta == prea { &remap_a } else { &remap_b }
            } else if consumer_block == postb {
                if path_for_postb == prea { &remap_a } else { &remap_b }
            } else {
                continue;
            };
            if let Some(&replacement) = table.get(&output) {
                f.op_set_input(d.op, d.slot as usize, replacement)?;
            }
        }
    }
    Ok(())
}

/// Finds one collapsible diamond and performs its edit, or returns `None`
/// if no block currently matches (verification steps).
fn find_and_collapse(f: &mut Funcdata) -> Result<bool> {
    let candidates: Vec<BlockId> = f.blocks.iter().map(|b| b.id).collect();
    for iblock in candidates {
        let block = f.blocks.get(iblock);
        if block.in_edges.len() != 2 || block.out_edges.len() != 2 {
            continue;
        }
        let Some(&cbranch) = block.ops.last() else { continue };
        if f.op(cbranch).map(|o| o.opcode) != Some(OpCode::CBranch) {
            continue;
        }
        let prea = block.in_edges[0].target;
        let preb = block.in_edges[1].target;
        let posta = block.out_edges[0].target;
        let postb = block.out_edges[1].target;

        let Some(init_a) = climb_to_branch_block(f, prea) else { continue };
        let Some(init_b) = climb_to_branch_block(f, preb) else { continue };
        if init_a != init_b || init_a == iblock {
            continue;
        }
        let initblock = init_a;
        let Some(&init_cbranch) = f.blocks.get(initblock).ops.last() else { continue };

        let Some(icond) = condition_defining_op(f, cbranch) else { continue };
        let Some(init_cond) = condition_defining_op(f, init_cbranch) else { continue };
        let Some(flipped) = conditions_match(f, icond, init_cond) else { continue };

        // Removability: icond's output may only be read by cbranch; every
        // other op in iblock must be pullable into both predecessors.
        let iblock_ops: Vec<OpId> = f.blocks.get(iblock).ops.iter().copied().filter(|&op| op != cbranch).collect();
        let cond_out = f.op(icond).and_then(|o| o.output);
        if let Some(out) = cond_out {
            if f.varnode(out).descendants.iter().any(|d| d.op != cbranch) {
                continue;
            }
        }
        let Some(others) = pullable_ops(f, &iblock_ops, icond, posta, postb) else { continue };

        let (path_for_posta, path_for_postb) = if flipped { (preb, prea) } else { (prea, preb) };
        pull_back(f, &others, prea, preb, path_for_posta, path_for_postb, posta, postb)?;

        for &op in others.iter().rev() {
            f.destroy_op(op)?;
        }
        f.destroy_op(cbranch)?;
        f.destroy_op(icond)?;
        f.blocks.detach(iblock);
        let target_prea = if path_for_posta == prea { posta } else { postb };
        let target_preb = if path_for_posta == prea { postb } else { posta };
        f.blocks.add_edge(prea, target_prea, crate::block::EdgeKind::Fallthrough);
        f.blocks.add_edge(preb, target_preb, crate::block::EdgeKind::Fallthrough);
        return Ok(true);
    }
    Ok(false)
}

pub struct ConditionalExecution;

impl Action for ConditionalExecution {
    fn name(&self) -> &str {
        "conditional-execution"
    }

    fn apply(&self, f: &mut Funcdata) -> Result<RuleAction> {
        let mut total = RuleAction::NONE;
        while find_and_collapse(f)? {
            total += RuleAction::made(1);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::EdgeKind;
    use crate::funcdata::Funcdata;
    use crate::space::{Address, SpaceIndex};
    use crate::varnode::FlowRole;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    /// Builds: initblock (computes `x < 10`, branches) -> prea/preb ->
    /// iblock (recomputes `x < 10`, branches) -> posta/postb.
    fn build_diamond() -> (Funcdata, BlockId, BlockId, BlockId, BlockId, BlockId, BlockId) {
        let mut f = Funcdata::new("t", 8);
        let initblock = f.blocks.create_block();
        let prea = f.blocks.create_block();
        let preb = f.blocks.create_block();
        let iblock = f.blocks.create_block();
        let posta = f.blocks.create_block();
        let postb = f.blocks.create_block();

        let x = f.new_varnode(addr(0x1000), 4, FlowRole::Free);
        let ten = f.new_varnode(addr(10), 4, FlowRole::Constant);

        let init_cmp = f.create_op(initblock, 0, addr(0x10), 0, OpCode::IntSLess, 2).unwrap();
        f.op_set_input(init_cmp, 0, x).unwrap();
        f.op_set_input(init_cmp, 1, ten).unwrap();
        let cmp_out_init = f.new_varnode(addr(0x2000), 1, FlowRole::Free);
        f.op_set_output(init_cmp, cmp_out_init).unwrap();
        let init_branch = f.create_op(initblock, 1, addr(0x14), 0, OpCode::CBranch, 2).unwrap();
        f.op_set_input(init_branch, 0, cmp_out_init).unwrap();
        f.blocks.add_edge(initblock, prea, EdgeKind::Taken);
        f.blocks.add_edge(initblock, preb, EdgeKind::Fallthrough);

        f.blocks.add_edge(prea, iblock, EdgeKind::Fallthrough);
        f.blocks.add_edge(preb, iblock, EdgeKind::Fallthrough);

        let i_cmp = f.create_op(iblock, 0, addr(0x20), 0, OpCode::IntSLess, 2).unwrap();
        f.op_set_input(i_cmp, 0, x).unwrap();
        f.op_set_input(i_cmp, 1, ten).unwrap();
        let cmp_out_i = f.new_varnode(addr(0x2004), 1, FlowRole::Free);
        f.op_set_output(i_cmp, cmp_out_i).unwrap();
        let i_branch = f.create_op(iblock, 1, addr(0x24), 0, OpCode::CBranch, 2).unwrap();
        f.op_set_input(i_branch, 0, cmp_out_i).unwrap();
        f.blocks.add_edge(iblock, posta, EdgeKind::Taken);
        f.blocks.add_edge(iblock, postb, EdgeKind::Fallthrough);

        (f, initblock, prea, preb, iblock, posta)
    }

    #[test]
    fn collapses_redundant_recomputed_condition() {
        let (mut f, _initblock, prea, preb, iblock, posta) = build_diamond();
        let action = ConditionalExecution;
        let result = action.apply(&mut f).unwrap();
        assert!(result.did_anything());
        assert!(f.blocks.get(iblock).in_edges.is_empty());
        assert!(f.blocks.get(iblock).out_edges.is_empty());
        assert!(f.blocks.get(prea).out_edges.iter().any(|e| e.target == posta));

        let second = action.apply(&mut f).unwrap();
        assert!(!second.did_anything());
    }

    #[test]
    fn does_not_fire_when_recomputed_condition_has_extra_use() {
        let (mut f, _initblock, _prea, _preb, iblock, _posta) = build_diamond();
        let i_cmp = f.blocks.get(iblock).ops[0];
        let cmp_out = f.op(i_cmp).unwrap().output.unwrap();
        let extra = f.create_op(iblock, 0, addr(0x22), 0, OpCode::BoolNegate, 1).unwrap();
        f.op_set_input(extra, 0, cmp_out).unwrap();

        let action = ConditionalExecution;
        let result = action.apply(&mut f).unwrap();
        assert!(!result.did_anything());
    }

    #[test]
    fn collapses_with_complementary_swapped_sense_cross_linked() {
        let (mut f, _initblock, prea, preb, iblock, posta) = build_diamond();
        // Replace iblock's condition with `10 <= x`, the complement of
        // `x < 10` with operands swapped — same decision, flipped sense.
        let i_cmp = f.blocks.get(iblock).ops[0];
        let ten = f.op(i_cmp).unwrap().inputs[1];
        let x = f.op(i_cmp).unwrap().inputs[0];
        f.op_set_opcode(i_cmp, OpCode::IntSLessEqual).unwrap();
        f.op_set_input(i_cmp, 0, ten).unwrap();
        f.op_set_input(i_cmp, 1, x).unwrap();

        let postb = f.blocks.get(iblock).out_edges[1].target;
        let action = ConditionalExecution;
        let result = action.apply(&mut f).unwrap();
        assert!(result.did_anything());
        // Cross-linked: prea (init-true path) now falls to postb, not posta.
        assert!(f.blocks.get(prea).out_edges.iter().any(|e| e.target == postb));
        assert!(f.blocks.get(preb).out_edges.iter().any(|e| e.target == posta));
    }

    #[test]
    fn pulls_back_pure_op_feeding_the_condition() {
        let (mut f, _initblock, prea, preb, iblock, posta) = build_diamond();
        // Insert a pure op ahead of the recomputed comparison in iblock that
        // also has a use in posta, forcing a pull-back rather than a bare
        // delete.
        let x = f.op(f.blocks.get(iblock).ops[0]).unwrap().inputs[0];
        let shifted = f.new_varnode(addr(0x3000), 4, FlowRole::Free);
        let shift_op = f.create_op(iblock, 0, addr(0x1c), 0, OpCode::IntLeft, 2).unwrap();
        let one = f.new_varnode(addr(1), 4, FlowRole::Constant);
        f.op_set_input(shift_op, 0, x).unwrap();
        f.op_set_input(shift_op, 1, one).unwrap();
        f.op_set_output(shift_op, shifted).unwrap();

        let use_op = f.create_op(posta, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        f.op_set_input(use_op, 0, shifted).unwrap();

        let action = ConditionalExecution;
        let result = action.apply(&mut f).unwrap();
        assert!(result.did_anything());
        assert!(f.blocks.get(prea).out_edges.iter().any(|e| e.target == posta));
        // use_op's input no longer points at the destroyed op's output.
        let new_input = f.op(use_op).unwrap().inputs[0];
        assert_ne!(new_input, shifted);
        // The replacement is defined by a freshly pulled-back op in prea.
        let def = f.varnode(new_input).definition.unwrap();
        assert_eq!(f.op(def).unwrap().parent, Some(prea));
    }
}
