//! Per-function facade (component table "Funcdata — per-function
//! facade: owns the bank, the type view, the block graph, and performs
//! graph edits"). Binds the op bank, the varnode arena, the type factory,
//! and the block graph together, and is the only type permitted to mutate
//! the cross-links between them ("Emulation of C++ friendship":
//! "Keep public APIs narrow: createOp, destroyOp, opSetInput, opSetOutput").

use std::collections::HashMap;

use anyhow::Result;

use crate::bank::PcodeOpBank;
use crate::error::PcodeError;
use crate::block::BlockGraph;
use crate::opcode::OpCode;
use crate::pcodeop::{BlockId, MoveableKind, OpId, PcodeOp, SeqNum};
use crate::space::Address;
use crate::types::TypeFactory;
use crate::varnode::{FlowRole, Varnode, VarnodeId};

/// Per-function registry mapping iop-space offsets back to the `OpId` they
/// encode ("Global mutable state": "the `_opRegistry` for iop-space
/// pointers is per-function; lift it onto Funcdata so there is no
/// cross-function singleton"). An `OpId` reachable only through an iop-space
/// varnode (e.g. an INDIRECT's effect operand) round-trips through here.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    by_offset: HashMap<u64, OpId>,
    next_offset: u64,
}

impl OpRegistry {
    pub fn encode(&mut self, op: OpId) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.by_offset.insert(offset, op);
        offset
    }

    pub fn decode(&self, offset: u64) -> Option<OpId> {
        self.by_offset.get(&offset).copied()
    }

    pub fn forget(&mut self, offset: u64) {
        self.by_offset.remove(&offset);
    }
}

/// Per-function facade. Every cross-structure invariant (op/varnode
/// def-use links, op/block membership) is maintained exclusively through
/// the methods here; `PcodeOpBank`, `Varnode`, and `BlockGraph` never
/// update each other directly.
pub struct Funcdata {
    pub name: String,
    bank: PcodeOpBank,
    varnodes: Vec<Varnode>,
    pub types: TypeFactory,
    pub blocks: BlockGraph,
    pub op_registry: OpRegistry,
}

impl Funcdata {
    pub fn new(name: impl Into<String>, max_basetype_size: u32) -> Self {
        Self {
            name: name.into(),
            bank: PcodeOpBank::new(),
            varnodes: Vec::new(),
            types: TypeFactory::new(max_basetype_size),
            blocks: BlockGraph::new(),
            op_registry: OpRegistry::default(),
        }
    }

    pub fn bank(&self) -> &PcodeOpBank {
        &self.bank
    }

    pub fn op(&self, id: OpId) -> Option<&PcodeOp> {
        self.bank.get(id)
    }

    pub fn varnode(&self, id: VarnodeId) -> &Varnode {
        &self.varnodes[id.0 as usize]
    }

    pub fn varnode_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        &mut self.varnodes[id.0 as usize]
    }

    /// Allocates a fresh, unwritten varnode. Callers set its `flow`
    /// themselves via `op_set_output` (for `Written`) or by constructing
    /// the right `FlowRole` up front (`Constant`/`Input`/`Free`/`Persistent`).
    pub fn new_varnode(&mut self, address: Address, size: u32, flow: FlowRole) -> VarnodeId {
        let id = VarnodeId(self.varnodes.len() as u32);
        self.varnodes.push(Varnode::new(id, address, size, flow));
        id
    }

    /// Creates a dead op at `address`/`order`, places it at `position` in
    /// `block`'s op list, and marks it alive. Every input starts unset;
    /// callers wire them with `op_set_input` (`newOp` +
    /// insertion into the block).
    pub fn create_op(&mut self, block: BlockId, position: usize, address: Address, order: u32, opcode: OpCode, num_inputs: usize) -> Result<OpId> {
        let id = self.bank.create_at(address, order, opcode, num_inputs)?;
        self.insert_into_block(id, block, position)?;
        self.bank.mark_alive(id)?;
        Ok(id)
    }

    /// As `create_op`, but at an explicit `SeqNum` (`newOp(seq, ...)`,
    /// used when re-threading ops from a decoded stream).
    pub fn create_op_with_seq(&mut self, block: BlockId, position: usize, seq: SeqNum, opcode: OpCode, num_inputs: usize) -> Result<OpId> {
        let id = self.bank.create_with_seq(seq, opcode, num_inputs)?;
        self.insert_into_block(id, block, position)?;
        self.bank.mark_alive(id)?;
        Ok(id)
    }

    fn insert_into_block(&mut self, id: OpId, block: BlockId, position: usize) -> Result<()> {
        let ops = &mut self.blocks.get_mut(block).ops;
        if position > ops.len() {
            return Err(PcodeError::invariant(format!("create_op: position {position} out of range for block {block:?}")).into());
        }
        ops.insert(position, id);
        for (pos, &op_id) in ops.iter().enumerate().skip(position) {
            self.bank.get_mut(op_id).expect("just-indexed op").block_pos = Some(pos as u32);
        }
        let op = self.bank.get_mut(id).expect("just-created op");
        op.parent = Some(block);
        Ok(())
    }

    /// Removes `id` from its block, clears its def-use links with every
    /// input and its output varnode, and destroys it (`destroy`,
    /// preceded by the block/varnode unlinking `PcodeOpBank` itself knows
    /// nothing about).
    pub fn destroy_op(&mut self, id: OpId) -> Result<()> {
        let op = self.bank.get(id).ok_or_else(|| PcodeError::invariant(format!("destroy_op: unknown op {id:?}")))?;
        if !op.is_dead() {
            self.bank.mark_dead(id)?;
        }
        let op = self.bank.get(id).expect("checked above");
        let parent = op.parent;
        let inputs = op.inputs.clone();
        let output = op.output;

        for (slot, &input) in inputs.iter().enumerate() {
            if input.0 != u32::MAX {
                self.varnode_mut(input).remove_descendant(id, slot as u32);
            }
        }
        if let Some(out) = output {
            let vn = self.varnode_mut(out);
            vn.definition = None;
        }
        if let Some(block) = parent {
            let ops = &mut self.blocks.get_mut(block).ops;
            if let Some(pos) = ops.iter().position(|&x| x == id) {
                ops.remove(pos);
                for (new_pos, &op_id) in ops.iter().enumerate().skip(pos) {
                    self.bank.get_mut(op_id).expect("just-indexed op").block_pos = Some(new_pos as u32);
                }
            }
        }
        self.bank.destroy(id)
    }

    /// Rewires input `slot` of `op` to `vn`, updating both varnodes'
    /// descendant lists (narrow-API note; the op's old input, if
    /// set, loses `(op, slot)` from its descendant list).
    pub fn op_set_input(&mut self, op: OpId, slot: usize, vn: VarnodeId) -> Result<()> {
        let old = {
            let p = self.bank.get_mut(op).ok_or_else(|| PcodeError::invariant(format!("op_set_input: unknown op {op:?}")))?;
            if slot >= p.inputs.len() {
                return Err(PcodeError::invariant(format!("op_set_input: slot {slot} out of range")).with_seqnum(p.seq).into());
            }
            let old = p.inputs[slot];
            p.inputs[slot] = vn;
            old
        };
        if old.0 != u32::MAX {
            self.varnode_mut(old).remove_descendant(op, slot as u32);
        }
        self.varnode_mut(vn).add_descendant(op, slot as u32);
        Ok(())
    }

    /// Adds a new trailing input slot and wires it, for ops with variable
    /// arity (e.g. growing a `MULTIEQUAL`'s operand list).
    pub fn op_add_input(&mut self, op: OpId, vn: VarnodeId) -> Result<usize> {
        let slot = {
            let p = self.bank.get_mut(op).ok_or_else(|| PcodeError::invariant(format!("op_add_input: unknown op {op:?}")))?;
            p.inputs.push(vn);
            p.inputs.len() - 1
        };
        self.varnode_mut(vn).add_descendant(op, slot as u32);
        Ok(slot)
    }

    /// Sets (or replaces) `op`'s output, clearing the old output varnode's
    /// `definition` back-link first (narrow-API note).
    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) -> Result<()> {
        let old = {
            let p = self.bank.get_mut(op).ok_or_else(|| PcodeError::invariant(format!("op_set_output: unknown op {op:?}")))?;
            let old = p.output;
            p.output = Some(vn);
            old
        };
        if let Some(old_vn) = old {
            self.varnode_mut(old_vn).definition = None;
        }
        let out = self.varnode_mut(vn);
        out.definition = Some(op);
        out.flow = FlowRole::Written;
        Ok(())
    }

    pub fn op_set_opcode(&mut self, op: OpId, opcode: OpCode) -> Result<()> {
        self.bank.change_opcode(op, opcode)
    }

    /// Removes input `slot`, clearing its descendant link and shifting every
    /// later input's descendant entries down by one slot (e.g. narrowing an
    /// AND down to a COPY drops its now-unused mask operand).
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) -> Result<()> {
        let removed = {
            let p = self.bank.get_mut(op).ok_or_else(|| PcodeError::invariant(format!("op_remove_input: unknown op {op:?}")))?;
            if slot >= p.inputs.len() {
                return Err(PcodeError::invariant(format!("op_remove_input: slot {slot} out of range")).with_seqnum(p.seq).into());
            }
            p.inputs.remove(slot)
        };
        if removed.0 != u32::MAX {
            self.varnode_mut(removed).remove_descendant(op, slot as u32);
        }
        let tail: Vec<VarnodeId> = self.bank.get(op).expect("just edited").inputs[slot..].to_vec();
        for (offset, &vn) in tail.iter().enumerate() {
            if vn.0 == u32::MAX {
                continue;
            }
            let new_slot = (slot + offset) as u32;
            self.varnode_mut(vn).remove_descendant(op, new_slot + 1);
            self.varnode_mut(vn).add_descendant(op, new_slot);
        }
        Ok(())
    }

    /// Whether `op` can be relocated to sit immediately before `point`
    /// within the same basic block, without crossing a memory-effecting op
    /// that could reorder its result or a write to one of its own inputs
    /// (`isMoveable`). Conservative: an `Immobile`- or
    /// `Call`-classified op never moves.
    pub fn is_moveable(&self, op: OpId, point: OpId) -> Result<bool> {
        let src = self.bank.get(op).ok_or_else(|| PcodeError::invariant(format!("is_moveable: unknown op {op:?}")))?;
        match src.is_moveable_kind() {
            MoveableKind::Immobile | MoveableKind::Call => return Ok(false),
            MoveableKind::Ordinary | MoveableKind::LoadLike => {}
        }
        let dst = self.bank.get(point).ok_or_else(|| PcodeError::invariant(format!("is_moveable: unknown op {point:?}")))?;
        let (Some(parent), Some(dst_parent)) = (src.parent, dst.parent) else {
            return Ok(false);
        };
        if parent != dst_parent {
            return Ok(false);
        }
        let block = self.blocks.get(parent);
        let op_pos = block
            .ops
            .iter()
            .position(|&x| x == op)
            .ok_or_else(|| PcodeError::invariant("is_moveable: op not indexed in its block").with_seqnum(src.seq))?;
        let point_pos = block
            .ops
            .iter()
            .position(|&x| x == point)
            .ok_or_else(|| PcodeError::invariant("is_moveable: point not indexed in its block").with_seqnum(dst.seq))?;
        if point_pos <= op_pos {
            return Ok(point_pos == op_pos);
        }
        let is_load = matches!(src.is_moveable_kind(), MoveableKind::LoadLike);
        let inputs = &src.inputs;
        for &between in &block.ops[op_pos + 1..point_pos] {
            let between_op = self.bank.get(between).ok_or_else(|| PcodeError::invariant("is_moveable: dangling op in block list"))?;
            if is_load && matches!(between_op.opcode, OpCode::Store | OpCode::Call | OpCode::CallInd | OpCode::CallOther) {
                return Ok(false);
            }
            if let Some(out) = between_op.output {
                if inputs.contains(&out) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// The op control flow reaches after `id` falls through: the next op
    /// in the same block when one follows, or the first op of the unique
    /// successor block when `id` is the block's last op and exactly one
    /// out-edge leaves it (`fallthru`). `None` when neither holds, which
    /// callers (the emulator, the rewrite rules) take as "retranslate" or
    /// "no fallthru here", respectively.
    pub fn fallthru(&self, id: OpId) -> Option<OpId> {
        let op = self.bank.get(id)?;
        let block = op.parent?;
        let pos = op.block_pos? as usize;
        let ops = &self.blocks.get(block).ops;
        if let Some(&next) = ops.get(pos + 1) {
            return Some(next);
        }
        let out_edges = &self.blocks.get(block).out_edges;
        let [edge] = out_edges.as_slice() else {
            return None;
        };
        self.blocks.get(edge.target).ops.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::EdgeKind;
    use crate::space::SpaceIndex;
    use crate::types::MetaType;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    fn setup() -> (Funcdata, BlockId) {
        let mut f = Funcdata::new("test", 8);
        let b = f.blocks.create_block();
        (f, b)
    }

    #[test]
    fn create_op_wires_block_and_marks_alive() {
        let (mut f, b) = setup();
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        assert_eq!(f.op(op).unwrap().parent, Some(b));
        assert!(!f.op(op).unwrap().is_dead());
        assert_eq!(f.blocks.get(b).ops, vec![op]);
    }

    #[test]
    fn op_set_input_and_output_maintain_descendants() {
        let (mut f, b) = setup();
        let ty = f.types.get_base(4, MetaType::Int).unwrap();
        let src = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        f.varnode_mut(src).data_type = Some(ty);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        f.op_set_input(op, 0, src).unwrap();
        assert_eq!(f.varnode(src).descendants.len(), 1);

        let dst = f.new_varnode(addr(0x14), 4, FlowRole::Free);
        f.op_set_output(op, dst).unwrap();
        assert_eq!(f.varnode(dst).definition, Some(op));
        assert!(f.varnode(dst).is_written());
    }

    #[test]
    fn op_remove_input_shifts_later_descendant_slots() {
        let (mut f, b) = setup();
        let a = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        let c = f.new_varnode(addr(0x20), 4, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAnd, 2).unwrap();
        f.op_set_input(op, 0, a).unwrap();
        f.op_set_input(op, 1, c).unwrap();
        f.op_remove_input(op, 1).unwrap();
        assert_eq!(f.op(op).unwrap().inputs, vec![a]);
        assert!(f.varnode(c).descendants.is_empty());
        assert_eq!(f.varnode(a).descendants, vec![crate::varnode::Descendant { op, slot: 0 }]);
    }

    #[test]
    fn destroy_op_clears_descendants_and_removes_from_block() {
        let (mut f, b) = setup();
        let src = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        f.op_set_input(op, 0, src).unwrap();
        f.destroy_op(op).unwrap();
        assert!(f.varnode(src).descendants.is_empty());
        assert!(f.blocks.get(b).ops.is_empty());
        assert!(f.op(op).is_none());
    }

    #[test]
    fn is_moveable_rejects_load_crossing_a_store() {
        let (mut f, b) = setup();
        let load = f.create_op(b, 0, addr(0x100), 0, OpCode::Load, 2).unwrap();
        let _store = f.create_op(b, 1, addr(0x104), 0, OpCode::Store, 3).unwrap();
        let point = f.create_op(b, 2, addr(0x108), 0, OpCode::Copy, 1).unwrap();
        assert!(!f.is_moveable(load, point).unwrap());
    }

    #[test]
    fn is_moveable_allows_ordinary_op_with_no_conflicts() {
        let (mut f, b) = setup();
        let add = f.create_op(b, 0, addr(0x100), 0, OpCode::IntAdd, 2).unwrap();
        let point = f.create_op(b, 1, addr(0x104), 0, OpCode::Copy, 1).unwrap();
        assert!(f.is_moveable(add, point).unwrap());
    }

    #[test]
    fn op_registry_round_trips() {
        let mut reg = OpRegistry::default();
        let offset = reg.encode(OpId(7));
        assert_eq!(reg.decode(offset), Some(OpId(7)));
    }

    #[test]
    fn fallthru_stays_within_block_when_a_next_op_exists() {
        let (mut f, b) = setup();
        let a = f.create_op(b, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        let c = f.create_op(b, 1, addr(0x104), 0, OpCode::Copy, 1).unwrap();
        assert_eq!(f.fallthru(a), Some(c));
    }

    #[test]
    fn fallthru_crosses_into_the_sole_successor_block() {
        let mut f = Funcdata::new("test", 8);
        let b1 = f.blocks.create_block();
        let b2 = f.blocks.create_block();
        f.blocks.add_edge(b1, b2, EdgeKind::Fallthrough);
        let last = f.create_op(b1, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        let first = f.create_op(b2, 0, addr(0x200), 0, OpCode::Copy, 1).unwrap();
        assert_eq!(f.fallthru(last), Some(first));
    }

    #[test]
    fn fallthru_is_none_with_multiple_successor_blocks() {
        let mut f = Funcdata::new("test", 8);
        let b1 = f.blocks.create_block();
        let b2 = f.blocks.create_block();
        let b3 = f.blocks.create_block();
        f.blocks.add_edge(b1, b2, EdgeKind::Taken);
        f.blocks.add_edge(b1, b3, EdgeKind::Fallthrough);
        let last = f.create_op(b1, 0, addr(0x100), 0, OpCode::CBranch, 2).unwrap();
        assert_eq!(f.fallthru(last), None);
    }
}
