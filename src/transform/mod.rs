//! Staging area for coordinated, atomic multi-op rewrites
//! (`TransformVar`/`TransformOp`/`TransformManager`). Every rewrite in
//! `crate::rules` that touches more than one op goes through here: stage the
//! shadow graph, trace it to confirm the pattern holds end to end, then
//! commit it in one shot against a `Funcdata`, or discard it untouched.

use std::collections::{HashSet, VecDeque};

use anyhow::{anyhow, ensure, Result};

use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::{BlockId, OpId};
use crate::varnode::VarnodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformVarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformOpId(pub u32);

/// What a staged variable ultimately resolves to ("TransformVar
/// represents a replacement varnode (preexisting, split-piece, lane, unique,
/// or constant)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformVarKind {
    /// An already-existing varnode, referenced unchanged.
    Preexisting(VarnodeId),
    /// A contiguous sub-range of an original varnode.
    Piece { original: VarnodeId },
    /// Lane `lane_index` of an original varnode under some `LaneDescription`.
    Lane { original: VarnodeId, lane_index: u32 },
    /// A brand-new unique-space temporary.
    NewUnique,
    /// A brand-new constant.
    NewConstant(u64),
    /// A marker carrying an op id, used where the shadow graph needs to
    /// reference an op rather than a value (e.g. an INDIRECT's iop input).
    InputOpMarker(OpId),
}

/// A staged replacement variable: carries its eventual bit width and, for
/// pieces/lanes, its bit offset within the original.
#[derive(Debug, Clone)]
pub struct TransformVar {
    pub id: TransformVarId,
    pub kind: TransformVarKind,
    pub bit_size: u32,
    pub bit_offset: u32,
    resolved: Option<VarnodeId>,
}

/// Which surviving-op patch shape a `Patch` applies ("patch the
/// surviving original ops per a typed patch list").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    CopyToLogical,
    CompareRewrite,
    CallOrReturnParameter,
    ZeroExtension,
    PushToLogical,
    IntToFloatPreExtend,
}

/// A deferred edit against a *surviving* original op, applied after every
/// staged op has been materialized ("patch the surviving original
/// ops").
#[derive(Debug, Clone)]
pub struct Patch {
    pub kind: PatchKind,
    pub op: OpId,
    pub slot: Option<usize>,
    pub replacement: TransformVarId,
}

/// A placeholder op: opcode, slots filled in by `op_set_input`/`op_set_output`,
/// and a back-link to the original op it replaces, if any.
#[derive(Debug, Clone)]
pub struct TransformOp {
    pub id: TransformOpId,
    pub opcode: OpCode,
    pub output: Option<TransformVarId>,
    pub inputs: Vec<Option<TransformVarId>>,
    pub replaces: Option<OpId>,
    /// Whether `replaces` should be destroyed once this op is committed.
    /// `newOpReplace` sets this; `newPreexistingOp` does not, since it
    /// restages an op's own identity rather than retiring it.
    pub destroy_original: bool,
    pub propagate_indirect: bool,
}

/// Stages one coherent multi-op edit and commits it atomically, or discards
/// it if tracing fails. A single instance is scoped to one
/// staged rewrite; rule code constructs a fresh one per attempt.
#[derive(Default)]
pub struct TransformManager {
    vars: Vec<TransformVar>,
    ops: Vec<TransformOp>,
    visited: HashSet<VarnodeId>,
    worklist: VecDeque<TransformVarId>,
    patches: Vec<Patch>,
    terminator_found: bool,
}

impl TransformManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_var(&mut self, kind: TransformVarKind, bit_size: u32, bit_offset: u32) -> TransformVarId {
        let id = TransformVarId(self.vars.len() as u32);
        self.vars.push(TransformVar { id, kind, bit_size, bit_offset, resolved: None });
        id
    }

    pub fn var(&self, id: TransformVarId) -> &TransformVar {
        &self.vars[id.0 as usize]
    }

    /// Stages one `TransformVar` per piece of `original`, marks `original`
    /// visited, and enqueues every staged var for tracing (`setReplacement`).
    /// Returns the staged ids in piece order.
    pub fn set_replacement(&mut self, original: VarnodeId, piece_bit_sizes: &[u32]) -> Vec<TransformVarId> {
        self.visited.insert(original);
        let mut offset = 0u32;
        let mut ids = Vec::with_capacity(piece_bit_sizes.len());
        for &bits in piece_bit_sizes {
            let id = self.push_var(TransformVarKind::Piece { original }, bits, offset);
            self.worklist.push_back(id);
            ids.push(id);
            offset += bits;
        }
        ids
    }

    pub fn new_unique(&mut self, bit_size: u32) -> TransformVarId {
        self.push_var(TransformVarKind::NewUnique, bit_size, 0)
    }

    pub fn new_constant(&mut self, bit_size: u32, value: u64) -> TransformVarId {
        self.push_var(TransformVarKind::NewConstant(value), bit_size, 0)
    }

    pub fn preexisting(&mut self, vn: VarnodeId, bit_size: u32) -> TransformVarId {
        self.push_var(TransformVarKind::Preexisting(vn), bit_size, 0)
    }

    /// True the first time `vn` is marked, false on every subsequent call —
    /// callers use this to avoid re-tracing a varnode reached from two
    /// directions.
    pub fn mark_visited(&mut self, vn: VarnodeId) -> bool {
        self.visited.insert(vn)
    }

    pub fn is_visited(&self, vn: VarnodeId) -> bool {
        self.visited.contains(&vn)
    }

    pub fn pop_worklist(&mut self) -> Option<TransformVarId> {
        self.worklist.pop_front()
    }

    pub fn push_worklist(&mut self, id: TransformVarId) {
        self.worklist.push_back(id);
    }

    /// A placeholder op that fully replaces `original` (`newOpReplace`):
    /// once applied, `original` is destroyed.
    pub fn new_op_replace(&mut self, opcode: OpCode, num_inputs: usize, original: OpId) -> TransformOpId {
        self.push_op(opcode, num_inputs, Some(original), true)
    }

    /// A placeholder for a brand-new op with no original counterpart
    /// (`newOp`).
    pub fn new_op(&mut self, opcode: OpCode, num_inputs: usize) -> TransformOpId {
        self.push_op(opcode, num_inputs, None, false)
    }

    /// A placeholder that reuses an existing op's identity in place
    /// (`newPreexistingOp`): its opcode/inputs/output are restaged but
    /// the op itself is not destroyed on apply.
    pub fn new_preexisting_op(&mut self, opcode: OpCode, num_inputs: usize, original: OpId) -> TransformOpId {
        self.push_op(opcode, num_inputs, Some(original), false)
    }

    fn push_op(&mut self, opcode: OpCode, num_inputs: usize, replaces: Option<OpId>, destroy_original: bool) -> TransformOpId {
        let id = TransformOpId(self.ops.len() as u32);
        self.ops.push(TransformOp {
            id,
            opcode,
            output: None,
            inputs: vec![None; num_inputs],
            replaces,
            destroy_original,
            propagate_indirect: false,
        });
        id
    }

    pub fn op_set_input(&mut self, op: TransformOpId, slot: usize, var: TransformVarId) -> Result<()> {
        let entry = self.ops.get_mut(op.0 as usize).ok_or_else(|| anyhow!("op_set_input: unknown transform op"))?;
        ensure!(slot < entry.inputs.len(), "op_set_input: slot out of range");
        entry.inputs[slot] = Some(var);
        Ok(())
    }

    pub fn op_set_output(&mut self, op: TransformOpId, var: TransformVarId) -> Result<()> {
        let entry = self.ops.get_mut(op.0 as usize).ok_or_else(|| anyhow!("op_set_output: unknown transform op"))?;
        entry.output = Some(var);
        Ok(())
    }

    /// Records that `original`'s `slot` (or its whole identity, if `slot` is
    /// `None`) must be rewritten to read `replacement` once the shadow graph
    /// is committed ("patch the surviving original ops"). Finding
    /// at least one of these before `apply` is the trace's success
    /// condition.
    pub fn add_patch(&mut self, kind: PatchKind, op: OpId, slot: Option<usize>, replacement: TransformVarId) {
        self.terminator_found = true;
        self.patches.push(Patch { kind, op, slot, replacement });
    }

    pub fn has_terminator(&self) -> bool {
        self.terminator_found
    }

    /// Declares the trace successful without an external patch: some
    /// rewrites (e.g. splitting a STORE into several STOREs) replace an op
    /// that produces no varnode, so there is nothing outside the staged
    /// graph left to repoint.
    pub fn mark_terminator_reached(&mut self) {
        self.terminator_found = true;
    }

    /// Discards every staged node without touching the real graph: all
    /// marks are cleared and no real edit is performed.
    pub fn rollback(self) {
        drop(self);
    }

    /// Materializes every staged op and patches surviving ops, in the order
    /// the requires: outputs first (so every new varnode exists),
    /// then inputs (so uses can reference freshly defined outputs), then
    /// the patch list, then destruction of replaced originals.
    pub fn apply(mut self, f: &mut Funcdata, block: BlockId, insert_at: usize) -> Result<()> {
        ensure!(self.terminator_found, "apply called on a transform with no terminator patch");

        // Ops staged via `new_op` (no `replaces`) borrow the address of the
        // first replaced op in the batch: they're new members of the same
        // rewritten group, not independent program points.
        let fallback_address = self.ops.iter().find_map(|top| top.replaces).and_then(|orig| f.op(orig)).map(|op| op.seq.address);

        let mut real_ops = vec![None; self.ops.len()];
        for (idx, top) in self.ops.iter().enumerate() {
            let address = match top.replaces.and_then(|orig| f.op(orig)) {
                Some(orig_op) => orig_op.seq.address,
                None => fallback_address
                    .ok_or_else(|| anyhow!("apply: transform op {idx} has no originating address and no anchor"))?,
            };
            let order = top.replaces.and_then(|orig| f.op(orig)).map(|op| op.seq.order).unwrap_or(0);
            let real = f.create_op(block, insert_at + idx, address, order, top.opcode, top.inputs.len())?;
            real_ops[idx] = Some(real);
        }

        for (idx, top) in self.ops.iter().enumerate() {
            if let Some(out_var) = top.output {
                let real_vn = Self::resolve(&mut self.vars, f, out_var)?;
                f.op_set_output(real_ops[idx].expect("just created"), real_vn)?;
            }
        }

        for (idx, top) in self.ops.iter().enumerate() {
            for (slot, input) in top.inputs.iter().enumerate() {
                let Some(in_var) = input else {
                    return Err(anyhow!("apply: transform op {idx} slot {slot} was never wired"));
                };
                let real_vn = Self::resolve(&mut self.vars, f, *in_var)?;
                f.op_set_input(real_ops[idx].expect("just created"), slot, real_vn)?;
            }
        }

        for patch in &self.patches {
            let real_vn = Self::resolve(&mut self.vars, f, patch.replacement)?;
            match patch.slot {
                Some(slot) => f.op_set_input(patch.op, slot, real_vn)?,
                None => f.op_set_output(patch.op, real_vn)?,
            }
        }

        for top in &self.ops {
            if top.destroy_original {
                let orig = top.replaces.expect("destroy_original implies replaces is set");
                f.destroy_op(orig)?;
            }
        }

        Ok(())
    }

    fn resolve(vars: &mut [TransformVar], f: &mut Funcdata, id: TransformVarId) -> Result<VarnodeId> {
        let idx = id.0 as usize;
        if let Some(vn) = vars[idx].resolved {
            return Ok(vn);
        }
        let bit_size = vars[idx].bit_size;
        let byte_size = bit_size.div_ceil(8).max(1);
        let vn = match vars[idx].kind {
            TransformVarKind::Preexisting(vn) => vn,
            TransformVarKind::Piece { original } | TransformVarKind::Lane { original, .. } => {
                let base = f.varnode(original);
                let offset = base.address.offset + (vars[idx].bit_offset / 8) as u64;
                let addr = crate::space::Address::new(base.address.space, offset);
                f.new_varnode(addr, byte_size, crate::varnode::FlowRole::Free)
            }
            TransformVarKind::NewUnique => {
                let addr = crate::space::Address::new(crate::space::SpaceIndex(u32::MAX), Self::next_unique_offset(f));
                f.new_varnode(addr, byte_size, crate::varnode::FlowRole::Free)
            }
            TransformVarKind::NewConstant(value) => {
                let addr = crate::space::Address::new(crate::space::SpaceIndex(0), value);
                f.new_varnode(addr, byte_size, crate::varnode::FlowRole::Constant)
            }
            TransformVarKind::InputOpMarker(op) => {
                let offset = f.op_registry.encode(op);
                let addr = crate::space::Address::new(crate::space::SpaceIndex(u32::MAX - 1), offset);
                f.new_varnode(addr, byte_size, crate::varnode::FlowRole::Free)
            }
        };
        vars[idx].resolved = Some(vn);
        Ok(vn)
    }

    fn next_unique_offset(f: &Funcdata) -> u64 {
        f.bank().time_counter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcdata::Funcdata;
    use crate::opcode::OpCode;
    use crate::space::{Address, SpaceIndex};
    use crate::varnode::FlowRole;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    #[test]
    fn set_replacement_marks_original_and_fills_worklist() {
        let mut f = Funcdata::new("t", 8);
        let vn = f.new_varnode(addr(0x10), 4, FlowRole::Free);
        let mut tm = TransformManager::new();
        let pieces = tm.set_replacement(vn, &[8, 8, 8, 8]);
        assert_eq!(pieces.len(), 4);
        assert!(tm.is_visited(vn));
        assert_eq!(tm.pop_worklist(), Some(pieces[0]));
    }

    #[test]
    fn apply_without_terminator_is_rejected() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let tm = TransformManager::new();
        assert!(tm.apply(&mut f, b, 0).is_err());
    }

    #[test]
    fn apply_wires_a_replacement_copy_destroys_the_original_and_patches_the_consumer() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let src = f.new_varnode(addr(0x10), 1, FlowRole::Free);
        let orig = f.create_op(b, 0, addr(0x100), 0, OpCode::Copy, 1).unwrap();
        f.op_set_input(orig, 0, src).unwrap();
        let sink = f.new_varnode(addr(0x20), 1, FlowRole::Free);
        f.op_set_output(orig, sink).unwrap();
        let consumer = f.create_op(b, 1, addr(0x104), 0, OpCode::IntNegate, 1).unwrap();
        f.op_set_input(consumer, 0, sink).unwrap();

        let mut tm = TransformManager::new();
        let in_var = tm.preexisting(src, 8);
        let new_op = tm.new_op_replace(OpCode::Copy, 1, orig);
        tm.op_set_input(new_op, 0, in_var).unwrap();
        let out_var = tm.new_unique(8);
        tm.op_set_output(new_op, out_var).unwrap();
        tm.add_patch(PatchKind::CopyToLogical, consumer, Some(0), out_var);

        tm.apply(&mut f, b, 0).unwrap();
        assert!(f.op(orig).is_none());
        assert_eq!(f.blocks.get(b).ops.len(), 2);
        let consumer_after = f.op(consumer).unwrap();
        assert_ne!(consumer_after.inputs[0], sink);
    }
}
