//! Step-level interpreter over the bank (Emulator): "given a
//! memory state and a breakpoint table, execute one p-code op at a time
//! over a translator-produced instruction cache." Used for constant-folding
//! verification and for driving end-to-end execution scenarios.

use std::collections::HashMap;

use anyhow::Result;

use crate::error::PcodeError;
use crate::external::{InstructionTranslator, PcodeEmit, VarnodeData};
use crate::funcdata::Funcdata;
use crate::opcode::{OpBehavior, OpCode};
use crate::pcodeop::{BlockId, OpId};
use crate::space::{Address, AddrSpace, Endian, SpaceIndex};
use crate::varnode::{FlowRole, VarnodeId};

/// Byte-addressable memory, one flat store per address space. Reads of
/// never-written bytes return zero.
#[derive(Default)]
pub struct MemoryState {
    bytes: HashMap<(u32, u64), u8>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bytes(&self, addr: Address, size: u32, endian: Endian) -> u64 {
        let mut value = 0u64;
        for i in 0..size.min(8) {
            let byte_offset = match endian {
                Endian::Little => i,
                Endian::Big => size - 1 - i,
            };
            let byte = self.bytes.get(&(addr.space.0, addr.offset.wrapping_add(byte_offset as u64))).copied().unwrap_or(0);
            value |= (byte as u64) << (i * 8);
        }
        value
    }

    pub fn set_bytes(&mut self, addr: Address, size: u32, value: u64, endian: Endian) {
        for i in 0..size.min(8) {
            let byte_offset = match endian {
                Endian::Little => i,
                Endian::Big => size - 1 - i,
            };
            let byte = ((value >> (i * 8)) & 0xFF) as u8;
            self.bytes.insert((addr.space.0, addr.offset.wrapping_add(byte_offset as u64)), byte);
        }
    }
}

/// A pcode breakpoint fires before a CALLOTHER (or any op whose mnemonic it
/// is registered against) executes; an address breakpoint fires at every
/// instruction boundary reached. Both return whether the normal op action
/// should still run ("A breakpoint's return value decides whether
/// the normal op action still executes").
pub type PcodeBreakpoint = Box<dyn FnMut(&mut Funcdata, &mut MemoryState, OpId) -> Result<bool>>;
pub type AddressBreakpoint = Box<dyn FnMut(&mut Funcdata, &mut MemoryState, Address) -> Result<bool>>;

fn mask_for(bytes: u32) -> u64 {
    let bits = (bytes * 8).min(64);
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// The step-level float complement to [`OpBehavior::evaluate_integer`],
/// which only covers integer opcodes. Only 4- and 8-byte IEEE widths are
/// emulated; anything else is an emulation failure.
fn evaluate_float(opcode: OpCode, inputs: &[u64], sizes: &[u32], out_size: u32) -> Result<u64> {
    fn as_f64(raw: u64, size: u32) -> Result<f64> {
        match size {
            4 => Ok(f32::from_bits(raw as u32) as f64),
            8 => Ok(f64::from_bits(raw)),
            _ => Err(PcodeError::emulation(format!("unsupported float width {size}")).into()),
        }
    }
    fn to_bits(value: f64, size: u32) -> Result<u64> {
        match size {
            4 => Ok((value as f32).to_bits() as u64),
            8 => Ok(value.to_bits()),
            _ => Err(PcodeError::emulation(format!("unsupported float width {size}")).into()),
        }
    }

    use OpCode::*;
    match (opcode, inputs, sizes) {
        (FloatAdd, [a, b], [sa, _]) => to_bits(as_f64(*a, *sa)? + as_f64(*b, *sa)?, out_size),
        (FloatSub, [a, b], [sa, _]) => to_bits(as_f64(*a, *sa)? - as_f64(*b, *sa)?, out_size),
        (FloatMult, [a, b], [sa, _]) => to_bits(as_f64(*a, *sa)? * as_f64(*b, *sa)?, out_size),
        (FloatDiv, [a, b], [sa, _]) => to_bits(as_f64(*a, *sa)? / as_f64(*b, *sa)?, out_size),
        (FloatNeg, [a], [sa]) => to_bits(-as_f64(*a, *sa)?, out_size),
        (FloatAbs, [a], [sa]) => to_bits(as_f64(*a, *sa)?.abs(), out_size),
        (FloatSqrt, [a], [sa]) => to_bits(as_f64(*a, *sa)?.sqrt(), out_size),
        (FloatTrunc, [a], [sa]) => Ok((as_f64(*a, *sa)?.trunc() as i64 as u64) & mask_for(out_size)),
        (FloatCeil, [a], [sa]) => to_bits(as_f64(*a, *sa)?.ceil(), out_size),
        (FloatFloor, [a], [sa]) => to_bits(as_f64(*a, *sa)?.floor(), out_size),
        (FloatRound, [a], [sa]) => to_bits(as_f64(*a, *sa)?.round(), out_size),
        (FloatEqual, [a, b], [sa, _]) => Ok(u64::from(as_f64(*a, *sa)? == as_f64(*b, *sa)?)),
        (FloatNotEqual, [a, b], [sa, _]) => Ok(u64::from(as_f64(*a, *sa)? != as_f64(*b, *sa)?)),
        (FloatLess, [a, b], [sa, _]) => Ok(u64::from(as_f64(*a, *sa)? < as_f64(*b, *sa)?)),
        (FloatLessEqual, [a, b], [sa, _]) => Ok(u64::from(as_f64(*a, *sa)? <= as_f64(*b, *sa)?)),
        (FloatNan, [a], [sa]) => Ok(u64::from(as_f64(*a, *sa)?.is_nan())),
        (FloatInt2Float, [a], [sa]) => to_bits(crate::opcode::OpBehavior::evaluate_integer(OpCode::IntSExt, &[*a], &[*sa], 8).unwrap_or(*a) as i64 as f64, out_size),
        (FloatFloat2Float, [a], [sa]) => to_bits(as_f64(*a, *sa)?, out_size),
        _ => Err(PcodeError::emulation(format!("no float evaluator for {opcode} with {} inputs", inputs.len())).into()),
    }
}

/// Result of [`Emulator::step`]: whether the instruction boundary was
/// crossed, so a driver loop can stop after N instructions rather than N ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    SameInstruction,
    NextInstruction,
    Halted,
}

/// Step-level interpreter. Owns its own memory state and address
/// space table; `Funcdata` supplies the op graph it walks.
pub struct Emulator<'f> {
    f: &'f mut Funcdata,
    memory: MemoryState,
    spaces: Vec<AddrSpace>,
    constant_space: SpaceIndex,
    current: Option<OpId>,
    halted: bool,
    pcode_breaks: HashMap<String, PcodeBreakpoint>,
    addr_breaks: HashMap<Address, AddressBreakpoint>,
    translator: Option<Box<dyn InstructionTranslator>>,
}

impl<'f> Emulator<'f> {
    pub fn new(f: &'f mut Funcdata, spaces: Vec<AddrSpace>) -> Self {
        let constant_space = spaces.iter().find(|s| s.is_constant).map(|s| s.index).unwrap_or(SpaceIndex(0));
        Self {
            f,
            memory: MemoryState::new(),
            spaces,
            constant_space,
            current: None,
            halted: false,
            pcode_breaks: HashMap::new(),
            addr_breaks: HashMap::new(),
            translator: None,
        }
    }

    pub fn memory_mut(&mut self) -> &mut MemoryState {
        &mut self.memory
    }

    pub fn memory(&self) -> &MemoryState {
        &self.memory
    }

    pub fn funcdata(&self) -> &Funcdata {
        self.f
    }

    pub fn set_translator(&mut self, translator: Box<dyn InstructionTranslator>) {
        self.translator = Some(translator);
    }

    pub fn set_pcode_breakpoint(&mut self, mnemonic: impl Into<String>, cb: PcodeBreakpoint) {
        self.pcode_breaks.insert(mnemonic.into(), cb);
    }

    pub fn set_address_breakpoint(&mut self, addr: Address, cb: AddressBreakpoint) {
        self.addr_breaks.insert(addr, cb);
    }

    pub fn set_current_op(&mut self, op: OpId) {
        self.current = Some(op);
        self.halted = false;
    }

    pub fn current_op(&self) -> Option<OpId> {
        self.current
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn space(&self, idx: SpaceIndex) -> Option<&AddrSpace> {
        self.spaces.iter().find(|s| s.index == idx)
    }

    fn endian_of(&self, idx: SpaceIndex) -> Endian {
        self.space(idx).map(|s| s.endian).unwrap_or(Endian::Little)
    }

    fn read_varnode(&self, vn: VarnodeId) -> u64 {
        let v = self.f.varnode(vn);
        if v.is_constant() {
            return v.address.offset & mask_for(v.size);
        }
        self.memory.get_bytes(v.address, v.size, self.endian_of(v.address.space))
    }

    fn write_varnode(&mut self, vn: VarnodeId, value: u64) {
        let v = self.f.varnode(vn);
        let (addr, size, endian) = (v.address, v.size, self.endian_of(v.address.space));
        self.memory.set_bytes(addr, size, value, endian);
    }

    /// Resolves a branch/call destination operand to an absolute `Address`:
    /// BRANCH/CBRANCH take a relative destination when the target is a
    /// constant space offset, else absolute.
    fn resolve_destination(&self, vn: VarnodeId, from: Address) -> Address {
        let v = self.f.varnode(vn);
        if v.is_constant() {
            let space = self.space(from.space);
            let delta = v.address.offset as i64;
            match space {
                Some(s) => from.add(s, delta),
                None => Address::new(from.space, (from.offset as i64 + delta) as u64),
            }
        } else {
            v.address
        }
    }

    /// Runs the translator (if any) to populate a fresh cache of ops for the
    /// instruction at `addr`, appended to `block`. Returns the first op of
    /// the new cache.
    fn translate_at(&mut self, block: BlockId, addr: Address) -> Result<OpId> {
        let Some(mut translator) = self.translator.take() else {
            return Err(PcodeError::emulation(format!("instruction cache exhausted at {addr} with no translator installed")).into());
        };
        let position = self.f.blocks.get(block).ops.len();
        let mut emit =
            FuncdataEmit { f: &mut *self.f, block, position, order: 0, constant_space: self.constant_space, instr_addr: addr, first: None };
        let result = translator.one_instruction(&mut emit, addr);
        let first = emit.first;
        self.translator = Some(translator);
        result?;
        first.ok_or_else(|| PcodeError::emulation(format!("translator emitted no ops at {addr}")).into())
    }

    /// Advances past one p-code op (state machine). Fetches the
    /// behavior, dispatches unary/binary ops through `OpBehavior`/the float
    /// evaluator, and handles the special opcodes by name.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.halted {
            return Ok(StepOutcome::Halted);
        }
        let op_id = match self.current {
            Some(id) => id,
            None => return Err(PcodeError::emulation("step called with no current op").into()),
        };
        let op = self.f.op(op_id).ok_or_else(|| PcodeError::emulation(format!("step: op {op_id:?} no longer exists")))?.clone();

        if op.seq.order == 0 {
            if let Some(mut cb) = self.addr_breaks.remove(&op.seq.address) {
                let run = cb(self.f, &mut self.memory, op.seq.address)?;
                self.addr_breaks.insert(op.seq.address, cb);
                if !run {
                    return self.advance_past(op_id, op.seq.address);
                }
            }
        }

        match op.opcode {
            OpCode::Load => self.do_load(&op)?,
            OpCode::Store => self.do_store(&op)?,
            OpCode::Branch => {
                let dest = self.resolve_destination(op.inputs[0], op.seq.address);
                self.jump_to(dest)?;
                return Ok(StepOutcome::NextInstruction);
            }
            OpCode::CBranch => {
                let cond = self.read_varnode(op.inputs[1]);
                if cond != 0 {
                    let dest = self.resolve_destination(op.inputs[0], op.seq.address);
                    self.jump_to(dest)?;
                    return Ok(StepOutcome::NextInstruction);
                }
                return self.advance_past(op_id, op.seq.address);
            }
            OpCode::BranchInd | OpCode::CallInd => {
                let target_offset = self.read_varnode(op.inputs[0]);
                let dest = Address::new(op.seq.address.space, target_offset);
                self.jump_to(dest)?;
                return Ok(StepOutcome::NextInstruction);
            }
            OpCode::Call => {
                let dest = self.resolve_destination(op.inputs[0], op.seq.address);
                self.jump_to(dest)?;
                return Ok(StepOutcome::NextInstruction);
            }
            OpCode::CallOther => {
                let name = self.callother_name(&op);
                if let Some(mut cb) = self.pcode_breaks.remove(&name) {
                    let run = cb(self.f, &mut self.memory, op_id)?;
                    self.pcode_breaks.insert(name, cb);
                    if !run {
                        return self.advance_past(op_id, op.seq.address);
                    }
                }
                return Err(PcodeError::emulation(format!("CALLOTHER {name} has no registered breakpoint")).with_seqnum(op.seq).into());
            }
            OpCode::MultiEqual => {
                // No predecessor tracking at the step level: take the first
                // operand, matching the entry-edge convention used when a
                // function is emulated from its start.
                if let (Some(&src), Some(out)) = (op.inputs.first(), op.output) {
                    let v = self.read_varnode(src);
                    self.write_varnode(out, v);
                }
            }
            OpCode::Indirect => {
                if let (Some(&src), Some(out)) = (op.inputs.first(), op.output) {
                    let v = self.read_varnode(src);
                    self.write_varnode(out, v);
                }
            }
            OpCode::SegmentOp | OpCode::CPoolRef | OpCode::New => {
                return Err(PcodeError::emulation(format!("{} has no emulation semantics", op.opcode)).with_seqnum(op.seq).into());
            }
            OpCode::Return => {
                self.halted = true;
                return Ok(StepOutcome::Halted);
            }
            _ => self.do_arithmetic(&op)?,
        }

        self.advance_past(op_id, op.seq.address)
    }

    fn callother_name(&self, op: &crate::pcodeop::PcodeOp) -> String {
        op.inputs.first().map(|&vn| format!("callother_{}", self.f.varnode(vn).address.offset)).unwrap_or_else(|| "callother".to_string())
    }

    fn do_load(&mut self, op: &crate::pcodeop::PcodeOp) -> Result<()> {
        let space_idx = SpaceIndex(self.f.varnode(op.inputs[0]).address.offset as u32);
        let offset = self.read_varnode(op.inputs[1]);
        let Some(out) = op.output else { return Ok(()) };
        let size = self.f.varnode(out).size;
        let endian = self.endian_of(space_idx);
        let value = self.memory.get_bytes(Address::new(space_idx, offset), size, endian);
        self.write_varnode(out, value);
        Ok(())
    }

    fn do_store(&mut self, op: &crate::pcodeop::PcodeOp) -> Result<()> {
        let space_idx = SpaceIndex(self.f.varnode(op.inputs[0]).address.offset as u32);
        let offset = self.read_varnode(op.inputs[1]);
        let value = self.read_varnode(op.inputs[2]);
        let size = self.f.varnode(op.inputs[2]).size;
        let endian = self.endian_of(space_idx);
        self.memory.set_bytes(Address::new(space_idx, offset), size, value, endian);
        Ok(())
    }

    fn do_arithmetic(&mut self, op: &crate::pcodeop::PcodeOp) -> Result<()> {
        let Some(out) = op.output else {
            return Err(PcodeError::emulation(format!("{} has no output and no special handling", op.opcode)).with_seqnum(op.seq).into());
        };
        let values: Vec<u64> = op.inputs.iter().map(|&vn| self.read_varnode(vn)).collect();
        let sizes: Vec<u32> = op.inputs.iter().map(|&vn| self.f.varnode(vn).size).collect();
        let out_size = self.f.varnode(out).size;
        let is_float = matches!(
            op.opcode,
            OpCode::FloatAdd
                | OpCode::FloatSub
                | OpCode::FloatMult
                | OpCode::FloatDiv
                | OpCode::FloatNeg
                | OpCode::FloatAbs
                | OpCode::FloatSqrt
                | OpCode::FloatTrunc
                | OpCode::FloatCeil
                | OpCode::FloatFloor
                | OpCode::FloatRound
                | OpCode::FloatEqual
                | OpCode::FloatNotEqual
                | OpCode::FloatLess
                | OpCode::FloatLessEqual
                | OpCode::FloatNan
                | OpCode::FloatInt2Float
                | OpCode::FloatFloat2Float
        );
        let result = if is_float {
            evaluate_float(op.opcode, &values, &sizes, out_size)?
        } else {
            OpBehavior::evaluate_integer(op.opcode, &values, &sizes, out_size).map_err(|e| PcodeError::emulation(e.to_string()).with_seqnum(op.seq))?
        };
        self.write_varnode(out, result);
        Ok(())
    }

    fn jump_to(&mut self, dest: Address) -> Result<()> {
        match self.f.bank().target(dest) {
            Ok(op) => {
                self.current = Some(op);
                Ok(())
            }
            Err(_) => {
                let Some(parent) = self.current.and_then(|c| self.f.op(c)).and_then(|o| o.parent) else {
                    return Err(PcodeError::emulation(format!("no block to extend instruction cache at {dest}")).into());
                };
                let op = self.translate_at(parent, dest)?;
                self.current = Some(op);
                Ok(())
            }
        }
    }

    /// Moves `current` to the sequential next op after `op_id`, translating
    /// a fresh instruction if the cache is exhausted: the next instruction
    /// at the current address is translated and the cache reset.
    fn advance_past(&mut self, op_id: OpId, addr: Address) -> Result<StepOutcome> {
        if let Some(next) = self.f.fallthru(op_id) {
            let next_is_new_instruction = self.f.op(next).map(|o| o.seq.order == 0).unwrap_or(true);
            self.current = Some(next);
            return Ok(if next_is_new_instruction { StepOutcome::NextInstruction } else { StepOutcome::SameInstruction });
        }
        let Some(parent) = self.f.op(op_id).and_then(|o| o.parent) else {
            self.halted = true;
            return Ok(StepOutcome::Halted);
        };
        let next_addr = Address::new(addr.space, addr.offset + 1);
        match self.translate_at(parent, next_addr) {
            Ok(op) => {
                self.current = Some(op);
                Ok(StepOutcome::NextInstruction)
            }
            Err(_) => {
                self.halted = true;
                Ok(StepOutcome::Halted)
            }
        }
    }
}

/// Adapter handing a translator somewhere to append ops into a live
/// `Funcdata` block (`PcodeEmit`).
struct FuncdataEmit<'a> {
    f: &'a mut Funcdata,
    block: BlockId,
    position: usize,
    order: u32,
    constant_space: SpaceIndex,
    instr_addr: Address,
    first: Option<OpId>,
}

impl PcodeEmit for FuncdataEmit<'_> {
    fn emit(&mut self, opcode: OpCode, output: Option<VarnodeData>, inputs: &[VarnodeData]) -> Result<()> {
        let op = self.f.create_op(self.block, self.position, self.instr_addr, self.order, opcode, inputs.len())?;
        for (slot, vd) in inputs.iter().enumerate() {
            let role = if vd.space == self.constant_space { FlowRole::Constant } else { FlowRole::Free };
            let vn = self.f.new_varnode(Address::new(vd.space, vd.offset), vd.size, role);
            self.f.op_set_input(op, slot, vn)?;
        }
        if let Some(vd) = output {
            let vn = self.f.new_varnode(Address::new(vd.space, vd.offset), vd.size, FlowRole::Free);
            self.f.op_set_output(op, vn)?;
        }
        self.position += 1;
        self.order += 1;
        if self.first.is_none() {
            self.first = Some(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceIndex as Space;
    use crate::varnode::FlowRole;

    fn addr(off: u64) -> Address {
        Address::new(Space(0), off)
    }

    fn ram_space() -> AddrSpace {
        AddrSpace::new(Space(0), "ram", 8, Endian::Little).unwrap()
    }

    fn const_space() -> AddrSpace {
        AddrSpace::constant(Space(1), 8).unwrap()
    }

    /// memory[0x10]=5, memory[0x18]=7, execute an ADD reading them and
    /// writing memory[0x20]; assert the sum and the sequential fallthrough.
    #[test]
    fn emulator_step_scenario_executes_add_and_advances() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let space_const = f.new_varnode(Address::new(Space(1), 0), 8, FlowRole::Constant);
        // The pointer operands carry their target offset as an immediate
        // (FlowRole::Constant), not as a value to be read back out of
        // memory at that same address.
        let ptr_a = f.new_varnode(addr(0x10), 8, FlowRole::Constant);
        let ptr_b = f.new_varnode(addr(0x18), 8, FlowRole::Constant);
        let a_val = f.new_varnode(addr(0x10), 8, FlowRole::Free);
        let b_val = f.new_varnode(addr(0x18), 8, FlowRole::Free);

        let load_a = f.create_op(b, 0, addr(0x100), 0, OpCode::Load, 2).unwrap();
        f.op_set_input(load_a, 0, space_const).unwrap();
        f.op_set_input(load_a, 1, ptr_a).unwrap();
        f.op_set_output(load_a, a_val).unwrap();

        let load_b = f.create_op(b, 1, addr(0x100), 1, OpCode::Load, 2).unwrap();
        f.op_set_input(load_b, 0, space_const).unwrap();
        f.op_set_input(load_b, 1, ptr_b).unwrap();
        f.op_set_output(load_b, b_val).unwrap();

        let add = f.create_op(b, 2, addr(0x100), 2, OpCode::IntAdd, 2).unwrap();
        f.op_set_input(add, 0, a_val).unwrap();
        f.op_set_input(add, 1, b_val).unwrap();
        let sum = f.new_varnode(addr(0x20), 8, FlowRole::Free);
        f.op_set_output(add, sum).unwrap();

        let next = f.create_op(b, 3, addr(0x104), 0, OpCode::Copy, 1).unwrap();
        f.op_set_input(next, 0, sum).unwrap();
        let copy_out = f.new_varnode(addr(0x28), 8, FlowRole::Free);
        f.op_set_output(next, copy_out).unwrap();

        let mut emu = Emulator::new(&mut f, vec![ram_space(), const_space()]);
        emu.memory_mut().set_bytes(addr(0x10), 8, 5, Endian::Little);
        emu.memory_mut().set_bytes(addr(0x18), 8, 7, Endian::Little);
        emu.set_current_op(load_a);

        emu.step().unwrap();
        emu.step().unwrap();
        emu.step().unwrap();
        assert_eq!(emu.memory().get_bytes(addr(0x20), 8, Endian::Little), 12);
        assert_eq!(emu.current_op(), Some(next));
    }

    #[test]
    fn callother_without_a_breakpoint_is_an_emulation_failure() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::CallOther, 1).unwrap();
        let sel = f.new_varnode(Address::new(Space(1), 3), 4, FlowRole::Constant);
        f.op_set_input(op, 0, sel).unwrap();

        let mut emu = Emulator::new(&mut f, vec![ram_space(), const_space()]);
        emu.set_current_op(op);
        assert!(emu.step().is_err());
    }

    #[test]
    fn callother_breakpoint_suppresses_the_fatal_error() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let op = f.create_op(b, 0, addr(0x100), 0, OpCode::CallOther, 1).unwrap();
        let sel = f.new_varnode(Address::new(Space(1), 3), 4, FlowRole::Constant);
        f.op_set_input(op, 0, sel).unwrap();
        let next = f.create_op(b, 1, addr(0x104), 0, OpCode::Copy, 1).unwrap();
        let src = f.new_varnode(addr(0x30), 4, FlowRole::Free);
        f.op_set_input(next, 0, src).unwrap();
        let dst = f.new_varnode(addr(0x34), 4, FlowRole::Free);
        f.op_set_output(next, dst).unwrap();

        let mut emu = Emulator::new(&mut f, vec![ram_space(), const_space()]);
        emu.set_pcode_breakpoint("callother_3", Box::new(|_, _, _| Ok(false)));
        emu.set_current_op(op);
        let outcome = emu.step().unwrap();
        assert_eq!(outcome, StepOutcome::NextInstruction);
        assert_eq!(emu.current_op(), Some(next));
    }

    #[test]
    fn cbranch_taken_jumps_to_destination() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        let cond = f.new_varnode(addr(0x10), 1, FlowRole::Free);
        // A non-constant-space destination varnode is an absolute address;
        // it only resolves as relative when the target sits in the
        // constant space.
        let dest = f.new_varnode(addr(0x200), 8, FlowRole::Free);
        let cbranch = f.create_op(b, 0, addr(0x100), 0, OpCode::CBranch, 2).unwrap();
        f.op_set_input(cbranch, 0, dest).unwrap();
        f.op_set_input(cbranch, 1, cond).unwrap();
        let target = f.create_op(b, 1, addr(0x200), 0, OpCode::Return, 0).unwrap();
        let _ = target;

        let mut emu = Emulator::new(&mut f, vec![ram_space(), const_space()]);
        emu.memory_mut().set_bytes(addr(0x10), 1, 1, Endian::Little);
        emu.set_current_op(cbranch);
        let outcome = emu.step().unwrap();
        assert_eq!(outcome, StepOutcome::NextInstruction);
        assert_eq!(emu.current_op(), Some(target));
    }
}
