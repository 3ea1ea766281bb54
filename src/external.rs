//! Contracts for the collaborators named out of scope below: the
//! instruction translator, the symbol/scope database, the function-prototype
//! subsystem, and the marshaller. The core only ever consumes these through
//! the traits below; no implementation of any of them lives in this crate.

use anyhow::Result;

use crate::opcode::OpCode;
use crate::space::{Address, SpaceIndex};
use crate::types::TypeId;

/// A raw (space, offset, size) triple as the translator emits it, before it
/// is interned into the function's varnode arena (upstream
/// interface: "A varnode triple here is (space, offset, size)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarnodeData {
    pub space: SpaceIndex,
    pub offset: u64,
    pub size: u32,
}

impl VarnodeData {
    pub fn new(space: SpaceIndex, offset: u64, size: u32) -> Self {
        Self { space, offset, size }
    }
}

/// Sink for the raw op triples one instruction decodes into
/// ("translator.oneInstruction(emit, addr) populates a supplied emitter").
pub trait PcodeEmit {
    fn emit(&mut self, opcode: OpCode, output: Option<VarnodeData>, inputs: &[VarnodeData]) -> Result<()>;
}

/// Upstream collaborator: decodes machine instructions into p-code triples.
/// Out of scope for this crate; the core only calls through this
/// trait.
pub trait InstructionTranslator {
    /// Emits zero or more raw op triples for the instruction at `addr` and
    /// returns its length in bytes.
    fn one_instruction(&mut self, emit: &mut dyn PcodeEmit, addr: Address) -> Result<u32>;
}

/// A symbol mapped over an address range, as returned by the symbol/scope
/// database ("queryContainer(addr, size, point)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub address: Address,
    pub size: u32,
    pub name: String,
    pub type_id: Option<TypeId>,
}

/// Upstream collaborator: resolves the smallest mapped symbol entry covering
/// a given address, consulted by the spacebase type's sub-type queries.
pub trait SymbolContainer {
    fn query_container(&self, addr: Address, size: u32, point: Address) -> Option<SymbolEntry>;
}

/// A function call's calling-convention metadata ("provides call
/// specs (input/output locked?, dot-dot-dot?, model name)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    pub model_name: String,
    pub inputs_locked: bool,
    pub outputs_locked: bool,
    pub has_varargs: bool,
    pub param_types: Vec<TypeId>,
    pub return_type: Option<TypeId>,
}

/// Upstream collaborator: the function-prototype/call-spec subsystem.
pub trait PrototypeDatabase {
    fn call_spec(&self, addr: Address) -> Option<CallSpec>;
}

/// An element/attribute-id sink. Wire format is out of scope; only
/// the contract that `decode(encode(t))` round-trips to a structurally
/// equal `t` is specified.
pub trait Encoder {
    fn open_element(&mut self, tag: &str) -> Result<()>;
    fn close_element(&mut self, tag: &str) -> Result<()>;
    fn write_attribute(&mut self, name: &str, value: &str) -> Result<()>;
    fn write_unsigned_attribute(&mut self, name: &str, value: u64) -> Result<()>;
}

/// The reader side of the element/attribute-id scheme.
pub trait Decoder {
    fn open_element(&mut self) -> Result<String>;
    fn close_element(&mut self) -> Result<()>;
    fn read_attribute(&mut self, name: &str) -> Result<Option<String>>;
    fn read_unsigned_attribute(&mut self, name: &str) -> Result<Option<u64>>;
}

/// Implemented by core types and ops that must survive a round trip through
/// the marshaller ("core types and ops expose encode(encoder)/
/// decode(decoder) contracts").
pub trait Marshal: Sized {
    fn encode(&self, encoder: &mut dyn Encoder) -> Result<()>;
    fn decode(decoder: &mut dyn Decoder) -> Result<Self>;
}
