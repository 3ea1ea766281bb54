//! SSA values: typed byte-ranges at an address with def/use links
//! (`Varnode`).

use crate::flags_to_struct;
use crate::pcodeop::OpId;
use crate::space::Address;
use crate::types::TypeId;

/// Index of a `Varnode` within a `Funcdata`'s arena. Doubles as the
/// "created-index" flag's payload ("stable indices").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarnodeId(pub u32);

/// Opaque handle to the `HighVariable` a varnode has been merged into.
/// `HighVariable` itself is out of the core's scope; only the
/// back-reference is modeled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HighVariableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntryId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowRole {
    Input,
    Constant,
    Free,
    Written,
    Persistent,
}

/// One (op, slot) pair: a read of a varnode by `op`'s input number `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descendant {
    pub op: OpId,
    pub slot: u32,
}

const ADDRESS_TIED: u32 = 1 << 0;
const AUTO_LIVE: u32 = 1 << 1;
const ADDRESS_FORCE: u32 = 1 << 2;
const MAPPED: u32 = 1 << 3;
const TYPE_LOCKED: u32 = 1 << 4;
const PERSIST: u32 = 1 << 5;
const IMPLIED: u32 = 1 << 6;
const EXPLICIT: u32 = 1 << 7;
const BOOLEAN_OUTPUT: u32 = 1 << 8;
const PROTO_PARTIAL: u32 = 1 << 9;
const PARTIAL_ROOT: u32 = 1 << 10;
const MARKED: u32 = 1 << 11;
const CREATED_INDEX: u32 = 1 << 12;

flags_to_struct!(
    VarnodeFlags, u32,
    ADDRESS_TIED is_address_tied "May be aliased through its address space.",
    AUTO_LIVE auto_live "Considered live even with no direct descendants.",
    ADDRESS_FORCE address_force "Address must be preserved verbatim by the printer.",
    MAPPED mapped "Covered by a symbol map entry.",
    TYPE_LOCKED type_locked "Type must not be overwritten by propagation.",
    PERSIST persist "Outlives the function (global/static storage).",
    IMPLIED implied "Printed inline at its use rather than as a named variable.",
    EXPLICIT explicit "Forced to print as a named variable.",
    BOOLEAN_OUTPUT boolean_output "Output of a comparison; size-1 boolean semantics.",
    PROTO_PARTIAL proto_partial "Root of a data-type-split concatenation.",
    PARTIAL_ROOT partial_root "Synthesized root for a partial-struct/union/enum read.",
    MARKED marked "Scratch mark bit used by rewrite traces.",
    CREATED_INDEX created_index "Synthesized by a rewrite rather than the translator.",
);

/// A bitset of bits that might be nonzero (or, for `consumed`, bits that
/// downstream uses care about). A superset of the true set (`getNZMaskLocal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NZMask(pub u64);

impl NZMask {
    pub fn full(bytes: u32) -> Self {
        let bits = (bytes * 8).min(64);
        if bits >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << bits) - 1)
        }
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn popcount(self) -> u32 {
        self.0.count_ones()
    }
}

/// A typed byte-range with identity (`Varnode`).
///
/// Invariant: if `flow == Written`, `definition` is `Some`; the bank's
/// `op.output` back-reference must point to this varnode's id, enforced by
/// `Funcdata`/`PcodeOpBank` edit primitives, never mutated directly here.
#[derive(Debug, Clone)]
pub struct Varnode {
    pub id: VarnodeId,
    pub address: Address,
    pub size: u32,
    pub flow: FlowRole,
    pub definition: Option<OpId>,
    pub descendants: Vec<Descendant>,
    pub high: Option<HighVariableId>,
    pub nonzero_mask: NZMask,
    pub consumed_mask: NZMask,
    pub data_type: Option<TypeId>,
    pub symbol: Option<SymbolEntryId>,
    pub flags: VarnodeFlags,
}

impl Varnode {
    pub fn new(id: VarnodeId, address: Address, size: u32, flow: FlowRole) -> Self {
        Self {
            id,
            address,
            size,
            flow,
            definition: None,
            descendants: Vec::new(),
            high: None,
            nonzero_mask: NZMask::full(size),
            consumed_mask: NZMask::full(size),
            data_type: None,
            symbol: None,
            flags: VarnodeFlags::empty(),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.flow, FlowRole::Constant)
    }

    pub fn is_written(&self) -> bool {
        matches!(self.flow, FlowRole::Written)
    }

    /// Adds a descendant; returns `false` (not an error) if the pair is
    /// already present, matching the bank's idempotent-edit style.
    pub fn add_descendant(&mut self, op: OpId, slot: u32) -> bool {
        let pair = Descendant { op, slot };
        if self.descendants.contains(&pair) {
            return false;
        }
        self.descendants.push(pair);
        true
    }

    pub fn remove_descendant(&mut self, op: OpId, slot: u32) {
        self.descendants.retain(|d| !(d.op == op && d.slot == slot));
    }
}
