//! The factory's warning subsystem. Warnings are attached to the
//! offending `Datatype` and kept for
//! later reporting by the pretty-printer; cleared when the type is
//! destroyed.

use super::TypeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeWarningKind {
    /// `setFields` found two fields overlapping; the later one was dropped.
    OverlappingFieldDropped { dropped_offset: u32 },
    /// `assignEnumValues` saw the same value claimed by two names.
    DuplicateEnumValue { value: u64 },
    /// A varnode narrower than its declared type was padded/truncated to fit.
    TruncationSynthesized { declared: u32, actual: u32 },
    /// A composite's alignment was rounded up to satisfy a member's.
    AlignmentAdjusted { from: u32, to: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeWarning {
    pub on: TypeId,
    pub kind: TypeWarningKind,
}

impl std::fmt::Display for TypeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TypeWarningKind::OverlappingFieldDropped { dropped_offset } => {
                write!(f, "type {:?}: overlapping field at offset {dropped_offset:#x} dropped", self.on)
            }
            TypeWarningKind::DuplicateEnumValue { value } => {
                write!(f, "type {:?}: duplicate enum value {value:#x}", self.on)
            }
            TypeWarningKind::TruncationSynthesized { declared, actual } => {
                write!(f, "type {:?}: truncated from {declared} to {actual} bytes", self.on)
            }
            TypeWarningKind::AlignmentAdjusted { from, to } => {
                write!(f, "type {:?}: alignment adjusted from {from} to {to}", self.on)
            }
        }
    }
}
