//! Error taxonomy for the core.
//!
//! Two of the four categories in the taxonomy are modeled as values, not
//! errors: *analysis failure* is a `RuleAction`/`bool`/count return of zero,
//! and *user warning* is a [`crate::types::warning::TypeWarning`] attached to
//! the offending `Datatype`. Only *invariant violation* and *emulation
//! failure* are [`PcodeError`], propagated as `anyhow::Error` so call sites
//! can add context with `.context("Type::Pointer")` as it propagates up.

use std::fmt;

use crate::pcodeop::SeqNum;

/// Which of the two fatal categories an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcodeErrorKind {
    /// Duplicate type id, out-of-order fields, shared sequence number, ...
    InvariantViolation,
    /// Unimplemented op, invalid constant collapse during emulation.
    Emulation,
}

impl fmt::Display for PcodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvariantViolation => write!(f, "invariant violation"),
            Self::Emulation => write!(f, "emulation failure"),
        }
    }
}

/// A fatal error, carrying enough context to identify the failing
/// function: a type name and/or an op seqnum when available.
#[derive(Debug, Clone)]
pub struct PcodeError {
    pub kind: PcodeErrorKind,
    pub message: String,
    pub type_name: Option<String>,
    pub seqnum: Option<SeqNum>,
}

impl PcodeError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self {
            kind: PcodeErrorKind::InvariantViolation,
            message: message.into(),
            type_name: None,
            seqnum: None,
        }
    }

    pub fn emulation(message: impl Into<String>) -> Self {
        Self {
            kind: PcodeErrorKind::Emulation,
            message: message.into(),
            type_name: None,
            seqnum: None,
        }
    }

    pub fn with_type(mut self, name: impl Into<String>) -> Self {
        self.type_name = Some(name.into());
        self
    }

    pub fn with_seqnum(mut self, seq: SeqNum) -> Self {
        self.seqnum = Some(seq);
        self
    }
}

impl fmt::Display for PcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(name) = &self.type_name {
            write!(f, " (type {name})")?;
        }
        if let Some(seq) = &self.seqnum {
            write!(f, " (op {seq:?})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PcodeError {}

/// Outcome of an `Action`/`Rule` application: the silent zero-change return
/// that makes "analysis failure" recoverable rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleAction {
    changes: u32,
}

impl RuleAction {
    pub const NONE: Self = Self { changes: 0 };

    pub fn made(count: u32) -> Self {
        Self { changes: count }
    }

    pub fn did_anything(&self) -> bool {
        self.changes > 0
    }

    pub fn count(&self) -> u32 {
        self.changes
    }
}

impl std::ops::AddAssign for RuleAction {
    fn add_assign(&mut self, rhs: Self) {
        self.changes += rhs.changes;
    }
}
