//! The concrete rewrite library (component table "Rewrite library —
//! the concrete passes"): the canonical consumer family that exercises the
//! bank, the type factory, and the transform manager.

pub mod condexec;
pub mod lanedivide;
pub mod splitdatatype;
pub mod subfloat;
pub mod subvar;

pub use condexec::ConditionalExecution;
pub use lanedivide::LaneDivide;
pub use splitdatatype::SplitDatatype;
pub use subfloat::SubfloatFlow;
pub use subvar::SubvarFlow;
