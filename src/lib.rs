#![forbid(unsafe_code)]
//! A binary-decompiler back-end core: the p-code intermediate
//! representation and its bank, the SSA-preserving rewrite engine, and the
//! content-deduplicated data-type lattice.
//!
//! The three subsystems named above are implemented in full; a family of
//! rewrite rules (conditional-execution simplification, sub-variable flow
//! narrowing, data-type-aware copy/load/store splitting, and lane division)
//! is included as their canonical consumer.

pub mod action;
pub mod bank;
pub mod block;
pub mod config;
pub mod emulate;
pub mod error;
pub mod external;
pub mod funcdata;
pub mod marshal;
pub mod opcode;
pub mod pcodeop;
pub mod rules;
pub mod space;
pub mod transform;
pub mod types;
pub mod varnode;

/// Declares a checked bitset newtype over an integer: `from_raw` rejects
/// unknown bits instead of silently masking them.
#[macro_export]
macro_rules! flag_to_function {
    ($flag_name:ident $fun_name:ident $comment:literal) => {
        #[doc = $comment]
        pub fn $fun_name(&self) -> bool {
            self.0 & Self::$flag_name != 0
        }
    };
}

#[macro_export]
macro_rules! flags_to_struct {
    ($struct_name:ident, $struct_type:ty, $($flag_name:ident $flag_fun_name:ident $flag_doc:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
        pub struct $struct_name(pub(crate) $struct_type);
        impl $struct_name {
            $(
                pub const $flag_name: $struct_type = $flag_name;
            )*

            pub fn from_raw(value: $struct_type) -> anyhow::Result<Self> {
                let invalid_bits = value & !(0 $(| $flag_name)*);
                if invalid_bits != 0 {
                    Err(anyhow::anyhow!("Flag {} with invalid bits {invalid_bits:X}", stringify!($struct_name)))
                } else {
                    Ok(Self(value))
                }
            }

            pub fn empty() -> Self {
                Self(0)
            }

            pub fn into_raw(&self) -> $struct_type {
                self.0
            }

            pub fn set(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn clear(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            $(
                $crate::flag_to_function!($flag_name $flag_fun_name $flag_doc);
            )*
        }
    }
}

pub use error::{PcodeError, PcodeErrorKind, RuleAction};
