//! Typed addresses in named address spaces (`AddrSpace`/`Address`).

use std::cmp::Ordering;
use std::fmt;

use anyhow::{anyhow, Result};

/// Index of an [`AddrSpace`] within a single run. Indices are dense and
/// globally unique for the lifetime of one `Funcdata`/`TypeFactory` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A named region of addressable memory.
///
/// Invariant: `word_size >= 1`; `CONSTANT`/`UNIQUE`/`IOP` spaces are marked
/// with their respective capability flag and are mutually exclusive.
#[derive(Debug, Clone)]
pub struct AddrSpace {
    pub index: SpaceIndex,
    pub name: String,
    /// Bytes per addressable unit, almost always 1.
    pub word_size: u32,
    /// Pointer width into this space, in bytes.
    pub byte_size: u32,
    pub endian: Endian,
    pub heritaged: bool,
    pub hosts_dead_code: bool,
    pub is_constant: bool,
    pub is_unique: bool,
    pub is_iop: bool,
}

impl AddrSpace {
    pub fn new(index: SpaceIndex, name: impl Into<String>, byte_size: u32, endian: Endian) -> Result<Self> {
        if byte_size == 0 {
            return Err(anyhow!("AddrSpace {} has zero byte_size", name.into()));
        }
        Ok(Self {
            index,
            name: name.into(),
            word_size: 1,
            byte_size,
            endian,
            heritaged: false,
            hosts_dead_code: false,
            is_constant: false,
            is_unique: false,
            is_iop: false,
        })
    }

    pub fn constant(index: SpaceIndex, byte_size: u32) -> Result<Self> {
        let mut space = Self::new(index, "const", byte_size, Endian::Little)?;
        space.is_constant = true;
        Ok(space)
    }

    pub fn unique(index: SpaceIndex, byte_size: u32) -> Result<Self> {
        let mut space = Self::new(index, "unique", byte_size, Endian::Little)?;
        space.is_unique = true;
        Ok(space)
    }

    pub fn iop(index: SpaceIndex, byte_size: u32) -> Result<Self> {
        let mut space = Self::new(index, "iop", byte_size, Endian::Little)?;
        space.is_iop = true;
        Ok(space)
    }

    pub fn is_big_endian(&self) -> bool {
        self.endian == Endian::Big
    }

    /// The addressable range of this space, as a bit count; used to
    /// truncate offsets on renormalization.
    fn address_bits(&self) -> u32 {
        (self.byte_size * 8).min(64)
    }

    fn address_mask(&self) -> u64 {
        if self.address_bits() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.address_bits()) - 1
        }
    }
}

/// A pair `(space, offset)`. Compares lexicographically by `(space.index,
/// offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub space: SpaceIndex,
    pub offset: u64,
}

impl Address {
    pub fn new(space: SpaceIndex, offset: u64) -> Self {
        Self { space, offset }
    }

    /// Truncate `offset` modulo the given space's addressable range.
    pub fn renormalize(&self, space: &AddrSpace) -> Self {
        debug_assert_eq!(self.space, space.index);
        Self {
            space: self.space,
            offset: self.offset & space.address_mask(),
        }
    }

    pub fn add(&self, space: &AddrSpace, delta: i64) -> Self {
        let raw = self.offset.wrapping_add(delta as u64);
        Self {
            space: self.space,
            offset: raw & space.address_mask(),
        }
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.space.cmp(&other.space).then(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space{}:{:#x}", self.space.0, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_orders_by_space_then_offset() {
        let a = Address::new(SpaceIndex(0), 0x100);
        let b = Address::new(SpaceIndex(0), 0x200);
        let c = Address::new(SpaceIndex(1), 0x000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn renormalize_truncates_offset() {
        let space = AddrSpace::new(SpaceIndex(0), "ram", 2, Endian::Little).unwrap();
        let addr = Address::new(SpaceIndex(0), 0x1_0001);
        assert_eq!(addr.renormalize(&space).offset, 0x0001);
    }

    #[test]
    fn rejects_zero_byte_size() {
        assert!(AddrSpace::new(SpaceIndex(0), "bad", 0, Endian::Little).is_err());
    }
}
