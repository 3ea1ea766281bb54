//! Architecture parameters loaded once per run (Configuration).
//!
//! `ArchConfig` is either built directly by an embedder that already knows
//! its target architecture (mirroring how `til::new_from_id0` assembles a
//! header in-process) or decoded from a small TOML file via `serde`/`toml`
//! for the `pcode-tools` CLI.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::space::{AddrSpace, Endian, SpaceIndex};

/// One address space entry as it appears in a config file, before it is
/// turned into a dense-indexed [`AddrSpace`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub name: String,
    pub byte_size: u32,
    #[serde(default)]
    pub big_endian: bool,
    #[serde(default)]
    pub is_constant: bool,
    #[serde(default)]
    pub is_unique: bool,
}

impl SpaceConfig {
    fn endian(&self) -> Endian {
        if self.big_endian { Endian::Big } else { Endian::Little }
    }
}

/// Architecture parameters a `Funcdata`/`TypeFactory` pair is built against:
/// the address space table, default endianness, and the data-type lattice's
/// base-type size ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchConfig {
    pub name: String,
    pub spaces: Vec<SpaceConfig>,
    /// Largest primitive width the type factory will intern directly,
    /// beyond which a type must be expressed as a composite.
    pub max_basetype_size: u32,
    #[serde(default)]
    pub big_endian: bool,
}

impl ArchConfig {
    /// A minimal single-space little-endian configuration, useful for tests
    /// and tools that don't care about a real target.
    pub fn generic(default_space_byte_size: u32) -> Self {
        Self {
            name: "generic".to_string(),
            spaces: vec![SpaceConfig {
                name: "ram".to_string(),
                byte_size: default_space_byte_size,
                big_endian: false,
                is_constant: false,
                is_unique: false,
            }],
            max_basetype_size: 8,
            big_endian: false,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing ArchConfig TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.spaces.is_empty() {
            anyhow::bail!("ArchConfig {} declares no address spaces", self.name);
        }
        if self.max_basetype_size == 0 {
            anyhow::bail!("ArchConfig {} has a zero max_basetype_size", self.name);
        }
        Ok(())
    }

    /// Materializes the configured spaces into a dense-indexed table, in
    /// declaration order.
    pub fn build_spaces(&self) -> Result<Vec<AddrSpace>> {
        self.spaces
            .iter()
            .enumerate()
            .map(|(i, sc)| {
                let index = SpaceIndex(i as u32);
                let mut space = AddrSpace::new(index, sc.name.clone(), sc.byte_size, sc.endian())?;
                space.is_constant = sc.is_constant;
                space.is_unique = sc.is_unique;
                Ok(space)
            })
            .collect()
    }
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn generic_config_is_valid_and_builds_one_space() {
        let cfg = ArchConfig::generic(8);
        let spaces = cfg.build_spaces().unwrap();
        assert_eq!(spaces.len(), 1);
        assert_eq!(spaces[0].byte_size, 8);
        assert!(!spaces[0].is_big_endian());
    }

    #[test]
    fn round_trips_through_toml() {
        let text = r#"
            name = "x86_64"
            max_basetype_size = 8
            big_endian = false

            [[spaces]]
            name = "ram"
            byte_size = 8

            [[spaces]]
            name = "register"
            byte_size = 8

            [[spaces]]
            name = "const"
            byte_size = 8
            is_constant = true
        "#;
        let cfg = ArchConfig::from_toml_str(text).unwrap();
        assert_eq!(cfg.spaces.len(), 3);
        assert!(cfg.spaces[2].is_constant);
        let spaces = cfg.build_spaces().unwrap();
        assert_eq!(spaces[1].name, "register");
        assert!(spaces[2].is_constant);
    }

    #[test]
    fn rejects_a_config_with_no_spaces() {
        let text = r#"
            name = "empty"
            max_basetype_size = 8
            spaces = []
        "#;
        assert!(ArchConfig::from_toml_str(text).is_err());
    }
}
