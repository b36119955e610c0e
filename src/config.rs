//! Tablespace configuration
//!
//! Configuration is plain data with serde support so it can live in a TOML
//! file next to the tablespace:
//!
//! ```toml
//! space_id = 12
//! page_size = 16384
//! initial_size = 256
//! autoextend = true
//! max_size = 65536
//! kind = "undo"
//! ```

use crate::error::{Result, SpaceError};
use crate::page::EXTENT_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MIN_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 65536;
pub const DEFAULT_PAGE_SIZE: u32 = 16384;

/// What the tablespace is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    /// Ordinary data tablespace
    General,
    /// Append-heavy undo tablespace with an adaptive growth schedule
    Undo,
    /// Never durable; mini-transactions skip redo logging
    Temporary,
}

/// What to do once allocator corruption has been detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Log the diagnostic dump and abort the process
    Abort,
    /// Return [`SpaceError::Corruption`] to the caller
    Propagate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Tablespace id stamped into every page
    pub space_id: u32,

    /// Physical page size in bytes
    pub page_size: u32,

    /// Size in pages when the tablespace is created
    pub initial_size: u32,

    /// Whether the file may grow when free extents run out
    pub autoextend: bool,

    /// Hard cap on the file size in pages
    pub max_size: Option<u32>,

    /// Fixed growth increment in pages (multiple of the extent size)
    pub autoextend_increment: Option<u32>,

    pub kind: SpaceKind,

    /// Percent of a segment's reserved pages kept free before it starts
    /// claiming whole extents around the hint
    pub segment_reserve_factor: f64,

    /// Buffer pool capacity in pages
    pub buffer_pool_pages: usize,

    /// Verify page checksums when reading from storage
    pub verify_checksums: bool,

    pub on_corruption: CorruptionPolicy,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        SpaceConfig {
            space_id: 1,
            page_size: DEFAULT_PAGE_SIZE,
            initial_size: 4 * EXTENT_SIZE,
            autoextend: true,
            max_size: None,
            autoextend_increment: None,
            kind: SpaceKind::General,
            segment_reserve_factor: 12.5,
            buffer_pool_pages: 1024,
            verify_checksums: true,
            on_corruption: CorruptionPolicy::Abort,
        }
    }
}

impl SpaceConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SpaceConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(SpaceError::InvalidPageSize(self.page_size));
        }

        if self.initial_size == 0 {
            return Err(SpaceError::InvalidConfig(
                "initial_size must be at least one page".into(),
            ));
        }

        if let Some(max) = self.max_size {
            if max < self.initial_size {
                return Err(SpaceError::InvalidConfig(format!(
                    "max_size ({}) is smaller than initial_size ({})",
                    max, self.initial_size
                )));
            }
        }

        if let Some(increment) = self.autoextend_increment {
            if increment == 0 || increment % EXTENT_SIZE != 0 {
                return Err(SpaceError::InvalidConfig(format!(
                    "autoextend_increment ({}) must be a positive multiple of {}",
                    increment, EXTENT_SIZE
                )));
            }
        }

        if !(0.03..=40.0).contains(&self.segment_reserve_factor) {
            return Err(SpaceError::InvalidConfig(format!(
                "segment_reserve_factor ({}) must be between 0.03 and 40",
                self.segment_reserve_factor
            )));
        }

        if self.buffer_pool_pages < 16 {
            return Err(SpaceError::InvalidConfig(
                "buffer_pool_pages must be at least 16".into(),
            ));
        }

        Ok(())
    }

    pub fn is_temporary(&self) -> bool {
        self.kind == SpaceKind::Temporary
    }

    /// Number of pages covered by one extent descriptor page
    pub fn pages_per_descriptor(&self) -> u32 {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SpaceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.page_size, 16384);
        assert_eq!(config.initial_size, 256);
    }

    #[test]
    fn test_from_toml() {
        let config = SpaceConfig::from_toml_str(
            r#"
            space_id = 12
            page_size = 4096
            autoextend = false
            kind = "undo"
            on_corruption = "propagate"
            "#,
        )
        .unwrap();

        assert_eq!(config.space_id, 12);
        assert_eq!(config.page_size, 4096);
        assert!(!config.autoextend);
        assert_eq!(config.kind, SpaceKind::Undo);
        assert_eq!(config.on_corruption, CorruptionPolicy::Propagate);
        // Unspecified keys keep their defaults
        assert_eq!(config.buffer_pool_pages, 1024);
    }

    #[test]
    fn test_invalid_page_size() {
        let config = SpaceConfig {
            page_size: 10000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SpaceError::InvalidPageSize(10000))
        ));
    }

    #[test]
    fn test_invalid_increment() {
        let config = SpaceConfig {
            autoextend_increment: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SpaceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_max_size_below_initial() {
        let config = SpaceConfig {
            initial_size: 640,
            max_size: Some(128),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.toml");
        std::fs::write(&path, "space_id = 3\nmax_size = 4096\n").unwrap();

        let config = SpaceConfig::load(&path).unwrap();
        assert_eq!(config.space_id, 3);
        assert_eq!(config.max_size, Some(4096));
    }
}
