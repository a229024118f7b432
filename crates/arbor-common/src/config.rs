//! Configuration structures for ArborDB indexes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{ArborError, Result};

/// Default degree used when the builder does not specify one.
pub const DEFAULT_DEGREE: usize = 100;

/// Configuration for an ordered index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum key count per node plus one; a node splits on reaching it.
    pub degree: usize,
    /// Metadata file path. Persistence is enabled when present; an existing
    /// file's recorded degree overrides the configured one.
    pub metadata: Option<PathBuf>,
    /// Number of nodes kept resident by the node cache. No cache when absent.
    pub cache_size: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            degree: DEFAULT_DEGREE,
            metadata: None,
            cache_size: None,
        }
    }
}

impl IndexConfig {
    /// Checks that the configuration can produce a working index.
    pub fn validate(&self) -> Result<()> {
        if self.degree < 2 {
            return Err(ArborError::InvalidDegree {
                degree: self.degree,
            });
        }
        Ok(())
    }
}
