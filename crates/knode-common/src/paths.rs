//! Standard filesystem paths for Knode.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default data directory for Knode.
pub static KNODE_DATA_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KNODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/knode"))
});

/// Default runtime directory for Knode.
pub static KNODE_RUN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KNODE_RUN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/knode"))
});

/// Standard paths used by the Knode runtime.
#[derive(Debug, Clone)]
pub struct KnodePaths {
    /// Data directory (default: /var/lib/knode).
    pub data: PathBuf,
    /// Runtime directory (default: /run/knode).
    pub run: PathBuf,
}

impl KnodePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with custom data and runtime directories.
    #[must_use]
    pub fn with_dirs(data: impl Into<PathBuf>, run: impl Into<PathBuf>) -> Self {
        Self {
            data: data.into(),
            run: run.into(),
        }
    }

}

impl Default for KnodePaths {
    fn default() -> Self {
        Self {
            data: KNODE_DATA_DIR.clone(),
            run: KNODE_RUN_DIR.clone(),
        }
    }
}
