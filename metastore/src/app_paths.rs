use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable redirecting the storage root, used by tests and
/// side-by-side installs.
pub const DATA_DIR_ENV: &str = "MIGRATION_APP_DATA_DIR";

/// The per-user storage root and the well-known files under it.
///
/// Resolved once at startup and passed explicitly to whoever needs a path.
#[derive(Debug, Clone)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Resolves the storage root from `MIGRATION_APP_DATA_DIR`, falling back
    /// to the platform data directory. Creates the directory tree.
    pub fn resolve() -> Result<Self> {
        let root = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .context("no local data directory for the current user")?
                .join("partmig"),
        };
        Self::at(root)
    }

    /// Uses `root` as the storage root, creating it if needed.
    pub fn at(root: PathBuf) -> Result<Self> {
        let paths = Self { root };
        std::fs::create_dir_all(paths.root())
            .with_context(|| format!("creating data directory {}", paths.root().display()))?;
        std::fs::create_dir_all(paths.log_dir())
            .with_context(|| format!("creating log directory {}", paths.log_dir().display()))?;
        Ok(paths)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The embedded metadata store.
    pub fn db_path(&self) -> PathBuf {
        self.root.join("migration.db")
    }

    /// Daily rotated text logs live under this directory.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// The AEAD key sealing connection secrets.
    pub fn vault_key_path(&self) -> PathBuf {
        self.root.join("vault.key")
    }
}
