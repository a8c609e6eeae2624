//! Durable storage for the last received bundle and the guest's storage blob.

use crate::config::GuestConfig;
use crate::error::Result;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File-backed store for the bundle and storage blob.
///
/// Both files are overwritten wholesale through a temporary file and a
/// rename, so a crash mid-write leaves either the old or the new content.
#[derive(Debug, Clone)]
pub struct BundleStore {
    bundle_path: PathBuf,
    storage_path: PathBuf,
}

impl BundleStore {
    pub fn new(bundle_path: impl Into<PathBuf>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            storage_path: storage_path.into(),
        }
    }

    pub fn from_config(config: &GuestConfig) -> Self {
        Self::new(&config.bundle_path, &config.storage_path)
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn save_bundle(&self, bundle: &[u8]) -> Result<()> {
        write_atomic(&self.bundle_path, bundle)?;
        debug!("Persisted {} byte bundle to {:?}", bundle.len(), self.bundle_path);
        Ok(())
    }

    /// The persisted bundle, or `None` if none was ever received
    pub fn load_bundle(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.bundle_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_storage(&self, blob: &str) -> Result<()> {
        write_atomic(&self.storage_path, blob.as_bytes())?;
        debug!("Persisted {} byte storage blob to {:?}", blob.len(), self.storage_path);
        Ok(())
    }

    /// The persisted storage blob, or `None` if nothing was saved yet
    pub fn read_storage(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.storage_path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}
