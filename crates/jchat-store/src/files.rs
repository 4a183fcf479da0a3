use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use jchat_shared::types::is_valid_name;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => return Err(StoreError::PathTraversal),
            _ => {} // RootDir, CurDir, Prefix: skip
        }
    }
    if !resolved.starts_with(base) {
        return Err(StoreError::PathTraversal);
    }
    Ok(resolved)
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Uploaded files, laid out as `<base>/<sender>/<receiver>/<file_name>`.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        info!(path = %base_path.display(), "File store initialized");
        Ok(Self { base_path })
    }

    /// Store a new file. A second upload with the same name for the same
    /// sender/receiver pair fails with [`StoreError::AlreadyExists`].
    pub fn store(&self, sender: &str, receiver: &str, file_name: &str, data: &[u8]) -> Result<()> {
        let path = self.file_path(sender, receiver, file_name)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StoreError::AlreadyExists(file_name.to_string()),
                _ => StoreError::Io(e),
            })?;
        file.write_all(data)?;
        file.flush()?;

        debug!(sender, receiver, file = file_name, size = data.len(), "Stored file");
        Ok(())
    }

    /// Read a file previously uploaded by `sender` for `receiver`.
    pub fn load(&self, sender: &str, receiver: &str, file_name: &str) -> Result<Bytes> {
        let path = self.file_path(sender, receiver, file_name)?;
        match fs::read(&path) {
            Ok(data) => {
                debug!(sender, receiver, file = file_name, size = data.len(), "Loaded file");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(file_name.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn file_path(&self, sender: &str, receiver: &str, file_name: &str) -> Result<PathBuf> {
        check_name(sender)?;
        check_name(receiver)?;
        check_name(file_name)?;
        let target = self.base_path.join(sender).join(receiver).join(file_name);
        ensure_within(&self.base_path, &target)
    }
}
