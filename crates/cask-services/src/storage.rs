//! Storage area — per-client directories of uploaded plaintext.
//!
//! Layout: `{root}/{hex(client_id)}/{file_name}`
//!
//! Uploads are written to `{client dir}/..{random}.part` and renamed over the
//! final path on commit, so a stored file is only ever replaced by a complete
//! upload. Part names contain `..`, which no valid file name can, and have a
//! fixed length whatever the length of the name being uploaded.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use cask_core::wire::ClientId;

const PART_SUFFIX: &str = ".part";

fn part_name() -> String {
    format!("..{}{PART_SUFFIX}", hex::encode(rand::random::<[u8; 8]>()))
}

/// Reject names that could escape the client's directory.
pub fn validate_file_name(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(StorageError::InvalidFileName(name.to_owned()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open the storage area, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::io("create", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn client_dir(&self, client_id: &ClientId) -> PathBuf {
        self.root.join(hex::encode(client_id))
    }

    /// Final path of a stored file.
    pub fn path_for(&self, client_id: &ClientId, file_name: &str) -> Result<PathBuf, StorageError> {
        validate_file_name(file_name)?;
        Ok(self.client_dir(client_id).join(file_name))
    }

    /// Start a fresh upload for (client, file name). Stored files,
    /// including one of the same name, are not touched until `commit`.
    pub async fn begin_upload(
        &self,
        client_id: &ClientId,
        file_name: &str,
    ) -> Result<UploadTarget, StorageError> {
        let final_path = self.path_for(client_id, file_name)?;
        let dir = self.client_dir(client_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io("create", &dir, e))?;

        let part_path = dir.join(part_name());
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
            .map_err(|e| StorageError::io("create", &part_path, e))?;

        Ok(UploadTarget {
            file: Some(file),
            part_path,
            final_path,
            written: 0,
            settled: false,
        })
    }

    /// Delete a stored file. A file that is already gone is not an error.
    pub async fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove", path, e)),
        }
    }
}

/// An in-progress upload. Dropped before it has been committed or aborted,
/// including after a failed commit, the partial file is removed.
#[derive(Debug)]
pub struct UploadTarget {
    file: Option<fs::File>,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    /// Set once the part file has been renamed into place or removed.
    settled: bool,
}

impl UploadTarget {
    pub async fn append(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let Some(file) = self.file.as_mut() else {
            return Err(StorageError::io(
                "write",
                &self.part_path,
                std::io::Error::other("upload already finished"),
            ));
        };
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io("write", &self.part_path, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Plaintext bytes appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Flush and move the upload into place, replacing any previous file.
    pub async fn commit(mut self) -> Result<PathBuf, StorageError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| StorageError::io("flush", &self.part_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| StorageError::io("sync", &self.part_path, e))?;
        }
        fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|e| StorageError::io("rename", &self.part_path, e))?;
        self.settled = true;
        Ok(self.final_path.clone())
    }

    /// Discard the partial upload.
    pub async fn abort(mut self) -> Result<(), StorageError> {
        drop(self.file.take());
        let result = match fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("remove", &self.part_path, e)),
        };
        self.settled = true;
        result
    }
}

impl Drop for UploadTarget {
    fn drop(&mut self) {
        if !self.settled {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}
