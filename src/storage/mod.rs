//! Persistence of received object bytes.
//!
//! The registry only ever stores references returned from here, never the
//! bytes themselves. The trait is the seam for external stores; the bundled
//! implementation writes to a local directory.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// An opaque pointer to a stored object.
pub type StorageRef = String;

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Failed to persist object: {0}")]
	Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// Persists `object` under `key`. Repeating a put for the same key
	/// resolves to the same reference, so retried jobs and re-deliveries
	/// never accumulate copies.
	async fn put(&self, key: &str, object: &[u8]) -> Result<StorageRef, StorageError>;
}

/// Stores each object as one file under a flat directory.
pub struct FilesystemStore {
	root: PathBuf,
}

impl FilesystemStore {
	pub async fn create(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
		let root = root.into();
		tokio::fs::create_dir_all(&root).await?;
		Ok(Self { root })
	}
}

#[async_trait]
impl ObjectStore for FilesystemStore {
	async fn put(&self, key: &str, object: &[u8]) -> Result<StorageRef, StorageError> {
		let path = self.root.join(format!("{key}.dcm"));
		tokio::fs::write(&path, object).await?;
		Ok(path.to_string_lossy().into_owned())
	}
}
