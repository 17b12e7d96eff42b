use super::LocalStore;
use crate::error::Result;
use async_trait::async_trait;
use std::{collections::HashMap, io::ErrorKind, path::PathBuf};
use tokio::sync::Mutex;
use tracing::instrument;

/// `LocalStore` keeping all entries in a single json document on disk
pub struct FileLocalStore {
	path: PathBuf,
	lock: Mutex<()>,
}

impl FileLocalStore {
	#[must_use]
	pub fn new(path: PathBuf) -> Self {
		Self {
			path,
			lock: Mutex::new(()),
		}
	}

	async fn read_all(&self) -> Result<HashMap<String, String>> {
		match tokio::fs::read_to_string(&self.path).await {
			Ok(content) if content.trim().is_empty() => {
				Ok(HashMap::new())
			}
			Ok(content) => Ok(serde_json::from_str(&content)?),
			Err(e) if e.kind() == ErrorKind::NotFound => {
				Ok(HashMap::new())
			}
			Err(e) => Err(e.into()),
		}
	}

	/// written to a sibling temp file, then renamed over the document
	async fn write_all(
		&self,
		entries: &HashMap<String, String>,
	) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let tmp = self.path.with_extension("tmp");
		tokio::fs::write(&tmp, serde_json::to_vec(entries)?).await?;
		tokio::fs::rename(&tmp, &self.path).await?;

		Ok(())
	}
}

#[async_trait]
impl LocalStore for FileLocalStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let _guard = self.lock.lock().await;
		Ok(self.read_all().await?.remove(key))
	}

	#[instrument(skip(self, value), err)]
	async fn set(&self, key: &str, value: String) -> Result<()> {
		let _guard = self.lock.lock().await;
		let mut entries = self.read_all().await?;
		entries.insert(key.to_string(), value);
		self.write_all(&entries).await
	}

	#[instrument(skip(self), err)]
	async fn remove(&self, key: &str) -> Result<()> {
		let _guard = self.lock.lock().await;
		let mut entries = self.read_all().await?;
		if entries.remove(key).is_some() {
			self.write_all(&entries).await?;
		}
		Ok(())
	}
}
