use super::LocalStore;
use crate::error::Result;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryLocalStore {
	pub db: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.db.lock().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: String) -> Result<()> {
		self.db.lock().await.insert(key.to_string(), value);
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		self.db.lock().await.remove(key);
		Ok(())
	}
}
