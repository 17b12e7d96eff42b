use super::{ProfileDB, ProfileUpdate, SubscriptionProfile};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryProfileDB {
	pub db: Arc<Mutex<HashMap<String, SubscriptionProfile>>>,
	updates: AtomicUsize,
}

impl InMemoryProfileDB {
	#[must_use]
	pub fn with_profile(profile: SubscriptionProfile) -> Self {
		let mut map = HashMap::new();
		map.insert(profile.user_id.clone(), profile);
		Self {
			db: Arc::new(Mutex::new(map)),
			updates: AtomicUsize::new(0),
		}
	}

	/// number of successful `update_profile` calls
	#[must_use]
	pub fn update_count(&self) -> usize {
		self.updates.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ProfileDB for InMemoryProfileDB {
	async fn get_profile(
		&self,
		user_id: &str,
	) -> Result<Option<SubscriptionProfile>> {
		Ok(self.db.lock().await.get(user_id).cloned())
	}

	async fn update_profile(
		&self,
		user_id: &str,
		update: ProfileUpdate,
	) -> Result<()> {
		let mut db = self.db.lock().await;
		let profile = db
			.get_mut(user_id)
			.ok_or_else(|| Error::ProfileNotFound(user_id.to_string()))?;

		update.apply(profile);
		self.updates.fetch_add(1, Ordering::SeqCst);

		Ok(())
	}

	async fn create_profile_if_missing(
		&self,
		user_id: &str,
	) -> Result<()> {
		self.db
			.lock()
			.await
			.entry(user_id.to_string())
			.or_insert_with(|| SubscriptionProfile::new(user_id));
		Ok(())
	}
}
