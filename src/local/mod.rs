pub mod file;
pub mod in_memory;

use crate::{
	error::Result, plan::SubscriptionPlan, profile::CreditsInfo,
	utc_time::UtcDateTime,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

pub use file::FileLocalStore;
pub use in_memory::InMemoryLocalStore;

pub const KEY_PURCHASE_IN_FLIGHT: &str = "purchase_in_flight";
pub const KEY_CREDITS_INFO: &str = "credits_info";
pub const KEY_SUBSCRIPTION_INFO: &str = "subscription_info";

/// device-local key-value storage that survives process restarts
#[async_trait]
pub trait LocalStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>>;
	async fn set(&self, key: &str, value: String) -> Result<()>;
	async fn remove(&self, key: &str) -> Result<()>;
}

pub async fn get_json<T: DeserializeOwned>(
	store: &dyn LocalStore,
	key: &str,
) -> Result<Option<T>> {
	match store.get(key).await? {
		Some(value) => Ok(Some(serde_json::from_str(&value)?)),
		None => Ok(None),
	}
}

pub async fn set_json<T: Serialize + Sync>(
	store: &dyn LocalStore,
	key: &str,
	value: &T,
) -> Result<()> {
	store.set(key, serde_json::to_string(value)?).await
}

/// subscription state cached for offline display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
	pub plan: Option<SubscriptionPlan>,
	pub is_pro: bool,
	pub product_id: Option<String>,
	pub updated_at: UtcDateTime,
}

/// persisted "purchase in flight" marker.
///
/// the in-memory mirror answers reads, every change is written through to
/// the `LocalStore` before it returns so a killed process still finds the
/// marker on the next launch
pub struct InFlightFlag {
	store: Arc<dyn LocalStore>,
	value: AtomicBool,
}

impl InFlightFlag {
	#[must_use]
	pub fn new(store: Arc<dyn LocalStore>) -> Self {
		Self {
			store,
			value: AtomicBool::new(false),
		}
	}

	/// loads the persisted value, returns it
	pub async fn load(&self) -> Result<bool> {
		let persisted = self
			.store
			.get(KEY_PURCHASE_IN_FLIGHT)
			.await?
			.map_or(false, |v| v == "true");
		self.value.store(persisted, Ordering::SeqCst);
		Ok(persisted)
	}

	#[must_use]
	pub fn is_set(&self) -> bool {
		self.value.load(Ordering::SeqCst)
	}

	pub async fn set(&self) -> Result<()> {
		self.value.store(true, Ordering::SeqCst);
		self.store
			.set(KEY_PURCHASE_IN_FLIGHT, String::from("true"))
			.await
	}

	pub async fn clear(&self) -> Result<()> {
		self.value.store(false, Ordering::SeqCst);
		self.store.remove(KEY_PURCHASE_IN_FLIGHT).await
	}
}

/// local read-through caches of the remote profile
pub struct LocalCache {
	store: Arc<dyn LocalStore>,
}

impl LocalCache {
	#[must_use]
	pub fn new(store: Arc<dyn LocalStore>) -> Self {
		Self { store }
	}

	pub async fn credits(&self) -> Result<Option<CreditsInfo>> {
		get_json(self.store.as_ref(), KEY_CREDITS_INFO).await
	}

	pub async fn set_credits(&self, credits: &CreditsInfo) -> Result<()> {
		set_json(self.store.as_ref(), KEY_CREDITS_INFO, credits).await
	}

	pub async fn subscription(&self) -> Result<Option<SubscriptionInfo>> {
		get_json(self.store.as_ref(), KEY_SUBSCRIPTION_INFO).await
	}

	pub async fn set_subscription(
		&self,
		info: &SubscriptionInfo,
	) -> Result<()> {
		set_json(self.store.as_ref(), KEY_SUBSCRIPTION_INFO, info).await
	}

	pub async fn clear(&self) -> Result<()> {
		self.store.remove(KEY_CREDITS_INFO).await?;
		self.store.remove(KEY_SUBSCRIPTION_INFO).await
	}
}
