use crate::plan::SubscriptionPlan;
use std::{collections::HashMap, str::FromStr, time::Duration};
use strum_macros::{Display, EnumString};

pub const DEFAULT_PURCHASE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READY_FALLBACK: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumString, Display)]
pub enum Platform {
	GooglePlay,
	AppleAppStore,
}

impl Default for Platform {
	fn default() -> Self {
		Self::AppleAppStore
	}
}

#[derive(Debug, Clone)]
pub struct IapConfig {
	pub platform: Platform,
	pub apple_product_ids: Vec<String>,
	pub google_product_ids: Vec<String>,
	/// how long `purchase_product` waits for the store to deliver a transaction
	pub purchase_timeout: Duration,
	/// upper bound a caller waits for `initialize` before unblocking its UI
	pub ready_fallback: Duration,
	/// explicit plan per product id, consulted before the substring heuristic
	pub product_plans: HashMap<String, SubscriptionPlan>,
}

impl Default for IapConfig {
	fn default() -> Self {
		Self {
			platform: Platform::default(),
			apple_product_ids: Vec::new(),
			google_product_ids: Vec::new(),
			purchase_timeout: DEFAULT_PURCHASE_TIMEOUT,
			ready_fallback: DEFAULT_READY_FALLBACK,
			product_plans: HashMap::new(),
		}
	}
}

impl IapConfig {
	/// reads `IAP_*` environment variables, keeping defaults for anything
	/// unset or unparsable
	#[must_use]
	pub fn from_env() -> Self {
		let mut config = Self::default();

		if let Some(platform) = env_parse::<Platform>("IAP_PLATFORM") {
			config.platform = platform;
		}
		if let Ok(ids) = std::env::var("IAP_APPLE_PRODUCT_IDS") {
			config.apple_product_ids = split_ids(&ids);
		}
		if let Ok(ids) = std::env::var("IAP_GOOGLE_PRODUCT_IDS") {
			config.google_product_ids = split_ids(&ids);
		}
		if let Some(secs) = env_parse::<u64>("IAP_PURCHASE_TIMEOUT_SECS")
		{
			config.purchase_timeout = Duration::from_secs(secs);
		}
		if let Some(secs) = env_parse::<u64>("IAP_READY_FALLBACK_SECS") {
			config.ready_fallback = Duration::from_secs(secs);
		}

		tracing::info!(
			"iap config: (platform: {}, products: {}, timeout: {:?})",
			config.platform,
			config.product_ids().len(),
			config.purchase_timeout
		);

		config
	}

	#[must_use]
	pub fn with_platform(mut self, platform: Platform) -> Self {
		self.platform = platform;
		self
	}

	#[must_use]
	pub fn with_product_ids(
		mut self,
		apple: Vec<String>,
		google: Vec<String>,
	) -> Self {
		self.apple_product_ids = apple;
		self.google_product_ids = google;
		self
	}

	#[must_use]
	pub fn with_purchase_timeout(
		mut self,
		timeout: Duration,
	) -> Self {
		self.purchase_timeout = timeout;
		self
	}

	#[must_use]
	pub fn with_ready_fallback(
		mut self,
		fallback: Duration,
	) -> Self {
		self.ready_fallback = fallback;
		self
	}

	#[must_use]
	pub fn with_product_plan(
		mut self,
		product_id: &str,
		plan: SubscriptionPlan,
	) -> Self {
		self.product_plans.insert(product_id.to_string(), plan);
		self
	}

	/// product ids of the configured platform
	#[must_use]
	pub fn product_ids(&self) -> &[String] {
		match self.platform {
			Platform::AppleAppStore => &self.apple_product_ids,
			Platform::GooglePlay => &self.google_product_ids,
		}
	}

	#[must_use]
	pub fn plan_for_product(&self, product_id: &str) -> SubscriptionPlan {
		self.product_plans.get(product_id).copied().unwrap_or_else(
			|| SubscriptionPlan::from_product_id(product_id),
		)
	}
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
	std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn split_ids(ids: &str) -> Vec<String> {
	ids.split(',')
		.map(str::trim)
		.filter(|id| !id.is_empty())
		.map(String::from)
		.collect()
}
