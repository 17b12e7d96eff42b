pub mod dynamodb;
pub mod in_memory;

use crate::{
	error::Result, plan::SubscriptionPlan, utc_time::UtcDateTime,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use dynamodb::DynamoProfileDB;
pub use in_memory::InMemoryProfileDB;

pub type UserId = String;

/// remote entitlement record, the source of truth for subscription and
/// credit state of one user
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionProfile {
	pub user_id: UserId,
	pub subscription_plan: Option<SubscriptionPlan>,
	pub subscription_id: Option<String>,
	pub product_id: Option<String>,
	pub purchase_time: Option<UtcDateTime>,
	pub subscription_start_date: Option<UtcDateTime>,
	pub last_credit_reset: Option<UtcDateTime>,
	pub is_pro_version: bool,
	pub credits_current: u32,
	pub credits_max: u32,
}

impl SubscriptionProfile {
	#[must_use]
	pub fn new(user_id: &str) -> Self {
		Self {
			user_id: user_id.to_string(),
			..Self::default()
		}
	}

	/// date the current credit period started at, falling back to the
	/// subscription start if credits were never reset
	#[must_use]
	pub fn period_start(&self) -> Option<UtcDateTime> {
		self.last_credit_reset.or(self.subscription_start_date)
	}
}

/// partial update of a `SubscriptionProfile`, only `Some` fields are written
#[derive(Default, Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
	pub subscription_plan: Option<SubscriptionPlan>,
	pub subscription_id: Option<String>,
	pub product_id: Option<String>,
	pub purchase_time: Option<UtcDateTime>,
	pub subscription_start_date: Option<UtcDateTime>,
	pub last_credit_reset: Option<UtcDateTime>,
	pub is_pro_version: Option<bool>,
	pub credits_current: Option<u32>,
	pub credits_max: Option<u32>,
}

impl ProfileUpdate {
	/// full subscription record written when a purchase is entitled
	#[must_use]
	pub fn grant(
		plan: SubscriptionPlan,
		product_id: &str,
		transaction_id: &str,
		now: UtcDateTime,
	) -> Self {
		let credits = plan.credits();
		Self {
			subscription_plan: Some(plan),
			subscription_id: Some(transaction_id.to_string()),
			product_id: Some(product_id.to_string()),
			purchase_time: Some(now),
			subscription_start_date: Some(now),
			last_credit_reset: Some(now),
			is_pro_version: Some(true),
			credits_current: Some(credits),
			credits_max: Some(credits),
		}
	}

	#[must_use]
	pub fn credits(current: u32) -> Self {
		Self {
			credits_current: Some(current),
			..Self::default()
		}
	}

	#[must_use]
	pub fn reset(max: u32, now: UtcDateTime) -> Self {
		Self {
			credits_current: Some(max),
			credits_max: Some(max),
			last_credit_reset: Some(now),
			..Self::default()
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self == &Self::default()
	}

	pub fn apply(&self, profile: &mut SubscriptionProfile) {
		if let Some(plan) = self.subscription_plan {
			profile.subscription_plan = Some(plan);
		}
		if let Some(id) = &self.subscription_id {
			profile.subscription_id = Some(id.clone());
		}
		if let Some(id) = &self.product_id {
			profile.product_id = Some(id.clone());
		}
		if let Some(date) = self.purchase_time {
			profile.purchase_time = Some(date);
		}
		if let Some(date) = self.subscription_start_date {
			profile.subscription_start_date = Some(date);
		}
		if let Some(date) = self.last_credit_reset {
			profile.last_credit_reset = Some(date);
		}
		if let Some(pro) = self.is_pro_version {
			profile.is_pro_version = pro;
		}
		if let Some(max) = self.credits_max {
			profile.credits_max = max;
		}
		if let Some(current) = self.credits_current {
			profile.credits_current = current;
		}
		// keep credits_current <= credits_max
		profile.credits_current =
			profile.credits_current.min(profile.credits_max);
	}
}

/// read-through copy of the credit fields for offline display
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditsInfo {
	pub current: u32,
	pub max: u32,
	pub last_reset_date: Option<UtcDateTime>,
}

impl From<&SubscriptionProfile> for CreditsInfo {
	fn from(profile: &SubscriptionProfile) -> Self {
		Self {
			current: profile.credits_current,
			max: profile.credits_max,
			last_reset_date: profile.last_credit_reset,
		}
	}
}

#[async_trait]
pub trait ProfileDB: Send + Sync {
	async fn get_profile(
		&self,
		user_id: &str,
	) -> Result<Option<SubscriptionProfile>>;

	/// fails if no profile exists for `user_id`
	async fn update_profile(
		&self,
		user_id: &str,
		update: ProfileUpdate,
	) -> Result<()>;

	/// creates the zero/default record on first sign-in, no-op otherwise
	async fn create_profile_if_missing(&self, user_id: &str)
		-> Result<()>;
}
