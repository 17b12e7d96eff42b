use crate::{
	credit_reset::should_reset_credits,
	error::{Error, Result},
	local::{LocalCache, LocalStore, SubscriptionInfo},
	plan::SubscriptionPlan,
	profile::{CreditsInfo, ProfileDB, ProfileUpdate, SubscriptionProfile},
	utc_time::UtcDateTime,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

/// writes entitlement and credit state to the remote profile and keeps the
/// local caches in line with it
pub struct EntitlementWriter {
	profiles: Arc<dyn ProfileDB>,
	cache: LocalCache,
}

impl EntitlementWriter {
	#[must_use]
	pub fn new(
		profiles: Arc<dyn ProfileDB>,
		local: Arc<dyn LocalStore>,
	) -> Self {
		Self {
			profiles,
			cache: LocalCache::new(local),
		}
	}

	/// # Errors
	///
	/// any remote failure, the caller must not acknowledge the
	/// transaction in that case
	#[instrument(skip(self), err)]
	pub async fn grant_entitlement(
		&self,
		user_id: &str,
		plan: SubscriptionPlan,
		product_id: &str,
		transaction_id: &str,
	) -> Result<()> {
		let now = Utc::now();

		self.profiles.create_profile_if_missing(user_id).await?;
		self.profiles
			.update_profile(
				user_id,
				ProfileUpdate::grant(plan, product_id, transaction_id, now),
			)
			.await?;

		tracing::info!(target: "iap",
			user = %user_id,
			%plan,
			%product_id,
			%transaction_id,
			credits = plan.credits(),
			"entitlement granted"
		);

		self.store_credits(&CreditsInfo {
			current: plan.credits(),
			max: plan.credits(),
			last_reset_date: Some(now),
		})
		.await;
		self.store_subscription(&SubscriptionInfo {
			plan: Some(plan),
			is_pro: true,
			product_id: Some(product_id.to_string()),
			updated_at: now,
		})
		.await;

		Ok(())
	}

	/// returns `false` without writing when fewer than `amount` credits are
	/// left.
	///
	/// read and write are separate calls, a concurrent deduction from
	/// another client can be lost
	#[instrument(skip(self), err)]
	pub async fn deduct_credit(
		&self,
		user_id: &str,
		amount: u32,
	) -> Result<bool> {
		let profile = self.require_profile(user_id).await?;

		let remaining = match profile.credits_current.checked_sub(amount) {
			Some(remaining) => remaining,
			None => {
				tracing::info!(
					"insufficient credits: {} < {}",
					profile.credits_current,
					amount
				);
				return Ok(false);
			}
		};

		self.profiles
			.update_profile(user_id, ProfileUpdate::credits(remaining))
			.await?;

		self.store_credits(&CreditsInfo {
			current: remaining,
			..CreditsInfo::from(&profile)
		})
		.await;

		Ok(true)
	}

	/// remote profile first, local cache when the remote read fails or
	/// nobody is signed in
	pub async fn get_credits(&self, user_id: Option<&str>) -> CreditsInfo {
		if let Some(user_id) = user_id {
			match self.profiles.get_profile(user_id).await {
				Ok(Some(profile)) => {
					let credits = CreditsInfo::from(&profile);
					self.store_credits(&credits).await;
					return credits;
				}
				Ok(None) => {
					tracing::warn!("no profile for: {}", user_id);
				}
				Err(e) => {
					tracing::warn!("remote credits unavailable: {}", e);
				}
			}
		}

		match self.cache.credits().await {
			Ok(credits) => credits.unwrap_or_default(),
			Err(e) => {
				tracing::error!("credits cache read failed: {}", e);
				CreditsInfo::default()
			}
		}
	}

	/// creates the default profile on first sign-in
	#[instrument(skip(self), err)]
	pub async fn ensure_profile(&self, user_id: &str) -> Result<()> {
		self.profiles.create_profile_if_missing(user_id).await
	}

	/// refills credits when the reset policy says a new period started
	#[instrument(skip(self), err)]
	pub async fn reset_credits_if_due(
		&self,
		user_id: &str,
		now: UtcDateTime,
	) -> Result<bool> {
		let profile = self.require_profile(user_id).await?;

		if !should_reset_credits(&profile, now) {
			return Ok(false);
		}

		let update = ProfileUpdate::reset(profile.credits_max, now);
		self.profiles.update_profile(user_id, update).await?;

		tracing::info!(target: "iap",
			user = %user_id,
			credits = profile.credits_max,
			"credits reset"
		);

		self.store_credits(&CreditsInfo {
			current: profile.credits_max,
			max: profile.credits_max,
			last_reset_date: Some(now),
		})
		.await;

		Ok(true)
	}

	pub async fn cached_subscription(&self) -> Option<SubscriptionInfo> {
		self.cache.subscription().await.unwrap_or_else(|e| {
			tracing::error!("subscription cache read failed: {}", e);
			None
		})
	}

	async fn require_profile(
		&self,
		user_id: &str,
	) -> Result<SubscriptionProfile> {
		self.profiles
			.get_profile(user_id)
			.await?
			.ok_or_else(|| Error::ProfileNotFound(user_id.to_string()))
	}

	// cache writes never fail the remote operation they follow
	async fn store_credits(&self, credits: &CreditsInfo) {
		if let Err(e) = self.cache.set_credits(credits).await {
			tracing::error!("credits cache write failed: {}", e);
		}
	}

	async fn store_subscription(&self, info: &SubscriptionInfo) {
		if let Err(e) = self.cache.set_subscription(info).await {
			tracing::error!("subscription cache write failed: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(
		clippy::unwrap_used,
        //TODO: https://github.com/rust-lang/rust-clippy/issues/7438
		clippy::semicolon_if_nothing_returned
	)]

	use super::*;
	use crate::{
		local::InMemoryLocalStore, profile::InMemoryProfileDB,
	};
	use async_trait::async_trait;
	use chrono::{Duration, TimeZone};
	use mockall::mock;
	use pretty_assertions::assert_eq;

	mock! {
		Profiles {}

		#[async_trait]
		impl ProfileDB for Profiles {
			async fn get_profile(
				&self,
				user_id: &str,
			) -> Result<Option<SubscriptionProfile>>;
			async fn update_profile(
				&self,
				user_id: &str,
				update: ProfileUpdate,
			) -> Result<()>;
			async fn create_profile_if_missing(
				&self,
				user_id: &str,
			) -> Result<()>;
		}
	}

	fn writer(
		profiles: Arc<dyn ProfileDB>,
	) -> (EntitlementWriter, LocalCache) {
		let local = Arc::new(InMemoryLocalStore::default());
		(
			EntitlementWriter::new(profiles, local.clone()),
			LocalCache::new(local),
		)
	}

	fn pro_profile(credits: u32) -> SubscriptionProfile {
		SubscriptionProfile {
			subscription_plan: Some(SubscriptionPlan::Weekly),
			is_pro_version: true,
			credits_current: credits,
			credits_max: 10,
			..SubscriptionProfile::new("uid")
		}
	}

	#[tokio::test]
	async fn test_grant_writes_profile_and_cache() {
		let profiles = Arc::new(InMemoryProfileDB::default());
		let (writer, cache) = writer(profiles.clone());

		writer
			.grant_entitlement(
				"uid",
				SubscriptionPlan::Yearly,
				"pro.yearly",
				"t1",
			)
			.await
			.unwrap();

		let profile = profiles.get_profile("uid").await.unwrap().unwrap();
		assert!(profile.is_pro_version);
		assert_eq!(profile.credits_current, 90);
		assert_eq!(profile.credits_max, 90);
		assert_eq!(profile.subscription_id.as_deref(), Some("t1"));
		assert_eq!(profile.purchase_time, profile.last_credit_reset);

		let credits = cache.credits().await.unwrap().unwrap();
		assert_eq!(credits.current, 90);

		let info = writer.cached_subscription().await.unwrap();
		assert_eq!(info.plan, Some(SubscriptionPlan::Yearly));
		assert!(info.is_pro);
	}

	#[tokio::test]
	async fn test_grant_write_failure_propagates() {
		let mut profiles = MockProfiles::new();
		profiles
			.expect_create_profile_if_missing()
			.returning(|_| Ok(()));
		profiles
			.expect_update_profile()
			.returning(|_, _| Err(Error::Custom(String::from("offline"))));

		let (writer, cache) = writer(Arc::new(profiles));

		let res = writer
			.grant_entitlement(
				"uid",
				SubscriptionPlan::Monthly,
				"pro.monthly",
				"t1",
			)
			.await;

		assert!(res.is_err());
		assert_eq!(cache.credits().await.unwrap(), None);
	}

	#[tokio::test]
	async fn test_deduct_credit() {
		let profiles =
			Arc::new(InMemoryProfileDB::with_profile(pro_profile(2)));
		let (writer, cache) = writer(profiles.clone());

		assert!(writer.deduct_credit("uid", 1).await.unwrap());
		assert!(!writer.deduct_credit("uid", 5).await.unwrap());

		let profile = profiles.get_profile("uid").await.unwrap().unwrap();
		assert_eq!(profile.credits_current, 1);
		assert_eq!(profiles.update_count(), 1);
		assert_eq!(cache.credits().await.unwrap().unwrap().current, 1);
	}

	#[tokio::test]
	async fn test_deduct_without_profile() {
		let (writer, _) = writer(Arc::new(InMemoryProfileDB::default()));

		let res = writer.deduct_credit("uid", 1).await;

		assert!(matches!(res, Err(Error::ProfileNotFound(_))));
	}

	#[tokio::test]
	async fn test_get_credits_falls_back_to_cache() {
		let mut profiles = MockProfiles::new();
		profiles
			.expect_get_profile()
			.returning(|_| Err(Error::Custom(String::from("offline"))));

		let (writer, cache) = writer(Arc::new(profiles));
		let cached = CreditsInfo {
			current: 3,
			max: 10,
			last_reset_date: None,
		};
		cache.set_credits(&cached).await.unwrap();

		assert_eq!(writer.get_credits(Some("uid")).await, cached);
		assert_eq!(writer.get_credits(None).await, cached);
	}

	#[tokio::test]
	async fn test_get_credits_prefers_remote() {
		let profiles =
			Arc::new(InMemoryProfileDB::with_profile(pro_profile(7)));
		let (writer, cache) = writer(profiles);
		cache.set_credits(&CreditsInfo::default()).await.unwrap();

		let credits = writer.get_credits(Some("uid")).await;

		assert_eq!(credits.current, 7);
		assert_eq!(cache.credits().await.unwrap(), Some(credits));
	}

	#[tokio::test]
	async fn test_reset_credits_if_due() {
		let now = Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap();
		let profile = SubscriptionProfile {
			last_credit_reset: Some(now - Duration::days(8)),
			..pro_profile(0)
		};
		let profiles = Arc::new(InMemoryProfileDB::with_profile(profile));
		let (writer, _) = writer(profiles.clone());

		assert!(writer.reset_credits_if_due("uid", now).await.unwrap());
		assert!(!writer.reset_credits_if_due("uid", now).await.unwrap());

		let profile = profiles.get_profile("uid").await.unwrap().unwrap();
		assert_eq!(profile.credits_current, 10);
		assert_eq!(profile.last_credit_reset, Some(now));
	}

	#[tokio::test]
	async fn test_ensure_profile() {
		let profiles = Arc::new(InMemoryProfileDB::default());
		let (writer, _) = writer(profiles.clone());

		writer.ensure_profile("uid").await.unwrap();
		writer.ensure_profile("uid").await.unwrap();

		let profile = profiles.get_profile("uid").await.unwrap().unwrap();
		assert_eq!(profile, SubscriptionProfile::new("uid"));
	}
}
