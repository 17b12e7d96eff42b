//! Decides when the credits of a subscriber are refilled.
//!
//! Weekly plans refill every 7 days. Monthly and yearly plans refill once a
//! calendar month boundary was crossed or 30 days passed, whichever comes
//! first, so short months never delay a refill.

use crate::{
	plan::SubscriptionPlan, profile::SubscriptionProfile,
	utc_time::UtcDateTime,
};
use chrono::{Datelike, Duration, Months};

const WEEKLY_PERIOD_DAYS: i64 = 7;
const MONTHLY_FALLBACK_DAYS: i64 = 30;

#[must_use]
pub fn should_reset_credits(
	profile: &SubscriptionProfile,
	now: UtcDateTime,
) -> bool {
	if !profile.is_pro_version {
		return false;
	}

	let (plan, last_reset) =
		match (profile.subscription_plan, profile.period_start()) {
			(Some(plan), Some(last_reset)) => (plan, last_reset),
			_ => return false,
		};

	let days = (now - last_reset).num_days();

	match plan {
		SubscriptionPlan::Weekly => days >= WEEKLY_PERIOD_DAYS,
		SubscriptionPlan::Monthly | SubscriptionPlan::Yearly => {
			months_between(last_reset, now) >= 1
				|| days >= MONTHLY_FALLBACK_DAYS
		}
	}
}

#[must_use]
pub fn get_next_reset_date(
	profile: &SubscriptionProfile,
) -> Option<UtcDateTime> {
	let last_reset = profile.period_start()?;

	match profile.subscription_plan? {
		SubscriptionPlan::Weekly => {
			Some(last_reset + Duration::days(WEEKLY_PERIOD_DAYS))
		}
		SubscriptionPlan::Monthly | SubscriptionPlan::Yearly => {
			last_reset.checked_add_months(Months::new(1))
		}
	}
}

/// calendar months from `from` to `to`, ignoring the day of month
fn months_between(from: UtcDateTime, to: UtcDateTime) -> i64 {
	let years = i64::from(to.year()) - i64::from(from.year());
	let months = i64::from(to.month()) - i64::from(from.month());
	years * 12 + months
}
