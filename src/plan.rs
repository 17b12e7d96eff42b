use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(
	Debug,
	Copy,
	Clone,
	PartialEq,
	Eq,
	Hash,
	Display,
	EnumString,
	Serialize,
	Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
	Weekly,
	Monthly,
	Yearly,
}

impl SubscriptionPlan {
	/// credits granted per reset period
	#[must_use]
	pub const fn credits(self) -> u32 {
		match self {
			Self::Yearly => 90,
			Self::Monthly => 75,
			Self::Weekly => 10,
		}
	}

	/// maps a store product id onto a plan by case-sensitive substring
	/// match. anything that names neither `monthly` nor `weekly` counts
	/// as yearly
	#[must_use]
	pub fn from_product_id(product_id: &str) -> Self {
		if product_id.contains("monthly") {
			Self::Monthly
		} else if product_id.contains("weekly") {
			Self::Weekly
		} else {
			//TODO: reject unknown product ids once the store catalog is mirrored in config
			Self::Yearly
		}
	}
}

/// credits for a plan given by its stored name, `0` for no plan or an
/// unknown name
#[must_use]
pub fn credits_for_plan(plan: Option<&str>) -> u32 {
	plan.and_then(|plan| plan.parse::<SubscriptionPlan>().ok())
		.map_or(0, SubscriptionPlan::credits)
}
