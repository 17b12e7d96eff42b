#![forbid(unsafe_code)]
#![deny(unused_must_use)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::perf)]
#![deny(clippy::nursery)]
#![deny(clippy::match_like_matches_macro)]
#![deny(clippy::needless_update)]
#![allow(clippy::module_name_repetitions)]
//TODO:
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod credit_reset;
pub mod dynamo_util;
pub mod entitlement;
pub mod error;
pub mod local;
pub mod plan;
pub mod profile;
pub mod service;
pub mod session;
pub mod store;
pub mod utc_time;

use async_trait::async_trait;

pub use config::{IapConfig, Platform};
pub use entitlement::EntitlementWriter;
pub use error::{Error, Result};
pub use plan::{credits_for_plan, SubscriptionPlan};
pub use profile::{
	CreditsInfo, DynamoProfileDB, InMemoryProfileDB, ProfileDB,
	SubscriptionProfile,
};
pub use service::{
	IapService, IapStatus, ProcessOutcome, PurchaseOutcome,
	TransactionSource,
};
pub use store::{PurchaseFailure, PurchaseStore, PurchaseTransaction};

/// everything the service reports to the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IapEvent {
	Connected,
	ProductsLoaded {
		count: usize,
	},
	PurchaseStarted {
		product_id: String,
	},
	/// `orphaned` grants recover an earlier purchase and should not
	/// trigger navigation
	PurchaseGranted {
		product_id: String,
		plan: SubscriptionPlan,
		orphaned: bool,
	},
	PurchaseFailed {
		reason: PurchaseFailure,
	},
	PurchaseCancelled,
	RestoreCompleted {
		count: usize,
	},
}

#[async_trait]
pub trait IapEventHandler: Send + Sync {
	async fn on_event(&self, event: IapEvent);
}
