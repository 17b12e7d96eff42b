pub mod adapter;
pub mod in_memory;

use crate::utc_time::UtcDateTime;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::broadcast;

pub use adapter::{ProductFetchStrategy, StoreAdapter};
pub use in_memory::{InMemoryPurchaseStore, ListingSupport, PurchaseBehavior};

/// error codes as reported by the native purchase module
pub mod codes {
	pub const USER_CANCELLED: &str = "E_USER_CANCELLED";
	pub const ALREADY_OWNED: &str = "E_ALREADY_OWNED";
	pub const ITEM_UNAVAILABLE: &str = "E_ITEM_UNAVAILABLE";
	pub const DEVELOPER_ERROR: &str = "E_DEVELOPER_ERROR";
	pub const NETWORK_ERROR: &str = "E_NETWORK_ERROR";
	pub const REMOTE_ERROR: &str = "E_REMOTE_ERROR";
	pub const SERVICE_ERROR: &str = "E_SERVICE_ERROR";
	pub const NOT_PREPARED: &str = "E_NOT_PREPARED";
	pub const UNSUPPORTED: &str = "E_UNSUPPORTED";
	pub const UNKNOWN: &str = "E_UNKNOWN";
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum ItemKind {
	Subscription,
	InApp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
	pub product_id: String,
	pub title: String,
	pub description: String,
	/// localized display price
	pub price: String,
	pub currency: Option<String>,
	pub is_subscription: bool,
}

impl Product {
	#[must_use]
	pub fn subscription(product_id: &str, price: &str) -> Self {
		Self {
			product_id: product_id.to_string(),
			title: product_id.to_string(),
			description: String::new(),
			price: price.to_string(),
			currency: None,
			is_subscription: true,
		}
	}

	#[must_use]
	pub const fn kind(&self) -> ItemKind {
		if self.is_subscription {
			ItemKind::Subscription
		} else {
			ItemKind::InApp
		}
	}
}

/// one transaction observed from the store, never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseTransaction {
	pub transaction_id: String,
	pub product_id: String,
	pub transaction_date: Option<UtcDateTime>,
	pub receipt: Option<String>,
}

impl PurchaseTransaction {
	#[must_use]
	pub fn new(transaction_id: &str, product_id: &str) -> Self {
		Self {
			transaction_id: transaction_id.to_string(),
			product_id: product_id.to_string(),
			transaction_date: None,
			receipt: None,
		}
	}
}

/// what the store pushes to its purchase-update and purchase-error listeners
#[derive(Debug, Clone)]
pub enum StoreEvent {
	Updated(PurchaseTransaction),
	Error(StoreError),
}

/// raw error shape of the native store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({})", .code.as_deref().unwrap_or("no code"))]
pub struct StoreError {
	pub code: Option<String>,
	pub message: String,
}

impl StoreError {
	#[must_use]
	pub fn new(code: &str, message: &str) -> Self {
		Self {
			code: Some(code.to_string()),
			message: message.to_string(),
		}
	}

	#[must_use]
	pub fn message(message: &str) -> Self {
		Self {
			code: None,
			message: message.to_string(),
		}
	}

	/// the native module does not expose the requested function
	#[must_use]
	pub fn unsupported(function: &str) -> Self {
		Self::new(
			codes::UNSUPPORTED,
			&format!("{} not available", function),
		)
	}

	#[must_use]
	pub fn cancelled() -> Self {
		Self::new(codes::USER_CANCELLED, "user cancelled the purchase")
	}

	#[must_use]
	pub fn is_transient(&self) -> bool {
		matches!(
			classify(self),
			PurchaseFailure::Network | PurchaseFailure::NotConnected
		)
	}
}

/// store failure reduced to what the UI needs to choose its messaging
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PurchaseFailure {
	#[error("purchase cancelled")]
	Cancelled,
	#[error("product already owned")]
	AlreadyOwned,
	#[error("product unavailable")]
	ProductUnavailable,
	#[error("no transaction received in time")]
	Timeout,
	#[error("network error")]
	Network,
	#[error("store not connected")]
	NotConnected,
	#[error("unknown store error: {0}")]
	Unknown(String),
}

impl PurchaseFailure {
	#[must_use]
	pub const fn is_retryable(&self) -> bool {
		matches!(self, Self::Timeout | Self::Network | Self::NotConnected)
	}
}

/// classifies by error code first, by message second
#[must_use]
pub fn classify(error: &StoreError) -> PurchaseFailure {
	if let Some(code) = error.code.as_deref() {
		match code {
			codes::USER_CANCELLED => return PurchaseFailure::Cancelled,
			codes::ALREADY_OWNED => {
				return PurchaseFailure::AlreadyOwned
			}
			codes::ITEM_UNAVAILABLE | codes::DEVELOPER_ERROR => {
				return PurchaseFailure::ProductUnavailable
			}
			codes::NETWORK_ERROR | codes::REMOTE_ERROR => {
				return PurchaseFailure::Network
			}
			codes::NOT_PREPARED | codes::SERVICE_ERROR => {
				return PurchaseFailure::NotConnected
			}
			_ => (),
		}
	}

	let message = error.message.to_lowercase();
	let mentions = |needles: &[&str]| {
		needles.iter().any(|needle| message.contains(needle))
	};

	if mentions(&["cancel"]) {
		PurchaseFailure::Cancelled
	} else if mentions(&[
		"already owned",
		"already purchased",
		"already subscribed",
	]) {
		PurchaseFailure::AlreadyOwned
	} else if mentions(&["unavailable", "not found", "invalid product"])
	{
		PurchaseFailure::ProductUnavailable
	} else if mentions(&["network", "offline", "connection"]) {
		PurchaseFailure::Network
	} else {
		PurchaseFailure::Unknown(error.message.clone())
	}
}

/// native in-app-purchase capability.
///
/// the product listing functions are optional on some native versions, the
/// default bodies report them as unsupported
#[async_trait]
pub trait PurchaseStore: Send + Sync {
	/// whether the native module loaded and can open a connection
	fn supports_connection(&self) -> bool;

	async fn init_connection(&self) -> StoreResult<bool>;
	async fn end_connection(&self) -> StoreResult<()>;

	async fn get_subscriptions(
		&self,
		_product_ids: &[String],
	) -> StoreResult<Vec<Product>> {
		Err(StoreError::unsupported("getSubscriptions"))
	}

	async fn get_items(
		&self,
		_product_ids: &[String],
		_kind: ItemKind,
	) -> StoreResult<Vec<Product>> {
		Err(StoreError::unsupported("getItemsByType"))
	}

	async fn get_products(
		&self,
		_product_ids: &[String],
	) -> StoreResult<Vec<Product>> {
		Err(StoreError::unsupported("getProducts"))
	}

	/// opens the native purchase sheet, the outcome arrives through
	/// `subscribe`
	async fn request_purchase(&self, product_id: &str)
		-> StoreResult<()>;

	/// transactions the store still holds unacknowledged
	async fn get_available_purchases(
		&self,
	) -> StoreResult<Vec<PurchaseTransaction>>;

	async fn finish_transaction(
		&self,
		transaction: &PurchaseTransaction,
	) -> StoreResult<()>;

	fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
