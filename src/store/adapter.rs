use super::{
	ItemKind, Product, PurchaseStore, PurchaseTransaction, StoreEvent,
	StoreResult,
};
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::{broadcast, Mutex};
use tracing::instrument;

/// one way of listing products, tried in `ProductFetchStrategy::ORDER`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum ProductFetchStrategy {
	Subscriptions,
	NativeSubscriptionItems,
	NativeInAppItems,
	Products,
}

impl ProductFetchStrategy {
	pub const ORDER: [Self; 4] = [
		Self::Subscriptions,
		Self::NativeSubscriptionItems,
		Self::NativeInAppItems,
		Self::Products,
	];

	async fn fetch(
		self,
		store: &dyn PurchaseStore,
		product_ids: &[String],
	) -> StoreResult<Vec<Product>> {
		match self {
			Self::Subscriptions => {
				store.get_subscriptions(product_ids).await
			}
			Self::NativeSubscriptionItems => {
				store
					.get_items(product_ids, ItemKind::Subscription)
					.await
			}
			Self::NativeInAppItems => {
				store.get_items(product_ids, ItemKind::InApp).await
			}
			Self::Products => store.get_products(product_ids).await,
		}
	}
}

/// thin wrapper over the native store that hides missing functions and
/// connection bookkeeping
pub struct StoreAdapter {
	store: Arc<dyn PurchaseStore>,
	connected: Mutex<bool>,
}

impl StoreAdapter {
	#[must_use]
	pub fn new(store: Arc<dyn PurchaseStore>) -> Self {
		Self {
			store,
			connected: Mutex::new(false),
		}
	}

	#[must_use]
	pub fn is_available(&self) -> bool {
		self.store.supports_connection()
	}

	pub async fn is_connected(&self) -> bool {
		*self.connected.lock().await
	}

	/// opens the store connection once, later calls return the cached
	/// result. never fails, an unusable store reports `false`
	#[instrument(skip(self))]
	pub async fn initialize_connection(&self) -> bool {
		let mut connected = self.connected.lock().await;

		if *connected {
			return true;
		}

		if !self.is_available() {
			tracing::warn!("store module not available");
			return false;
		}

		match self.store.init_connection().await {
			Ok(result) => {
				tracing::info!("store connection: {}", result);
				*connected = result;
				result
			}
			Err(e) => {
				tracing::error!("store connection failed: {}", e);
				false
			}
		}
	}

	/// lists `product_ids` using the first strategy that yields products,
	/// an empty list when none does
	#[instrument(skip(self))]
	pub async fn get_products(
		&self,
		product_ids: &[String],
	) -> Vec<Product> {
		if product_ids.is_empty() {
			return Vec::new();
		}

		for strategy in ProductFetchStrategy::ORDER.iter().copied() {
			match strategy.fetch(self.store.as_ref(), product_ids).await {
				Ok(products) if !products.is_empty() => {
					tracing::info!(target: "iap",
						%strategy,
						count = products.len(),
						"products loaded"
					);
					return products;
				}
				Ok(_) => {
					tracing::info!(target: "iap",
						%strategy,
						"no products"
					);
				}
				Err(e) => {
					tracing::warn!(target: "iap",
						%strategy,
						error = %e,
						"product listing failed"
					);
				}
			}
		}

		tracing::warn!("no strategy returned products");

		Vec::new()
	}

	pub async fn initiate_purchase(
		&self,
		product_id: &str,
	) -> StoreResult<()> {
		self.store.request_purchase(product_id).await
	}

	pub async fn list_pending_purchases(
		&self,
	) -> StoreResult<Vec<PurchaseTransaction>> {
		self.store.get_available_purchases().await
	}

	pub async fn finish_transaction(
		&self,
		transaction: &PurchaseTransaction,
	) -> StoreResult<()> {
		self.store.finish_transaction(transaction).await
	}

	/// closes the connection if open, errors are logged only
	pub async fn end_connection(&self) {
		let mut connected = self.connected.lock().await;

		if !*connected {
			return;
		}

		if let Err(e) = self.store.end_connection().await {
			tracing::warn!("end connection failed: {}", e);
		}

		*connected = false;
	}

	#[must_use]
	pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
		self.store.subscribe()
	}
}
