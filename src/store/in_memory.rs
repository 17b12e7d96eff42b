use super::{
	ItemKind, Product, PurchaseStore, PurchaseTransaction, StoreError,
	StoreEvent, StoreResult,
};
use crate::utc_time::UtcDateTime;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{broadcast, Mutex};

const EVENT_CAPACITY: usize = 16;

/// how the sandbox answers `request_purchase`
#[derive(Debug, Clone)]
pub enum PurchaseBehavior {
	/// a new transaction is delivered to the update listeners
	Approve,
	/// the request itself is rejected with the given error
	Reject(StoreError),
	/// the request succeeds, the error arrives through the error listener
	Fail(StoreError),
	/// nothing is ever delivered
	Hang,
}

/// which optional listing functions the sandbox exposes
#[derive(Debug, Copy, Clone)]
pub struct ListingSupport {
	pub subscriptions: bool,
	pub items: bool,
	pub products: bool,
}

impl Default for ListingSupport {
	fn default() -> Self {
		Self {
			subscriptions: true,
			items: true,
			products: true,
		}
	}
}

/// sandbox store for tests and local development
pub struct InMemoryPurchaseStore {
	available: bool,
	listing: ListingSupport,
	products: Vec<Product>,
	behavior: Mutex<PurchaseBehavior>,
	connect_error: Mutex<Option<StoreError>>,
	connected: AtomicBool,
	pending: Mutex<Vec<PurchaseTransaction>>,
	finished: Mutex<Vec<String>>,
	finish_error: Mutex<Option<StoreError>>,
	purchase_requests: AtomicUsize,
	sender: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryPurchaseStore {
	fn default() -> Self {
		let (sender, _) = broadcast::channel(EVENT_CAPACITY);
		Self {
			available: true,
			listing: ListingSupport::default(),
			products: Vec::new(),
			behavior: Mutex::new(PurchaseBehavior::Approve),
			connect_error: Mutex::new(None),
			connected: AtomicBool::new(false),
			pending: Mutex::new(Vec::new()),
			finished: Mutex::new(Vec::new()),
			finish_error: Mutex::new(None),
			purchase_requests: AtomicUsize::new(0),
			sender,
		}
	}
}

impl InMemoryPurchaseStore {
	#[must_use]
	pub fn with_products(mut self, products: Vec<Product>) -> Self {
		self.products = products;
		self
	}

	#[must_use]
	pub fn with_listing(mut self, listing: ListingSupport) -> Self {
		self.listing = listing;
		self
	}

	/// simulates a missing native module
	#[must_use]
	pub fn unavailable(mut self) -> Self {
		self.available = false;
		self
	}

	pub async fn set_behavior(&self, behavior: PurchaseBehavior) {
		*self.behavior.lock().await = behavior;
	}

	pub async fn set_connect_error(&self, error: Option<StoreError>) {
		*self.connect_error.lock().await = error;
	}

	pub async fn set_finish_error(&self, error: Option<StoreError>) {
		*self.finish_error.lock().await = error;
	}

	/// a transaction the store holds unacknowledged from an earlier run
	pub async fn add_pending(&self, transaction: PurchaseTransaction) {
		self.pending.lock().await.push(transaction);
	}

	/// pushes `transaction` to the update listeners, as the store does on
	/// completion and on redelivery
	pub async fn deliver(&self, transaction: PurchaseTransaction) {
		{
			let mut pending = self.pending.lock().await;
			if !pending
				.iter()
				.any(|t| t.transaction_id == transaction.transaction_id)
			{
				pending.push(transaction.clone());
			}
		}

		self.publish(StoreEvent::Updated(transaction));
	}

	pub fn emit_error(&self, error: StoreError) {
		self.publish(StoreEvent::Error(error));
	}

	pub async fn pending_ids(&self) -> Vec<String> {
		self.pending
			.lock()
			.await
			.iter()
			.map(|t| t.transaction_id.clone())
			.collect()
	}

	pub async fn finished_ids(&self) -> Vec<String> {
		self.finished.lock().await.clone()
	}

	#[must_use]
	pub fn purchase_requests(&self) -> usize {
		self.purchase_requests.load(Ordering::SeqCst)
	}

	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	#[must_use]
	pub fn new_transaction(
		product_id: &str,
		now: UtcDateTime,
	) -> PurchaseTransaction {
		PurchaseTransaction {
			transaction_id: uuid::Uuid::new_v4().to_string(),
			product_id: product_id.to_string(),
			transaction_date: Some(now),
			receipt: None,
		}
	}

	fn publish(&self, event: StoreEvent) {
		if let Err(e) = self.sender.send(event) {
			tracing::warn!("no store listener: {:?}", e.0);
		}
	}

	fn listed(
		&self,
		product_ids: &[String],
		kind: Option<ItemKind>,
	) -> Vec<Product> {
		self.products
			.iter()
			.filter(|p| product_ids.contains(&p.product_id))
			.filter(|p| kind.map_or(true, |kind| p.kind() == kind))
			.cloned()
			.collect()
	}
}

#[async_trait]
impl PurchaseStore for InMemoryPurchaseStore {
	fn supports_connection(&self) -> bool {
		self.available
	}

	async fn init_connection(&self) -> StoreResult<bool> {
		if let Some(e) = self.connect_error.lock().await.clone() {
			return Err(e);
		}

		self.connected.store(true, Ordering::SeqCst);
		Ok(true)
	}

	async fn end_connection(&self) -> StoreResult<()> {
		self.connected.store(false, Ordering::SeqCst);
		Ok(())
	}

	async fn get_subscriptions(
		&self,
		product_ids: &[String],
	) -> StoreResult<Vec<Product>> {
		if !self.listing.subscriptions {
			return Err(StoreError::unsupported("getSubscriptions"));
		}
		Ok(self.listed(product_ids, Some(ItemKind::Subscription)))
	}

	async fn get_items(
		&self,
		product_ids: &[String],
		kind: ItemKind,
	) -> StoreResult<Vec<Product>> {
		if !self.listing.items {
			return Err(StoreError::unsupported("getItemsByType"));
		}
		Ok(self.listed(product_ids, Some(kind)))
	}

	async fn get_products(
		&self,
		product_ids: &[String],
	) -> StoreResult<Vec<Product>> {
		if !self.listing.products {
			return Err(StoreError::unsupported("getProducts"));
		}
		Ok(self.listed(product_ids, None))
	}

	async fn request_purchase(
		&self,
		product_id: &str,
	) -> StoreResult<()> {
		self.purchase_requests.fetch_add(1, Ordering::SeqCst);

		let behavior = self.behavior.lock().await.clone();

		match behavior {
			PurchaseBehavior::Approve => {
				let transaction =
					Self::new_transaction(product_id, Utc::now());
				self.deliver(transaction).await;
				Ok(())
			}
			PurchaseBehavior::Reject(e) => Err(e),
			PurchaseBehavior::Fail(e) => {
				self.emit_error(e);
				Ok(())
			}
			PurchaseBehavior::Hang => Ok(()),
		}
	}

	async fn get_available_purchases(
		&self,
	) -> StoreResult<Vec<PurchaseTransaction>> {
		Ok(self.pending.lock().await.clone())
	}

	async fn finish_transaction(
		&self,
		transaction: &PurchaseTransaction,
	) -> StoreResult<()> {
		if let Some(e) = self.finish_error.lock().await.clone() {
			return Err(e);
		}

		self.pending
			.lock()
			.await
			.retain(|t| t.transaction_id != transaction.transaction_id);
		self.finished
			.lock()
			.await
			.push(transaction.transaction_id.clone());

		Ok(())
	}

	fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
		self.sender.subscribe()
	}
}
