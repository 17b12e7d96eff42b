use crate::{
	config::IapConfig,
	entitlement::EntitlementWriter,
	error::{Error, Result},
	local::{InFlightFlag, LocalStore},
	plan::SubscriptionPlan,
	profile::{CreditsInfo, ProfileDB},
	session::SessionProvider,
	store::{
		classify, Product, PurchaseFailure, PurchaseStore,
		PurchaseTransaction, StoreAdapter, StoreError, StoreEvent,
	},
	utc_time::UtcDateTime,
	IapEvent, IapEventHandler,
};
use chrono::Utc;
use std::{
	collections::HashSet,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Weak,
	},
};
use strum_macros::Display;
use tokio::{
	sync::{broadcast::error::RecvError, oneshot, Mutex, RwLock},
	task::JoinHandle,
};
use tracing::instrument;

/// where a transaction reached the engine from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum TransactionSource {
	Listener,
	Restore,
	Orphan,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
}

/// terminal state of the last purchase attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
	Granted,
	Failed(PurchaseFailure),
	Cancelled,
	TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseAttempt {
	pub id: u64,
	pub product_id: String,
	pub started_at: UtcDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IapStatus {
	pub connection: ConnectionState,
	/// attempt currently awaiting its transaction
	pub attempt: Option<PurchaseAttempt>,
	pub last_result: Option<AttemptResult>,
	pub in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
	Granted(PurchaseTransaction),
	Cancelled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
	/// seen before in this process
	Duplicate,
	/// listener delivery without a purchase in flight, acknowledged only
	Ignored,
	Granted,
}

type AttemptResolver = oneshot::Sender<Result<PurchaseTransaction>>;

struct PendingPurchase {
	attempt: PurchaseAttempt,
	resolver: AttemptResolver,
}

/// the reconciliation engine, one instance per process shared by `Arc`
pub struct IapService {
	config: IapConfig,
	adapter: StoreAdapter,
	entitlements: EntitlementWriter,
	session: Arc<dyn SessionProvider>,
	in_flight: InFlightFlag,
	init_lock: Mutex<()>,
	connection: RwLock<ConnectionState>,
	processed: Mutex<HashSet<String>>,
	pending: Mutex<Option<PendingPurchase>>,
	last_result: Mutex<Option<AttemptResult>>,
	listener: Mutex<Option<JoinHandle<()>>>,
	orphans_checked: AtomicBool,
	next_attempt: AtomicU64,
	event_handler: RwLock<Option<Arc<dyn IapEventHandler>>>,
}

impl IapService {
	#[must_use]
	pub fn new(
		config: IapConfig,
		store: Arc<dyn PurchaseStore>,
		profiles: Arc<dyn ProfileDB>,
		session: Arc<dyn SessionProvider>,
		local: Arc<dyn LocalStore>,
	) -> Arc<Self> {
		tracing::info!(
			"iap service: (platform: {}, products: {})",
			config.platform,
			config.product_ids().len()
		);

		Arc::new(Self {
			config,
			adapter: StoreAdapter::new(store),
			entitlements: EntitlementWriter::new(profiles, local.clone()),
			session,
			in_flight: InFlightFlag::new(local),
			init_lock: Mutex::new(()),
			connection: RwLock::new(ConnectionState::Disconnected),
			processed: Mutex::new(HashSet::new()),
			pending: Mutex::new(None),
			last_result: Mutex::new(None),
			listener: Mutex::new(None),
			orphans_checked: AtomicBool::new(false),
			next_attempt: AtomicU64::new(1),
			event_handler: RwLock::new(None),
		})
	}

	/// replaces any previously registered handler
	pub async fn set_event_handler(
		&self,
		handler: Arc<dyn IapEventHandler>,
	) {
		*self.event_handler.write().await = Some(handler);
	}

	pub async fn clear_event_handler(&self) {
		*self.event_handler.write().await = None;
	}

	#[must_use]
	pub const fn entitlements(&self) -> &EntitlementWriter {
		&self.entitlements
	}

	/// credits of the signed in user, cached values when offline
	pub async fn get_credits(&self) -> CreditsInfo {
		let user_id = self.session.current_user_id().await;
		self.entitlements.get_credits(user_id.as_deref()).await
	}

	pub async fn status(&self) -> IapStatus {
		IapStatus {
			connection: *self.connection.read().await,
			attempt: self
				.pending
				.lock()
				.await
				.as_ref()
				.map(|p| p.attempt.clone()),
			last_result: self.last_result.lock().await.clone(),
			in_flight: self.in_flight.is_set(),
		}
	}

	/// connects to the store, registers the transaction listener and
	/// sweeps orphaned transactions. returns whether purchases are usable,
	/// never fails
	#[instrument(skip(self))]
	pub async fn initialize(self: &Arc<Self>) -> bool {
		{
			let _guard = self.init_lock.lock().await;

			if *self.connection.read().await == ConnectionState::Connected
			{
				return true;
			}

			*self.connection.write().await = ConnectionState::Connecting;

			match self.in_flight.load().await {
				Ok(true) => {
					tracing::info!("purchase was in flight on last exit");
				}
				Ok(false) => (),
				Err(e) => tracing::error!("in-flight flag load: {}", e),
			}

			if !self.adapter.initialize_connection().await {
				*self.connection.write().await =
					ConnectionState::Disconnected;
				return false;
			}

			self.register_listener().await;

			*self.connection.write().await = ConnectionState::Connected;
		}

		self.emit(IapEvent::Connected).await;

		match self.check_for_orphaned_transactions().await {
			Ok(recovered) if recovered > 0 => {
				tracing::info!("recovered orphans: {}", recovered);
			}
			Ok(_) => (),
			Err(e) => tracing::warn!("orphan sweep failed: {}", e),
		}

		true
	}

	/// `initialize` bounded by `ready_fallback`. on expiry the caller gets
	/// `false` while initialization keeps running in the background
	pub async fn initialize_with_fallback(self: &Arc<Self>) -> bool {
		let service = self.clone();
		let init =
			tokio::spawn(async move { service.initialize().await });

		match tokio::time::timeout(self.config.ready_fallback, init).await
		{
			Ok(Ok(ready)) => ready,
			Ok(Err(e)) => {
				tracing::error!("initialize task failed: {}", e);
				false
			}
			Err(_) => {
				tracing::warn!(
					"store not ready after {:?}",
					self.config.ready_fallback
				);
				false
			}
		}
	}

	pub async fn is_connected(&self) -> bool {
		*self.connection.read().await == ConnectionState::Connected
	}

	/// an empty list is a normal outcome. with `surface_errors` it is
	/// reported as `ProductUnavailable` instead
	#[instrument(skip(self))]
	pub async fn get_products(
		&self,
		surface_errors: bool,
	) -> Result<Vec<Product>> {
		let products =
			self.adapter.get_products(self.config.product_ids()).await;

		if products.is_empty() {
			if surface_errors {
				let reason = PurchaseFailure::ProductUnavailable;
				self.emit(IapEvent::PurchaseFailed {
					reason: reason.clone(),
				})
				.await;
				return Err(Error::Purchase(reason));
			}
		} else {
			self.emit(IapEvent::ProductsLoaded {
				count: products.len(),
			})
			.await;
		}

		Ok(products)
	}

	/// starts a purchase and waits for the store to deliver its
	/// transaction. the entitlement itself is written by the listener
	#[instrument(skip(self), err)]
	pub async fn purchase_product(
		&self,
		product_id: &str,
	) -> Result<PurchaseOutcome> {
		if !self.is_connected().await {
			return Err(Error::NotConnected);
		}

		let (resolver, mut receiver) = oneshot::channel();

		let attempt = {
			let mut pending = self.pending.lock().await;
			if pending.is_some() {
				return Err(Error::PurchaseInProgress);
			}

			let attempt = PurchaseAttempt {
				id: self.next_attempt.fetch_add(1, Ordering::SeqCst),
				product_id: product_id.to_string(),
				started_at: Utc::now(),
			};

			// persisted before the store sees the request
			self.in_flight.set().await?;

			*pending = Some(PendingPurchase {
				attempt: attempt.clone(),
				resolver,
			});

			attempt
		};

		tracing::info!(target: "iap",
			attempt = attempt.id,
			%product_id,
			"purchase started"
		);

		self.emit(IapEvent::PurchaseStarted {
			product_id: product_id.to_string(),
		})
		.await;

		if let Err(e) = self.adapter.initiate_purchase(product_id).await {
			self.take_attempt(attempt.id).await;
			return self.reject_attempt(&e).await;
		}

		match tokio::time::timeout(
			self.config.purchase_timeout,
			&mut receiver,
		)
		.await
		{
			Ok(Ok(result)) => purchase_outcome(result),
			Ok(Err(_)) => {
				tracing::warn!("purchase attempt abandoned");
				self.end_attempt(AttemptResult::Failed(
					PurchaseFailure::NotConnected,
				))
				.await;
				Err(Error::Purchase(PurchaseFailure::NotConnected))
			}
			Err(_) => {
				if self.take_attempt(attempt.id).await.is_none() {
					// a listener owns the attempt and resolves it
					return match (&mut receiver).await {
						Ok(result) => purchase_outcome(result),
						Err(_) => Err(Error::Purchase(
							PurchaseFailure::NotConnected,
						)),
					};
				}

				tracing::warn!(target: "iap",
					attempt = attempt.id,
					%product_id,
					"purchase timed out"
				);
				self.end_attempt(AttemptResult::TimedOut).await;

				let reason = PurchaseFailure::Timeout;
				self.emit(IapEvent::PurchaseFailed {
					reason: reason.clone(),
				})
				.await;

				Err(Error::Purchase(reason))
			}
		}
	}

	/// decides and records the entitlement for one transaction, exactly
	/// once per transaction id and process.
	///
	/// the transaction is acknowledged after a grant or a deliberate skip.
	/// a failed grant leaves it unacknowledged and unmarked so a restore or
	/// the next orphan sweep can retry
	#[instrument(
		skip(self, transaction),
		fields(transaction_id = %transaction.transaction_id),
		err
	)]
	pub async fn process_transaction(
		&self,
		transaction: PurchaseTransaction,
		source: TransactionSource,
	) -> Result<ProcessOutcome> {
		if !self
			.processed
			.lock()
			.await
			.insert(transaction.transaction_id.clone())
		{
			tracing::info!(target: "iap",
				transaction_id = %transaction.transaction_id,
				%source,
				"duplicate transaction"
			);
			return Ok(ProcessOutcome::Duplicate);
		}

		let plan = self.config.plan_for_product(&transaction.product_id);

		let entitle = match source {
			TransactionSource::Listener => self.in_flight.is_set(),
			TransactionSource::Restore | TransactionSource::Orphan => true,
		};

		if !entitle {
			tracing::info!(target: "iap",
				transaction_id = %transaction.transaction_id,
				product_id = %transaction.product_id,
				%source,
				"no purchase in flight, transaction ignored"
			);
			self.acknowledge(&transaction).await;
			return Ok(ProcessOutcome::Ignored);
		}

		if let Err(e) = self.grant(&transaction, plan).await {
			self.processed
				.lock()
				.await
				.remove(&transaction.transaction_id);
			tracing::warn!(target: "iap",
				transaction_id = %transaction.transaction_id,
				%source,
				retryable = e.is_retryable(),
				"grant failed, transaction left pending: {}",
				e
			);
			return Err(e);
		}

		self.acknowledge(&transaction).await;

		let pending = match source {
			TransactionSource::Listener => {
				let pending = self.take_attempt_any().await;
				self.end_attempt(AttemptResult::Granted).await;
				pending
			}
			TransactionSource::Restore | TransactionSource::Orphan => {
				if self.pending.lock().await.is_none() {
					self.clear_in_flight().await;
				}
				None
			}
		};

		let event = IapEvent::PurchaseGranted {
			product_id: transaction.product_id.clone(),
			plan,
			orphaned: source == TransactionSource::Orphan,
		};

		if let Some(pending) = pending {
			resolve(pending, Ok(transaction));
		}

		self.emit(event).await;

		Ok(ProcessOutcome::Granted)
	}

	/// purchase-error listener: ends the running attempt with the
	/// classified failure
	#[instrument(skip(self))]
	pub async fn handle_purchase_error(&self, error: &StoreError) {
		let failure = classify(error);

		if failure == PurchaseFailure::Cancelled {
			tracing::info!(target: "iap", "purchase cancelled");
		} else {
			tracing::warn!(target: "iap",
				%failure,
				"purchase error: {}",
				error
			);
		}

		let pending = self.take_attempt_any().await;
		self.end_attempt(attempt_result(&failure)).await;

		if let Some(pending) = pending {
			resolve(pending, Err(Error::Purchase(failure.clone())));
		}

		self.emit(failure_event(failure)).await;
	}

	/// grants everything the store still holds for this account
	#[instrument(skip(self), err)]
	pub async fn restore_purchases(
		&self,
	) -> Result<Vec<PurchaseTransaction>> {
		let purchases = self.adapter.list_pending_purchases().await?;

		if purchases.is_empty() {
			tracing::info!("nothing to restore");
			return Err(Error::NothingToRestore);
		}

		let mut granted = 0;
		let mut first_error = None;

		for transaction in &purchases {
			match self
				.process_transaction(
					transaction.clone(),
					TransactionSource::Restore,
				)
				.await
			{
				Ok(ProcessOutcome::Granted) => granted += 1,
				Ok(_) => (),
				Err(e) => {
					first_error.get_or_insert(e);
				}
			}
		}

		if let Some(e) = first_error {
			return Err(e);
		}

		self.emit(IapEvent::RestoreCompleted { count: granted }).await;

		Ok(purchases)
	}

	/// once per process: grants transactions left unacknowledged by an
	/// earlier run. returns the number granted
	#[instrument(skip(self), err)]
	pub async fn check_for_orphaned_transactions(&self) -> Result<usize> {
		if self.orphans_checked.swap(true, Ordering::SeqCst) {
			return Ok(0);
		}

		let purchases = match self.adapter.list_pending_purchases().await
		{
			Ok(purchases) => purchases,
			Err(e) => {
				// the sweep did not happen, allow the next initialize to run it
				self.orphans_checked.store(false, Ordering::SeqCst);
				return Err(e.into());
			}
		};

		let unprocessed: Vec<PurchaseTransaction> = {
			let processed = self.processed.lock().await;
			purchases
				.into_iter()
				.filter(|t| !processed.contains(&t.transaction_id))
				.collect()
		};

		tracing::info!("orphaned transactions: {}", unprocessed.len());

		let mut recovered = 0;

		for transaction in unprocessed {
			match self
				.process_transaction(transaction, TransactionSource::Orphan)
				.await
			{
				Ok(ProcessOutcome::Granted) => recovered += 1,
				Ok(_) => (),
				Err(e) => tracing::warn!("orphan not recovered: {}", e),
			}
		}

		if self.in_flight.is_set() && self.pending.lock().await.is_none()
		{
			tracing::info!("clearing stale in-flight flag");
			self.clear_in_flight().await;
		}

		Ok(recovered)
	}

	/// stops listening, closes the store connection and drops a running
	/// attempt
	#[instrument(skip(self))]
	pub async fn cleanup(&self) {
		let _guard = self.init_lock.lock().await;

		if let Some(listener) = self.listener.lock().await.take() {
			listener.abort();
		}

		self.adapter.end_connection().await;

		// dropping the resolver ends a waiting `purchase_product`
		self.pending.lock().await.take();

		*self.connection.write().await = ConnectionState::Disconnected;

		tracing::info!("iap service cleaned up");
	}

	async fn register_listener(self: &Arc<Self>) {
		let mut listener = self.listener.lock().await;

		if listener.as_ref().map_or(false, |l| !l.is_finished()) {
			return;
		}

		let mut events = self.adapter.events();
		let service: Weak<Self> = Arc::downgrade(self);

		*listener = Some(tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(event) => match service.upgrade() {
						Some(service) => {
							service.on_store_event(event).await;
						}
						None => break,
					},
					Err(RecvError::Lagged(skipped)) => {
						tracing::error!("store events lost: {}", skipped);
					}
					Err(RecvError::Closed) => break,
				}
			}
		}));
	}

	async fn on_store_event(&self, event: StoreEvent) {
		match event {
			StoreEvent::Updated(transaction) => {
				if let Err(e) = self
					.process_transaction(
						transaction,
						TransactionSource::Listener,
					)
					.await
				{
					if let Some(pending) = self.take_attempt_any().await {
						let reason = PurchaseFailure::Unknown(e.to_string());
						self.end_attempt(AttemptResult::Failed(
							reason.clone(),
						))
						.await;
						resolve(pending, Err(e));
						self.emit(IapEvent::PurchaseFailed { reason }).await;
					}
				}
			}
			StoreEvent::Error(error) => {
				self.handle_purchase_error(&error).await;
			}
		}
	}

	async fn grant(
		&self,
		transaction: &PurchaseTransaction,
		plan: SubscriptionPlan,
	) -> Result<()> {
		let user_id = self
			.session
			.current_user_id()
			.await
			.ok_or(Error::NotAuthenticated)?;

		self.entitlements
			.grant_entitlement(
				&user_id,
				plan,
				&transaction.product_id,
				&transaction.transaction_id,
			)
			.await
	}

	async fn acknowledge(&self, transaction: &PurchaseTransaction) {
		match self.adapter.finish_transaction(transaction).await {
			Ok(_) => tracing::info!(target: "iap",
				transaction_id = %transaction.transaction_id,
				"transaction finished"
			),
			// redelivered on next launch, the grant is repeatable
			Err(e) => tracing::error!(target: "iap",
				transaction_id = %transaction.transaction_id,
				"finish transaction failed: {}",
				e
			),
		}
	}

	async fn reject_attempt(
		&self,
		error: &StoreError,
	) -> Result<PurchaseOutcome> {
		let failure = classify(error);

		tracing::info!(target: "iap",
			%failure,
			"purchase request rejected: {}",
			error
		);

		self.end_attempt(attempt_result(&failure)).await;
		self.emit(failure_event(failure.clone())).await;

		match failure {
			PurchaseFailure::Cancelled => Ok(PurchaseOutcome::Cancelled),
			failure => Err(Error::Purchase(failure)),
		}
	}

	/// takes the pending slot only if it still holds `attempt_id`
	async fn take_attempt(&self, attempt_id: u64) -> Option<PendingPurchase> {
		let mut pending = self.pending.lock().await;

		if pending.as_ref().map(|p| p.attempt.id) == Some(attempt_id) {
			pending.take()
		} else {
			None
		}
	}

	async fn take_attempt_any(&self) -> Option<PendingPurchase> {
		self.pending.lock().await.take()
	}

	async fn end_attempt(&self, result: AttemptResult) {
		self.clear_in_flight().await;
		*self.last_result.lock().await = Some(result);
	}

	async fn clear_in_flight(&self) {
		if let Err(e) = self.in_flight.clear().await {
			tracing::error!("in-flight flag clear failed: {}", e);
		}
	}

	async fn emit(&self, event: IapEvent) {
		let handler = self.event_handler.read().await.clone();

		if let Some(handler) = handler {
			handler.on_event(event).await;
		}
	}
}

fn resolve(pending: PendingPurchase, result: Result<PurchaseTransaction>) {
	if pending.resolver.send(result).is_err() {
		tracing::debug!(
			"attempt {} no longer awaited",
			pending.attempt.id
		);
	}
}

fn purchase_outcome(
	result: Result<PurchaseTransaction>,
) -> Result<PurchaseOutcome> {
	match result {
		Ok(transaction) => Ok(PurchaseOutcome::Granted(transaction)),
		Err(Error::Purchase(PurchaseFailure::Cancelled)) => {
			Ok(PurchaseOutcome::Cancelled)
		}
		Err(e) => Err(e),
	}
}

fn attempt_result(failure: &PurchaseFailure) -> AttemptResult {
	match failure {
		PurchaseFailure::Cancelled => AttemptResult::Cancelled,
		PurchaseFailure::Timeout => AttemptResult::TimedOut,
		failure => AttemptResult::Failed(failure.clone()),
	}
}

fn failure_event(failure: PurchaseFailure) -> IapEvent {
	match failure {
		PurchaseFailure::Cancelled => IapEvent::PurchaseCancelled,
		reason => IapEvent::PurchaseFailed { reason },
	}
}
