#![allow(
	clippy::unwrap_used,
	//TODO: https://github.com/rust-lang/rust-clippy/issues/7438
	clippy::semicolon_if_nothing_returned
)]

use async_trait::async_trait;
use iap_entitlements::{
	local::{InFlightFlag, InMemoryLocalStore},
	service::AttemptResult,
	session::InMemorySession,
	store::{
		codes, InMemoryPurchaseStore, Product, PurchaseBehavior,
		StoreError,
	},
	Error, IapConfig, IapEvent, IapEventHandler, IapService,
	InMemoryProfileDB, ProcessOutcome, ProfileDB, PurchaseFailure,
	PurchaseOutcome, PurchaseTransaction, SubscriptionPlan,
	TransactionSource,
};
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

struct ChannelHandler(mpsc::UnboundedSender<IapEvent>);

#[async_trait]
impl IapEventHandler for ChannelHandler {
	async fn on_event(&self, event: IapEvent) {
		let _ = self.0.send(event);
	}
}

struct Harness {
	service: Arc<IapService>,
	store: Arc<InMemoryPurchaseStore>,
	profiles: Arc<InMemoryProfileDB>,
	session: Arc<InMemorySession>,
	local: Arc<InMemoryLocalStore>,
	events: mpsc::UnboundedReceiver<IapEvent>,
}

impl Harness {
	fn drain(&mut self) -> Vec<IapEvent> {
		let mut events = Vec::new();
		while let Ok(event) = self.events.try_recv() {
			events.push(event);
		}
		events
	}

	/// waits for `count` events, some are emitted after the purchase
	/// result was handed out
	async fn next_events(&mut self, count: usize) -> Vec<IapEvent> {
		let mut events = Vec::new();
		while events.len() < count {
			let event = tokio::time::timeout(
				Duration::from_secs(5),
				self.events.recv(),
			)
			.await
			.unwrap()
			.unwrap();
			events.push(event);
		}
		events
	}

	async fn credits(&self) -> (bool, u32, u32) {
		let profile =
			self.profiles.get_profile("uid").await.unwrap().unwrap();
		(
			profile.is_pro_version,
			profile.credits_current,
			profile.credits_max,
		)
	}
}

fn product_ids() -> Vec<String> {
	vec![
		String::from("plan.yearly"),
		String::from("plan.monthly"),
		String::from("plan.weekly"),
	]
}

async fn harness(store: InMemoryPurchaseStore) -> Harness {
	let _ = tracing_subscriber::fmt::try_init();

	let store = Arc::new(store);
	let profiles = Arc::new(InMemoryProfileDB::default());
	let session = Arc::new(InMemorySession::signed_in("uid"));
	let local = Arc::new(InMemoryLocalStore::default());

	let service = IapService::new(
		IapConfig::default().with_product_ids(product_ids(), Vec::new()),
		store.clone(),
		profiles.clone(),
		session.clone(),
		local.clone(),
	);

	let (sender, events) = mpsc::unbounded_channel();
	service
		.set_event_handler(Arc::new(ChannelHandler(sender)))
		.await;

	Harness {
		service,
		store,
		profiles,
		session,
		local,
		events,
	}
}

async fn wait_finished(store: &InMemoryPurchaseStore, id: &str) {
	for _ in 0..100 {
		if store.finished_ids().await.iter().any(|f| f == id) {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[tokio::test]
async fn test_new_purchase_is_granted() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	assert!(h.service.initialize().await);

	let outcome = h.service.purchase_product("plan.yearly").await.unwrap();

	let transaction = match outcome {
		PurchaseOutcome::Granted(transaction) => transaction,
		PurchaseOutcome::Cancelled => panic!("purchase cancelled"),
	};
	assert_eq!(transaction.product_id, "plan.yearly");

	assert_eq!(h.credits().await, (true, 90, 90));
	assert_eq!(
		h.store.finished_ids().await,
		vec![transaction.transaction_id.clone()]
	);

	let status = h.service.status().await;
	assert!(!status.in_flight);
	assert_eq!(status.attempt, None);
	assert_eq!(status.last_result, Some(AttemptResult::Granted));

	assert_eq!(
		h.next_events(3).await,
		vec![
			IapEvent::Connected,
			IapEvent::PurchaseStarted {
				product_id: String::from("plan.yearly")
			},
			IapEvent::PurchaseGranted {
				product_id: String::from("plan.yearly"),
				plan: SubscriptionPlan::Yearly,
				orphaned: false,
			},
		]
	);
}

#[tokio::test]
async fn test_orphan_recovered_on_launch() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	h.store
		.add_pending(PurchaseTransaction::new("t2", "plan.monthly"))
		.await;

	assert!(h.service.initialize().await);

	assert_eq!(h.credits().await, (true, 75, 75));
	assert_eq!(h.store.finished_ids().await, vec![String::from("t2")]);
	assert_eq!(
		h.drain(),
		vec![
			IapEvent::Connected,
			IapEvent::PurchaseGranted {
				product_id: String::from("plan.monthly"),
				plan: SubscriptionPlan::Monthly,
				orphaned: true,
			},
		]
	);

	// latched for the rest of the process
	assert_eq!(
		h.service.check_for_orphaned_transactions().await.unwrap(),
		0
	);
}

#[tokio::test]
async fn test_duplicate_delivery_writes_once() {
	let h = harness(InMemoryPurchaseStore::default()).await;
	assert!(h.service.initialize().await);

	let transaction = match h
		.service
		.purchase_product("plan.weekly")
		.await
		.unwrap()
	{
		PurchaseOutcome::Granted(transaction) => transaction,
		PurchaseOutcome::Cancelled => panic!("purchase cancelled"),
	};
	assert_eq!(h.profiles.update_count(), 1);

	// the store hands the same transaction out again
	h.store.add_pending(transaction.clone()).await;

	let outcome = h
		.service
		.process_transaction(
			transaction.clone(),
			TransactionSource::Orphan,
		)
		.await
		.unwrap();
	assert_eq!(outcome, ProcessOutcome::Duplicate);

	let restored = h.service.restore_purchases().await.unwrap();
	assert_eq!(restored, vec![transaction]);

	assert_eq!(h.profiles.update_count(), 1);
	assert_eq!(h.credits().await, (true, 10, 10));
}

#[tokio::test]
async fn test_restore_without_purchases() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	assert!(h.service.initialize().await);

	let res = h.service.restore_purchases().await;

	assert!(matches!(res, Err(Error::NothingToRestore)));
	assert_eq!(h.drain(), vec![IapEvent::Connected]);
}

#[tokio::test]
async fn test_no_auth_leaves_transaction_pending() {
	let h = harness(InMemoryPurchaseStore::default()).await;
	h.session.sign_out().await;
	h.store
		.add_pending(PurchaseTransaction::new("t3", "plan.yearly"))
		.await;

	assert!(h.service.initialize().await);

	assert_eq!(h.profiles.update_count(), 0);
	assert!(h.store.finished_ids().await.is_empty());
	assert_eq!(h.store.pending_ids().await, vec![String::from("t3")]);

	h.session.sign_in("uid").await;

	let restored = h.service.restore_purchases().await.unwrap();

	assert_eq!(restored.len(), 1);
	assert_eq!(h.credits().await, (true, 90, 90));
	assert_eq!(h.store.finished_ids().await, vec![String::from("t3")]);
}

#[tokio::test]
async fn test_restore_without_auth_fails_retryable() {
	let h = harness(InMemoryPurchaseStore::default()).await;
	assert!(h.service.initialize().await);

	h.session.sign_out().await;
	h.store
		.add_pending(PurchaseTransaction::new("t5", "plan.monthly"))
		.await;

	let err = h.service.restore_purchases().await.unwrap_err();

	assert!(matches!(err, Error::NotAuthenticated));
	assert!(err.is_retryable());
	assert_eq!(h.store.pending_ids().await, vec![String::from("t5")]);
}

#[tokio::test]
async fn test_listener_without_in_flight_is_ignored() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	assert!(h.service.initialize().await);
	h.drain();

	h.store
		.deliver(PurchaseTransaction::new("t4", "plan.yearly"))
		.await;
	wait_finished(&h.store, "t4").await;

	assert_eq!(h.store.finished_ids().await, vec![String::from("t4")]);
	assert_eq!(h.profiles.update_count(), 0);
	assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_purchase_times_out() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	h.store.set_behavior(PurchaseBehavior::Hang).await;
	assert!(h.service.initialize().await);

	let res = h.service.purchase_product("plan.monthly").await;

	assert!(matches!(
		res,
		Err(Error::Purchase(PurchaseFailure::Timeout))
	));

	let status = h.service.status().await;
	assert!(!status.in_flight);
	assert_eq!(status.attempt, None);
	assert_eq!(status.last_result, Some(AttemptResult::TimedOut));
	assert!(!InFlightFlag::new(h.local.clone()).load().await.unwrap());

	assert_eq!(
		h.drain().last(),
		Some(&IapEvent::PurchaseFailed {
			reason: PurchaseFailure::Timeout
		})
	);
}

#[tokio::test(start_paused = true)]
async fn test_second_purchase_rejected_while_waiting() {
	let h = harness(InMemoryPurchaseStore::default()).await;
	h.store.set_behavior(PurchaseBehavior::Hang).await;
	assert!(h.service.initialize().await);

	let service = h.service.clone();
	let first = tokio::spawn(async move {
		service.purchase_product("plan.yearly").await
	});

	while h.service.status().await.attempt.is_none() {
		tokio::task::yield_now().await;
	}
	assert!(h.service.status().await.in_flight);

	let second = h.service.purchase_product("plan.weekly").await;
	assert!(matches!(second, Err(Error::PurchaseInProgress)));

	let first = first.await.unwrap();
	assert!(matches!(
		first,
		Err(Error::Purchase(PurchaseFailure::Timeout))
	));
	assert_eq!(h.store.purchase_requests(), 1);
}

#[tokio::test]
async fn test_cancel_is_not_an_error() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	h.store
		.set_behavior(PurchaseBehavior::Reject(StoreError::cancelled()))
		.await;
	assert!(h.service.initialize().await);

	let outcome = h.service.purchase_product("plan.yearly").await.unwrap();

	assert_eq!(outcome, PurchaseOutcome::Cancelled);
	assert!(!h.service.status().await.in_flight);
	assert_eq!(h.drain().last(), Some(&IapEvent::PurchaseCancelled));
}

#[tokio::test]
async fn test_error_listener_classifies_failure() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	h.store
		.set_behavior(PurchaseBehavior::Fail(StoreError::new(
			codes::ALREADY_OWNED,
			"item already owned",
		)))
		.await;
	assert!(h.service.initialize().await);

	let res = h.service.purchase_product("plan.yearly").await;

	assert!(matches!(
		res,
		Err(Error::Purchase(PurchaseFailure::AlreadyOwned))
	));

	let status = h.service.status().await;
	assert!(!status.in_flight);
	assert_eq!(
		status.last_result,
		Some(AttemptResult::Failed(PurchaseFailure::AlreadyOwned))
	);
	assert_eq!(
		h.next_events(3).await.last(),
		Some(&IapEvent::PurchaseFailed {
			reason: PurchaseFailure::AlreadyOwned
		})
	);
}

#[tokio::test]
async fn test_purchase_without_auth_fails_attempt() {
	let h = harness(InMemoryPurchaseStore::default()).await;
	assert!(h.service.initialize().await);
	h.session.sign_out().await;

	let res = h.service.purchase_product("plan.weekly").await;

	assert!(matches!(res, Err(Error::NotAuthenticated)));
	assert!(h.store.finished_ids().await.is_empty());
	assert_eq!(h.store.pending_ids().await.len(), 1);
	assert_eq!(h.profiles.update_count(), 0);

	let status = h.service.status().await;
	assert!(!status.in_flight);
	assert!(matches!(
		status.last_result,
		Some(AttemptResult::Failed(PurchaseFailure::Unknown(_)))
	));
	assert!(!InFlightFlag::new(h.local.clone()).load().await.unwrap());

	// an unrelated delivery later in the same process
	h.session.sign_in("uid").await;
	h.store
		.deliver(PurchaseTransaction::new("stray", "plan.yearly"))
		.await;
	wait_finished(&h.store, "stray").await;

	assert_eq!(h.store.finished_ids().await, vec![String::from("stray")]);
	assert_eq!(h.profiles.update_count(), 0);
}

struct SlowGrantHandler {
	sender: mpsc::UnboundedSender<IapEvent>,
	delay: Duration,
}

#[async_trait]
impl IapEventHandler for SlowGrantHandler {
	async fn on_event(&self, event: IapEvent) {
		if matches!(event, IapEvent::PurchaseGranted { .. }) {
			tokio::time::sleep(self.delay).await;
		}
		let _ = self.sender.send(event);
	}
}

#[tokio::test(start_paused = true)]
async fn test_grant_near_deadline_is_not_reported_as_timeout() {
	let mut h = harness(InMemoryPurchaseStore::default()).await;
	h.store.set_behavior(PurchaseBehavior::Hang).await;
	assert!(h.service.initialize().await);

	let (sender, events) = mpsc::unbounded_channel();
	h.events = events;
	h.service
		.set_event_handler(Arc::new(SlowGrantHandler {
			sender,
			delay: Duration::from_secs(2),
		}))
		.await;

	let store = h.store.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_secs(59)).await;
		store
			.deliver(PurchaseTransaction::new("t1", "plan.yearly"))
			.await;
	});

	let outcome = h.service.purchase_product("plan.yearly").await.unwrap();

	assert!(matches!(
		outcome,
		PurchaseOutcome::Granted(ref t) if t.transaction_id == "t1"
	));
	assert_eq!(h.profiles.update_count(), 1);
	assert_eq!(
		h.service.status().await.last_result,
		Some(AttemptResult::Granted)
	);

	let events = h.next_events(2).await;
	assert_eq!(
		events.last(),
		Some(&IapEvent::PurchaseGranted {
			product_id: String::from("plan.yearly"),
			plan: SubscriptionPlan::Yearly,
			orphaned: false,
		})
	);
	assert!(!events.iter().any(|e| matches!(
		e,
		IapEvent::PurchaseFailed { .. }
	)));
}

#[tokio::test]
async fn test_products_surface_errors_on_demand() {
	let mut h = harness(InMemoryPurchaseStore::default().with_products(
		vec![Product::subscription("plan.yearly", "$29.99")],
	))
	.await;
	assert!(h.service.initialize().await);
	h.drain();

	let products = h.service.get_products(false).await.unwrap();
	assert_eq!(products.len(), 1);
	assert_eq!(h.drain(), vec![IapEvent::ProductsLoaded { count: 1 }]);

	let mut empty = harness(InMemoryPurchaseStore::default()).await;
	assert!(empty.service.get_products(false).await.unwrap().is_empty());
	assert!(matches!(
		empty.service.get_products(true).await,
		Err(Error::Purchase(PurchaseFailure::ProductUnavailable))
	));
	assert_eq!(
		empty.drain(),
		vec![IapEvent::PurchaseFailed {
			reason: PurchaseFailure::ProductUnavailable
		}]
	);
}

#[tokio::test]
async fn test_unavailable_store_does_not_block() {
	let h = harness(InMemoryPurchaseStore::default().unavailable()).await;

	assert!(!h.service.initialize_with_fallback().await);
	assert!(!h.service.is_connected().await);
	assert!(matches!(
		h.service.purchase_product("plan.yearly").await,
		Err(Error::NotConnected)
	));
}

#[tokio::test]
async fn test_interrupted_purchase_recovered_after_restart() {
	let h = harness(InMemoryPurchaseStore::default()).await;
	// previous process died while the purchase was in flight
	InFlightFlag::new(h.local.clone()).set().await.unwrap();
	h.store
		.add_pending(PurchaseTransaction::new("t6", "plan.monthly"))
		.await;

	assert!(h.service.initialize().await);

	assert_eq!(h.credits().await, (true, 75, 75));
	assert!(!h.service.status().await.in_flight);

	// late redelivery of the same transaction
	let outcome = h
		.service
		.process_transaction(
			PurchaseTransaction::new("t6", "plan.monthly"),
			TransactionSource::Listener,
		)
		.await
		.unwrap();

	assert_eq!(outcome, ProcessOutcome::Duplicate);
	assert_eq!(h.profiles.update_count(), 1);
}
