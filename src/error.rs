use crate::store::{PurchaseFailure, StoreError};
use rusoto_core::{
	credential::CredentialsError, request::TlsError, RusotoError,
};
use rusoto_dynamodb::{
	CreateTableError, GetItemError, ListTablesError, PutItemError,
	UpdateItemError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("purchase failed: {0}")]
	Purchase(PurchaseFailure),

	#[error("no authenticated user")]
	NotAuthenticated,

	#[error("no purchases to restore")]
	NothingToRestore,

	#[error("another purchase is already in progress")]
	PurchaseInProgress,

	#[error("store connection not established")]
	NotConnected,

	#[error("profile not found for user: {0}")]
	ProfileNotFound(String),

	#[error("serde_json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("aws error: {0}")]
	RusotoGetItem(#[from] RusotoError<GetItemError>),

	#[error("aws error: {0}")]
	RusotoPutItem(#[from] RusotoError<PutItemError>),

	#[error("aws error: {0}")]
	RusotoUpdateItem(#[from] RusotoError<UpdateItemError>),

	#[error("aws error: {0}")]
	RusotoListTables(#[from] RusotoError<ListTablesError>),

	#[error("aws error: {0}")]
	RusotoCreateTable(#[from] RusotoError<CreateTableError>),

	#[error("aws error: {0}")]
	RusotoCredentials(#[from] CredentialsError),

	#[error("aws error: {0}")]
	RusotoTls(#[from] TlsError),

	#[error("table {0} not found error")]
	TableNotFound(String),

	#[error("DynamoDeserializeError for field: {0}")]
	DynamoDeserialize(&'static str),

	#[error("custom error: {0}")]
	Custom(String),
}

impl Error {
	/// whether running the same reconciliation again later may succeed.
	/// a transaction is never acknowledged with the store after a
	/// retryable error, so the next orphan sweep or restore sees it again
	#[must_use]
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::NotAuthenticated
			| Self::NotConnected
			| Self::RusotoGetItem(_)
			| Self::RusotoPutItem(_)
			| Self::RusotoUpdateItem(_)
			| Self::RusotoListTables(_)
			| Self::RusotoCredentials(_)
			| Self::RusotoTls(_)
			| Self::Io(_) => true,
			Self::Store(e) => e.is_transient(),
			Self::Purchase(failure) => failure.is_retryable(),
			_ => false,
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
