use crate::{
	error::{Error, Result},
	utc_time::UtcDateTime,
};
use chrono::{DateTime, Utc};
use rusoto_core::{
	credential::{DefaultCredentialsProvider, StaticProvider},
	HttpClient, Region,
};
use rusoto_dynamodb::{
	AttributeDefinition, AttributeValue, CreateTableInput, DynamoDb,
	DynamoDbClient, KeySchemaElement, ListTablesInput,
	ProvisionedThroughput,
};
use std::collections::HashMap;

pub type DynamoHashMap = HashMap<String, AttributeValue>;

#[must_use]
pub fn db_key(key: &str, value: &str) -> DynamoHashMap {
	let mut attrs = HashMap::new();
	attrs.insert(key.to_string(), attr_s(value.to_string()));
	attrs
}

#[must_use]
pub fn attr_s(value: String) -> AttributeValue {
	AttributeValue {
		s: Some(value),
		..AttributeValue::default()
	}
}

#[must_use]
pub fn attr_n(value: u32) -> AttributeValue {
	AttributeValue {
		n: Some(value.to_string()),
		..AttributeValue::default()
	}
}

#[must_use]
pub fn attr_bool(value: bool) -> AttributeValue {
	AttributeValue {
		bool: Some(value),
		..AttributeValue::default()
	}
}

#[must_use]
pub fn attr_date(value: UtcDateTime) -> AttributeValue {
	attr_s(value.to_rfc3339())
}

pub fn read_date(
	attributes: &DynamoHashMap,
	key: &str,
) -> Option<UtcDateTime> {
	attributes
		.get(key)
		.and_then(|attr| attr.s.as_deref())
		.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
		.map(|date| date.with_timezone(&Utc))
}

/// should only be used for local test setups, creates a DB with `id`(string hash) as the primary key
/// # Errors
/// fails with network errors
pub async fn table_init<DB>(db: &DB, table: &str) -> Result<()>
where
	DB: DynamoDb + Clone + Send + Sync,
{
	let tables = db
		.list_tables(ListTablesInput {
			limit: None,
			exclusive_start_table_name: None,
		})
		.await?;

	let table_exists = tables
		.table_names
		.unwrap_or_default()
		.iter()
		.any(|n| *n == table);

	tracing::trace!("db table exists: {}", table_exists);

	if !table_exists {
		if local_endpoint().is_none() {
			return Err(Error::TableNotFound(table.to_string()));
		}

		tracing::info!("create table: {}", table);

		let _res = db
			.create_table(CreateTableInput {
				table_name: table.into(),
				key_schema: vec![KeySchemaElement {
					attribute_name: "id".into(),
					key_type: "HASH".into(),
				}],
				attribute_definitions: vec![AttributeDefinition {
					attribute_name: "id".into(),
					attribute_type: "S".into(),
				}],
				provisioned_throughput: Some(ProvisionedThroughput {
					read_capacity_units: 1,
					write_capacity_units: 1,
				}),
				..CreateTableInput::default()
			})
			.await?;

		tracing::info!("table created: {:?}", table);
	}

	Ok(())
}

/// endpoint of a local dynamodb, set when `DDB_LOCAL` is present.
/// `DDB_URL` overrides the default `http://localhost:8000`
#[must_use]
pub fn local_endpoint() -> Option<String> {
	std::env::var("DDB_LOCAL").ok()?;

	Some(
		std::env::var("DDB_URL")
			.unwrap_or_else(|_| String::from("http://localhost:8000")),
	)
}

/// profile table client. a local endpoint uses static dummy
/// credentials, otherwise the default aws credential chain and region
pub fn db_client(endpoint: Option<String>) -> Result<DynamoDbClient> {
	let dispatcher = HttpClient::new()?;

	match endpoint {
		Some(endpoint) => {
			tracing::info!("ddb url: {}", endpoint);

			Ok(DynamoDbClient::new_with(
				dispatcher,
				StaticProvider::new_minimal(
					String::from("local"),
					String::from("local"),
				),
				Region::Custom {
					name: "local".into(),
					endpoint,
				},
			))
		}
		None => Ok(DynamoDbClient::new_with(
			dispatcher,
			DefaultCredentialsProvider::new()?,
			Region::default(),
		)),
	}
}

pub fn db_init() -> Result<DynamoDbClient> {
	db_client(local_endpoint())
}
