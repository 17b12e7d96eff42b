use super::{
	ProfileDB, ProfileUpdate, SubscriptionProfile, UserId,
};
use crate::{
	dynamo_util::{
		attr_bool, attr_date, attr_n, attr_s, db_key, read_date,
		table_init, DynamoHashMap,
	},
	error::{Error, Result},
	plan::SubscriptionPlan,
};
use async_trait::async_trait;
use rusoto_core::RusotoError;
use rusoto_dynamodb::{
	AttributeValue, DynamoDb, DynamoDbClient, GetItemInput,
	PutItemError, PutItemInput, UpdateItemInput,
};
use std::{
	collections::HashMap,
	convert::TryFrom,
	str::FromStr,
};
use tracing::instrument;

#[derive(Clone)]
pub struct DynamoProfileDB {
	db: DynamoDbClient,
	table: String,
}

impl DynamoProfileDB {
	/// create new `DynamoProfileDB` instance reusing an existing db client connection
	///
	/// # Errors
	///
	/// local table init could fail creating table of the check
	/// for the existance of the right table remote could fail
	pub async fn new(
		table_name: &str,
		db: DynamoDbClient,
	) -> Result<Self> {
		table_init(&db, table_name).await?;
		Ok(Self {
			db,
			table: table_name.to_string(),
		})
	}
}

/// `SET` expression plus its placeholders for all fields present in `update`
fn update_expression(
	update: ProfileUpdate,
) -> (String, HashMap<String, String>, DynamoHashMap) {
	let mut fields: Vec<(&'static str, AttributeValue)> = Vec::new();

	if let Some(plan) = update.subscription_plan {
		fields.push(("subscription_plan", attr_s(plan.to_string())));
	}
	if let Some(id) = update.subscription_id {
		fields.push(("subscription_id", attr_s(id)));
	}
	if let Some(id) = update.product_id {
		fields.push(("product_id", attr_s(id)));
	}
	if let Some(date) = update.purchase_time {
		fields.push(("purchase_time", attr_date(date)));
	}
	if let Some(date) = update.subscription_start_date {
		fields.push(("subscription_start_date", attr_date(date)));
	}
	if let Some(date) = update.last_credit_reset {
		fields.push(("last_credit_reset", attr_date(date)));
	}
	if let Some(pro) = update.is_pro_version {
		fields.push(("is_pro_version", attr_bool(pro)));
	}
	if let Some(current) = update.credits_current {
		fields.push(("credits_current", attr_n(current)));
	}
	if let Some(max) = update.credits_max {
		fields.push(("credits_max", attr_n(max)));
	}

	let mut names = HashMap::with_capacity(fields.len());
	let mut values = HashMap::with_capacity(fields.len());
	let mut sets = Vec::with_capacity(fields.len());

	for (name, value) in fields {
		names.insert(format!("#{}", name), name.to_string());
		values.insert(format!(":{}", name), value);
		sets.push(format!("#{0} = :{0}", name));
	}

	(format!("SET {}", sets.join(", ")), names, values)
}

impl From<SubscriptionProfile> for DynamoHashMap {
	fn from(v: SubscriptionProfile) -> Self {
		let mut map = Self::new();

		map.insert("id".to_string(), attr_s(v.user_id));
		map.insert(
			"is_pro_version".to_string(),
			attr_bool(v.is_pro_version),
		);
		map.insert(
			"credits_current".to_string(),
			attr_n(v.credits_current),
		);
		map.insert("credits_max".to_string(), attr_n(v.credits_max));

		if let Some(plan) = v.subscription_plan {
			map.insert(
				"subscription_plan".to_string(),
				attr_s(plan.to_string()),
			);
		}
		if let Some(id) = v.subscription_id {
			map.insert("subscription_id".to_string(), attr_s(id));
		}
		if let Some(id) = v.product_id {
			map.insert("product_id".to_string(), attr_s(id));
		}
		if let Some(date) = v.purchase_time {
			map.insert("purchase_time".to_string(), attr_date(date));
		}
		if let Some(date) = v.subscription_start_date {
			map.insert(
				"subscription_start_date".to_string(),
				attr_date(date),
			);
		}
		if let Some(date) = v.last_credit_reset {
			map.insert(
				"last_credit_reset".to_string(),
				attr_date(date),
			);
		}

		map
	}
}

fn read_u32(attributes: &DynamoHashMap, key: &str) -> Option<u32> {
	attributes
		.get(key)
		.and_then(|attr| attr.n.as_ref())
		.and_then(|n| n.parse::<u32>().ok())
}

impl TryFrom<DynamoHashMap> for SubscriptionProfile {
	type Error = Error;

	fn try_from(attributes: DynamoHashMap) -> Result<Self> {
		Ok(Self {
			user_id: attributes
				.get("id")
				.and_then(|attr| attr.s.clone())
				.ok_or(Error::DynamoDeserialize("id"))?,
			subscription_plan: attributes
				.get("subscription_plan")
				.and_then(|attr| attr.s.as_deref())
				.and_then(|s| SubscriptionPlan::from_str(s).ok()),
			subscription_id: attributes
				.get("subscription_id")
				.and_then(|attr| attr.s.clone()),
			product_id: attributes
				.get("product_id")
				.and_then(|attr| attr.s.clone()),
			purchase_time: read_date(&attributes, "purchase_time"),
			subscription_start_date: read_date(
				&attributes,
				"subscription_start_date",
			),
			last_credit_reset: read_date(
				&attributes,
				"last_credit_reset",
			),
			is_pro_version: attributes
				.get("is_pro_version")
				.and_then(|attr| attr.bool)
				.ok_or(Error::DynamoDeserialize("is_pro_version"))?,
			credits_current: read_u32(&attributes, "credits_current")
				.ok_or(Error::DynamoDeserialize("credits_current"))?,
			credits_max: read_u32(&attributes, "credits_max")
				.ok_or(Error::DynamoDeserialize("credits_max"))?,
		})
	}
}

#[async_trait]
impl ProfileDB for DynamoProfileDB {
	#[instrument(skip(self), err)]
	async fn get_profile(
		&self,
		user_id: &str,
	) -> Result<Option<SubscriptionProfile>> {
		let item = self
			.db
			.get_item(GetItemInput {
				table_name: self.table.clone(),
				key: db_key("id", user_id),
				consistent_read: Some(true),
				..GetItemInput::default()
			})
			.await?
			.item;

		item.map(SubscriptionProfile::try_from).transpose()
	}

	#[instrument(skip(self), err)]
	async fn update_profile(
		&self,
		user_id: &str,
		update: ProfileUpdate,
	) -> Result<()> {
		if update.is_empty() {
			return Ok(());
		}

		let (expression, names, values) = update_expression(update);

		let input = UpdateItemInput {
			table_name: self.table.clone(),
			key: db_key("id", user_id),
			update_expression: Some(expression),
			condition_expression: Some(String::from(
				"attribute_exists(id)",
			)),
			expression_attribute_names: Some(names),
			expression_attribute_values: Some(values),
			..UpdateItemInput::default()
		};

		self.db.update_item(input).await?;

		Ok(())
	}

	#[instrument(skip(self), err)]
	async fn create_profile_if_missing(
		&self,
		user_id: &str,
	) -> Result<()> {
		let user_id: UserId = user_id.to_string();
		let input = PutItemInput {
			table_name: self.table.clone(),
			item: SubscriptionProfile::new(&user_id).into(),
			condition_expression: Some(String::from(
				"attribute_not_exists(id)",
			)),
			..PutItemInput::default()
		};

		match self.db.put_item(input).await {
			Ok(_) => {
				tracing::info!("profile created: {}", user_id);
				Ok(())
			}
			Err(RusotoError::Service(
				PutItemError::ConditionalCheckFailed(_),
			)) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}
