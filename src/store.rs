//! Durable registry store.
//!
//! One table holds every key family from [`crate::model`]. Items are JSON
//! documents; the attributes that participate in conditional writes
//! (`expires_at`, `owner_id`) are mirrored as top-level typed attributes so
//! condition expressions can reference them.
//!
//! Two backends share the contract:
//!
//! - [`DynamoStore`] — production, backed by DynamoDB with `expires_at` as
//!   the table's TTL attribute
//! - [`MemoryStore`] — in-process, for tests and local development

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{OpsError, OpsResult, classify_aws};

/* ============================= CONTRACT ============================= */

/// Condition attached to a write. A failed condition surfaces as
/// [`OpsError::ConditionFailed`], distinct from not-found.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    /// The key must not exist.
    Absent,
    /// The key is absent, or its numeric attribute is below the given value.
    /// This is the lease-steal condition.
    AbsentOrNumberLess { attr: &'static str, value: i64 },
    /// The item's string attribute must equal the given value. Applied to a
    /// missing key this also fails the condition (DynamoDB semantics).
    AttrEquals { attr: &'static str, value: String },
}

/// Key-value contract over the registry table.
///
/// Scans return a consistent snapshot of the keys present at scan start;
/// items written mid-scan may or may not appear.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> OpsResult<Option<Value>>;

    async fn put(&self, key: &str, doc: Value, cond: Option<WriteCondition>) -> OpsResult<()>;

    async fn delete(&self, key: &str, cond: Option<WriteCondition>) -> OpsResult<()>;

    async fn scan_prefix(&self, prefix: &str) -> OpsResult<Vec<(String, Value)>>;
}

/// Read a record and deserialize it.
pub async fn get_typed<T: DeserializeOwned>(store: &dyn Store, key: &str) -> OpsResult<Option<T>> {
    match store.get(key).await? {
        Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
        None => Ok(None),
    }
}

/// Serialize a record and write it.
pub async fn put_typed<T: Serialize>(
    store: &dyn Store,
    key: &str,
    value: &T,
    cond: Option<WriteCondition>,
) -> OpsResult<()> {
    let doc = serde_json::to_value(value)
        .map_err(|e| OpsError::Fatal(format!("serialize {key}: {e}")))?;
    store.put(key, doc, cond).await
}

/* ============================= MEMORY ============================= */

/// In-process store with the same conditional-write semantics as DynamoDB.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_condition(existing: Option<&Value>, cond: &WriteCondition) -> bool {
    match cond {
        WriteCondition::Absent => existing.is_none(),
        WriteCondition::AbsentOrNumberLess { attr, value } => match existing {
            None => true,
            Some(doc) => doc.get(attr).and_then(Value::as_i64).is_some_and(|v| v < *value),
        },
        WriteCondition::AttrEquals { attr, value } => existing
            .and_then(|doc| doc.get(attr))
            .and_then(Value::as_str)
            .is_some_and(|v| v == value),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> OpsResult<Option<Value>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, doc: Value, cond: Option<WriteCondition>) -> OpsResult<()> {
        let mut items = self.items.lock().await;
        if let Some(cond) = &cond
            && !check_condition(items.get(key), cond)
        {
            return Err(OpsError::ConditionFailed(format!("put {key}")));
        }
        items.insert(key.to_string(), doc);
        Ok(())
    }

    async fn delete(&self, key: &str, cond: Option<WriteCondition>) -> OpsResult<()> {
        let mut items = self.items.lock().await;
        if let Some(cond) = &cond
            && !check_condition(items.get(key), cond)
        {
            return Err(OpsError::ConditionFailed(format!("delete {key}")));
        }
        items.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> OpsResult<Vec<(String, Value)>> {
        let items = self.items.lock().await;
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/* ============================= DYNAMODB ============================= */

/// DynamoDB-backed store. Single table, `pk` partition key, the document
/// serialized into a `doc` string attribute, with `expires_at` (number) and
/// `owner_id` (string) mirrored for condition expressions and table TTL.
pub struct DynamoStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self { client, table: table.into() }
    }

    fn item_for(key: &str, doc: &Value) -> OpsResult<std::collections::HashMap<String, AttributeValue>> {
        let mut item = std::collections::HashMap::new();
        item.insert("pk".to_string(), AttributeValue::S(key.to_string()));
        item.insert(
            "doc".to_string(),
            AttributeValue::S(serde_json::to_string(doc)?),
        );
        if let Some(expires) = doc.get("expires_at").and_then(Value::as_i64) {
            item.insert("expires_at".to_string(), AttributeValue::N(expires.to_string()));
        }
        if let Some(owner) = doc.get("owner_id").and_then(Value::as_str) {
            item.insert("owner_id".to_string(), AttributeValue::S(owner.to_string()));
        }
        Ok(item)
    }
}

#[async_trait]
impl Store for DynamoStore {
    async fn get(&self, key: &str) -> OpsResult<Option<Value>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(|e| classify_aws(format!("dynamodb get {key}: {e}")))?;

        let Some(item) = out.item else { return Ok(None) };
        let doc = item
            .get("doc")
            .and_then(|a| a.as_s().ok())
            .ok_or_else(|| OpsError::Fatal(format!("item {key} has no doc attribute")))?;
        Ok(Some(serde_json::from_str(doc)?))
    }

    async fn put(&self, key: &str, doc: Value, cond: Option<WriteCondition>) -> OpsResult<()> {
        let mut req = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(Self::item_for(key, &doc)?));

        match &cond {
            None => {}
            Some(WriteCondition::Absent) => {
                req = req.condition_expression("attribute_not_exists(pk)");
            }
            Some(WriteCondition::AbsentOrNumberLess { attr, value }) => {
                req = req
                    .condition_expression("attribute_not_exists(pk) OR #a < :v")
                    .expression_attribute_names("#a", attr.to_string())
                    .expression_attribute_values(":v", AttributeValue::N(value.to_string()));
            }
            Some(WriteCondition::AttrEquals { attr, value }) => {
                req = req
                    .condition_expression("#a = :v")
                    .expression_attribute_names("#a", attr.to_string())
                    .expression_attribute_values(":v", AttributeValue::S(value.clone()));
            }
        }

        req.send().await.map_err(|e| {
            let service = e.into_service_error();
            if service.is_conditional_check_failed_exception() {
                OpsError::ConditionFailed(format!("put {key}"))
            } else {
                classify_aws(format!("dynamodb put {key}: {service}"))
            }
        })?;
        Ok(())
    }

    async fn delete(&self, key: &str, cond: Option<WriteCondition>) -> OpsResult<()> {
        let mut req = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(key.to_string()));

        match &cond {
            None => {}
            Some(WriteCondition::Absent) => {
                req = req.condition_expression("attribute_not_exists(pk)");
            }
            Some(WriteCondition::AbsentOrNumberLess { attr, value }) => {
                req = req
                    .condition_expression("attribute_not_exists(pk) OR #a < :v")
                    .expression_attribute_names("#a", attr.to_string())
                    .expression_attribute_values(":v", AttributeValue::N(value.to_string()));
            }
            Some(WriteCondition::AttrEquals { attr, value }) => {
                req = req
                    .condition_expression("#a = :v")
                    .expression_attribute_names("#a", attr.to_string())
                    .expression_attribute_values(":v", AttributeValue::S(value.clone()));
            }
        }

        req.send().await.map_err(|e| {
            let service = e.into_service_error();
            if service.is_conditional_check_failed_exception() {
                OpsError::ConditionFailed(format!("delete {key}"))
            } else {
                classify_aws(format!("dynamodb delete {key}: {service}"))
            }
        })?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> OpsResult<Vec<(String, Value)>> {
        let mut results = Vec::new();
        let mut start_key = None;

        loop {
            let out = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression("begins_with(pk, :p)")
                .expression_attribute_values(":p", AttributeValue::S(prefix.to_string()))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| classify_aws(format!("dynamodb scan {prefix}: {e}")))?;

            for item in out.items() {
                let (Some(pk), Some(doc)) = (
                    item.get("pk").and_then(|a| a.as_s().ok()),
                    item.get("doc").and_then(|a| a.as_s().ok()),
                ) else {
                    continue;
                };
                results.push((pk.clone(), serde_json::from_str(doc)?));
            }

            start_key = out.last_evaluated_key;
            if start_key.is_none() {
                break;
            }
        }

        Ok(results)
    }
}

/* ============================= TESTS ============================= */
