//! Request payload construction
//!
//! The runner only knows the [`PayloadBuilder`] capability. The catalog picks a
//! concrete builder per operation through [`PayloadSpec`]; tests usually plug
//! in a closure with [`payload_fn`].

use crate::dataset::Row;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub type Payload = Value;

/// Turns one dataset row into a JSON request body
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, row: &Row) -> Payload;

    /// Short label used in logs and dry-run plans
    fn kind(&self) -> &str;
}

/// Builder configuration as declared in the profile catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadSpec {
    Markdown(MarkdownPayload),
    DateChecker(DateCheckerPayload),
}

impl PayloadSpec {
    pub fn into_builder(self) -> Arc<dyn PayloadBuilder> {
        match self {
            PayloadSpec::Markdown(p) => Arc::new(p),
            PayloadSpec::DateChecker(p) => Arc::new(p),
        }
    }
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Numeric JSON value for a raw cell; blank or unparsable cells become null
fn numeric(raw: Option<&str>) -> Value {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Value::Null;
    };
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn optional<'a>(row: &'a Row, column: &Option<String>) -> Option<&'a str> {
    column.as_deref().and_then(|c| row.non_blank(c))
}

fn or_default(value: Value, default: i64) -> Value {
    match value {
        Value::Null => Value::from(default),
        n => n,
    }
}

fn text(raw: Option<&str>) -> Value {
    raw.map(|s| Value::String(s.to_string()))
        .unwrap_or(Value::Null)
}

/// Column mapping for the markdown submission endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkdownPayload {
    pub store_id_column: String,
    pub store_banner_column: Option<String>,
    pub barcode_columns: Vec<String>,
    pub item_id_columns: Vec<String>,
    pub item_group_id_columns: Vec<String>,
    pub item_group_type_column: Option<String>,
    pub original_price_column: String,
    pub current_price_column: String,
    pub qty_markdown_column: String,
    pub qty_on_hand_column: String,
    pub qty_sold_today_column: Option<String>,
    pub markdown_type_column: Option<String>,
    pub markdown_iteration_column: Option<String>,
    pub expiry_column: Option<String>,
    /// Picked at random per request when the row has no markdown type
    pub markdown_types: Vec<String>,
    pub request_prefix: String,
    /// chrono format for the date part of the request id
    pub request_date_format: String,
    pub request_suffix: Option<String>,
    pub expiry_hours_offset: i64,
    pub date_only_expiry: bool,
}

impl Default for MarkdownPayload {
    fn default() -> Self {
        Self {
            store_id_column: "STOREID".to_string(),
            store_banner_column: None,
            barcode_columns: columns(&["BarCode", "BARCODE"]),
            item_id_columns: columns(&["ITEMID"]),
            item_group_id_columns: columns(&["ITEMGROUPID", "itemgroupid"]),
            item_group_type_column: None,
            original_price_column: "ORIGINAL_PRICE".to_string(),
            current_price_column: "CURRENT_PRICE".to_string(),
            qty_markdown_column: "QTY_MARKDOWN".to_string(),
            qty_on_hand_column: "QTY_ON_HAND".to_string(),
            qty_sold_today_column: None,
            markdown_type_column: None,
            markdown_iteration_column: None,
            expiry_column: None,
            markdown_types: columns(&["Short Dated"]),
            request_prefix: "MarkdownTest".to_string(),
            request_date_format: "%Y-%m-%d".to_string(),
            request_suffix: None,
            expiry_hours_offset: 0,
            date_only_expiry: true,
        }
    }
}

impl MarkdownPayload {
    fn request_id(&self, now: DateTime<Utc>) -> String {
        let mut id = format!(
            "{}-{}",
            self.request_prefix,
            now.format(&self.request_date_format)
        );
        if let Some(suffix) = self.request_suffix.as_deref().map(str::trim) {
            if !suffix.is_empty() {
                id.push('-');
                id.push_str(suffix);
            }
        }
        id
    }

    fn expiry(&self, row: &Row, now: DateTime<Utc>) -> String {
        if let Some(date) = optional(row, &self.expiry_column) {
            return date.to_string();
        }
        let expiry = now + ChronoDuration::hours(self.expiry_hours_offset);
        if self.date_only_expiry {
            expiry.format("%Y-%m-%d").to_string()
        } else {
            expiry.to_rfc3339_opts(SecondsFormat::Millis, true)
        }
    }

    fn markdown_type(&self, row: &Row) -> Value {
        if let Some(t) = optional(row, &self.markdown_type_column) {
            return Value::String(t.to_string());
        }
        self.markdown_types
            .choose(&mut rand::thread_rng())
            .map(|t| Value::String(t.clone()))
            .unwrap_or(Value::Null)
    }

    pub fn build_at(&self, row: &Row, now: DateTime<Utc>) -> Payload {
        let qty_markdown = row.non_blank(&self.qty_markdown_column);
        let qty_on_hand = row.non_blank(&self.qty_on_hand_column).or(qty_markdown);
        let iteration = or_default(numeric(optional(row, &self.markdown_iteration_column)), 1);
        let banner = optional(row, &self.store_banner_column).unwrap_or("");

        json!({
            "storeID": text(row.get(&self.store_id_column)),
            "storeBanner": banner,
            "requestID": self.request_id(now),
            "localTime": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "items": [{
                "barcode": text(row.first_non_blank(&self.barcode_columns)),
                "itemID": text(row.first_non_blank(&self.item_id_columns)),
                "itemGroupID": text(row.first_non_blank(&self.item_group_id_columns)),
                "itemGroupType": text(optional(row, &self.item_group_type_column)),
                "originalPrice": numeric(row.get(&self.original_price_column)),
                "currentPrice": numeric(row.get(&self.current_price_column)),
                "markdownType": self.markdown_type(row),
                "markdownIteration": iteration,
                "expiryTime": self.expiry(row, now),
                "qtyMarkdown": numeric(qty_markdown),
                "qtyOnHand": or_default(numeric(qty_on_hand), 0),
                "qtySoldToday": numeric(optional(row, &self.qty_sold_today_column)),
            }],
        })
    }
}

impl PayloadBuilder for MarkdownPayload {
    fn build(&self, row: &Row) -> Payload {
        self.build_at(row, Utc::now())
    }

    fn kind(&self) -> &str {
        "markdown"
    }
}

/// Column mapping for the date checker (prompted) endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateCheckerPayload {
    pub store_id_column: String,
    pub item_id_column: String,
    pub expiry_column: String,
    pub quantity_columns: Vec<String>,
    pub barcode_columns: Vec<String>,
}

impl Default for DateCheckerPayload {
    fn default() -> Self {
        Self {
            store_id_column: "STOREID".to_string(),
            item_id_column: "ITEMID".to_string(),
            expiry_column: "EXPIRY_DATE".to_string(),
            quantity_columns: columns(&["QUANTITY", "QTY_MARKDOWN"]),
            barcode_columns: columns(&["BarCode", "BARCODE"]),
        }
    }
}

impl DateCheckerPayload {
    pub fn build_at(&self, row: &Row, now: DateTime<Utc>) -> Payload {
        let expiry = row
            .non_blank(&self.expiry_column)
            .map(str::to_string)
            .unwrap_or_else(|| now.format("%Y-%m-%d").to_string());
        let item_id = or_default(numeric(row.non_blank(&self.item_id_column)), 0);
        let quantity = or_default(numeric(row.first_non_blank(&self.quantity_columns)), 1);

        json!({
            "itemID": item_id,
            "storeID": text(row.get(&self.store_id_column)),
            "expiryDate": expiry,
            "quantity": quantity,
            "barcode": text(row.first_non_blank(&self.barcode_columns)),
        })
    }
}

impl PayloadBuilder for DateCheckerPayload {
    fn build(&self, row: &Row) -> Payload {
        self.build_at(row, Utc::now())
    }

    fn kind(&self) -> &str {
        "date_checker"
    }
}

/// Closure-backed builder
pub struct FnPayload<F> {
    build: F,
}

impl<F> fmt::Debug for FnPayload<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnPayload")
    }
}

impl<F> PayloadBuilder for FnPayload<F>
where
    F: Fn(&Row) -> Payload + Send + Sync,
{
    fn build(&self, row: &Row) -> Payload {
        (self.build)(row)
    }

    fn kind(&self) -> &str {
        "fn"
    }
}

pub fn payload_fn<F>(build: F) -> Arc<dyn PayloadBuilder>
where
    F: Fn(&Row) -> Payload + Send + Sync + 'static,
{
    Arc::new(FnPayload { build })
}
