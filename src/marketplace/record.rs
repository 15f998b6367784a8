//! Typed view over loosely-structured marketplace records and page envelopes.
//!
//! Providers name the same identifier differently (`item_id`, `itemId`, `productId`...).
//! [`RawRecord`] lifts the known identity fields into typed slots and keeps every other
//! field in a passthrough map so unknown provider fields survive untouched.

use serde_json::{Map, Value};

use crate::sync::SyncError;

const ITEM_ID_ALIASES: &[&str] = &["item_id", "itemId", "productId", "product_id"];
const OFFER_ID_ALIASES: &[&str] = &["offer_id", "offerId", "listingId", "listing_id"];
const SKU_ALIASES: &[&str] = &["sku", "SKU", "sellerSku", "seller_sku"];

/// List fields tried, in order, when the configured items field is absent.
const FALLBACK_ITEM_FIELDS: &[&str] = &["items", "data", "results", "products", "records"];

const TOTAL_COUNT_KEYS: &[&str] = &[
    "total_count",
    "totalCount",
    "total",
    "total_records",
    "totalRecords",
];
const PAGE_SIZE_KEYS: &[&str] = &["page_size", "pageSize", "per_page", "perPage"];

#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub item_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,
    /// Everything except the identity fields, as delivered
    pub fields: Map<String, Value>,
}

impl RawRecord {
    /// Build a record from one element of a page's item array.
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        let Value::Object(mut fields) = value else {
            return Err(SyncError::data_shape(format!(
                "record is not a JSON object: {}",
                json_kind(&value)
            )));
        };

        let item_id = take_identifier(&mut fields, ITEM_ID_ALIASES);
        let offer_id = take_identifier(&mut fields, OFFER_ID_ALIASES);
        let sku = take_identifier(&mut fields, SKU_ALIASES);

        Ok(Self {
            item_id,
            offer_id,
            sku,
            fields,
        })
    }
}

/// Removes every alias of an identifier and returns the first non-empty value found.
fn take_identifier(fields: &mut Map<String, Value>, aliases: &[&str]) -> Option<String> {
    let mut found = None;
    for alias in aliases {
        if let Some(value) = fields.remove(*alias)
            && found.is_none()
        {
            found = normalize_identifier(&value);
        }
    }
    found
}

fn normalize_identifier(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One decoded page of the marketplace API.
#[derive(Debug, Clone, Default)]
pub struct MarketplacePage {
    /// Raw items; decoding into [`RawRecord`] is per record so one bad item does not
    /// fail the page
    pub items: Vec<Value>,
    pub total_count: Option<u64>,
    pub page_size: Option<u64>,
}

impl MarketplacePage {
    /// Parse a response body, locating the item array by `items_field` first and then by
    /// the common alternative shapes.
    pub fn parse(body: Value, items_field: &str) -> Result<Self, SyncError> {
        let (total_count, page_size) = pagination_meta(&body);
        let items = extract_items(body, items_field)?;
        Ok(Self {
            items,
            total_count,
            page_size,
        })
    }
}

fn extract_items(body: Value, items_field: &str) -> Result<Vec<Value>, SyncError> {
    let mut object = match body {
        Value::Array(items) => return Ok(items),
        Value::Object(object) => object,
        other => {
            return Err(SyncError::data_shape(format!(
                "page body is a {}, expected an object or array",
                json_kind(&other)
            )));
        }
    };

    let candidates = std::iter::once(items_field).chain(
        FALLBACK_ITEM_FIELDS
            .iter()
            .copied()
            .filter(|field| *field != items_field),
    );

    for field in candidates {
        match object.remove(field) {
            Some(Value::Array(items)) => return Ok(items),
            // `{"data": {"items": [...]}}`
            Some(Value::Object(mut nested)) => {
                if let Some(Value::Array(items)) = nested.remove(items_field) {
                    return Ok(items);
                }
                if let Some(Value::Array(items)) = nested.remove("items") {
                    return Ok(items);
                }
            }
            _ => {}
        }
    }

    Err(SyncError::data_shape(format!(
        "no item array found under '{items_field}' or known alternatives"
    )))
}

fn pagination_meta(body: &Value) -> (Option<u64>, Option<u64>) {
    let scopes = [
        body.get("pagination"),
        body.get("meta"),
        body.get("data").filter(|d| d.is_object()),
        Some(body),
    ];

    let find = |keys: &[&str]| {
        scopes.iter().flatten().find_map(|scope| {
            keys.iter()
                .find_map(|key| scope.get(*key).and_then(as_count))
        })
    };

    (find(TOTAL_COUNT_KEYS), find(PAGE_SIZE_KEYS))
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
