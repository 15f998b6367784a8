//! Identity resolution.
//!
//! Candidate keys are tried in a fixed order: item id, then offer id, then SKU. The
//! first one present becomes the canonical identity key, prefixed with its kind so keys
//! from different namespaces never collide. Records without any candidate key get a
//! SHA-256 fingerprint of their canonical JSON, which is stable across runs and
//! processes but flagged unreliable since any field change produces a new key.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::marketplace::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    ItemId,
    OfferId,
    Sku,
    Fingerprint,
}

impl KeyKind {
    pub const PRIORITY: [KeyKind; 3] = [KeyKind::ItemId, KeyKind::OfferId, KeyKind::Sku];

    pub fn prefix(&self) -> &'static str {
        match self {
            KeyKind::ItemId => "item",
            KeyKind::OfferId => "offer",
            KeyKind::Sku => "sku",
            KeyKind::Fingerprint => "fp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub key: String,
    pub kind: KeyKind,
    /// False for fingerprint keys
    pub reliable: bool,
}

/// Every key a record could be stored under, for cross-run drift matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateKeys {
    pub identity_keys: Vec<String>,
    pub item_ids: Vec<String>,
    pub offer_ids: Vec<String>,
    pub skus: Vec<String>,
}

impl CandidateKeys {
    pub fn is_empty(&self) -> bool {
        self.identity_keys.is_empty()
            && self.item_ids.is_empty()
            && self.offer_ids.is_empty()
            && self.skus.is_empty()
    }

    pub fn add(&mut self, record: &RawRecord, identity: &ResolvedIdentity) {
        push_unique(&mut self.identity_keys, &identity.key);
        if let Some(id) = &record.item_id {
            push_unique(&mut self.item_ids, id);
        }
        if let Some(id) = &record.offer_id {
            push_unique(&mut self.offer_ids, id);
        }
        if let Some(sku) = &record.sku {
            push_unique(&mut self.skus, sku);
        }
    }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|v| v == value) {
        values.push(value.to_string());
    }
}

pub fn resolve(record: &RawRecord) -> ResolvedIdentity {
    for kind in KeyKind::PRIORITY {
        let value = match kind {
            KeyKind::ItemId => record.item_id.as_deref(),
            KeyKind::OfferId => record.offer_id.as_deref(),
            KeyKind::Sku => record.sku.as_deref(),
            KeyKind::Fingerprint => None,
        };
        if let Some(value) = value {
            return ResolvedIdentity {
                key: format!("{}:{}", kind.prefix(), value),
                kind,
                reliable: true,
            };
        }
    }

    ResolvedIdentity {
        key: format!("{}:{}", KeyKind::Fingerprint.prefix(), fingerprint(&record.fields)),
        kind: KeyKind::Fingerprint,
        reliable: false,
    }
}

/// Hex SHA-256 over the record with object keys sorted recursively.
pub fn fingerprint(fields: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(fields.clone()), &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
