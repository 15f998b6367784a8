//! Merge engine: decides new vs. update vs. skip for each record of a page.
//!
//! One store lookup covers the whole page. A record matches an entity when any of its
//! candidate keys matches, tried in the order identity key, item id, offer id, SKU.
//! Only allow-listed fields are compared and written on update. Deny-listed fields are
//! stripped from inserts and the `derived` column is never touched.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::SyncError;
use super::identity::{self, CandidateKeys, ResolvedIdentity};
use crate::config::SyncConfig;
use crate::marketplace::RawRecord;
use crate::repositories::stored_entity::{
    EntitySnapshot, EntityStore, EntityUpdate, NewEntity, WriteOp,
};

/// Which fields the engine may refresh and which it must never write.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPolicy {
    refreshable: Vec<String>,
    derived: Vec<String>,
    tolerance: f64,
}

impl FieldPolicy {
    pub fn new(refreshable: Vec<String>, derived: Vec<String>, tolerance: f64) -> Self {
        Self {
            refreshable,
            derived,
            tolerance,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.refreshable_fields.clone(),
            config.derived_fields.clone(),
            config.numeric_tolerance,
        )
    }

    pub fn is_derived(&self, field: &str) -> bool {
        self.derived.iter().any(|f| f == field)
    }

    pub fn is_refreshable(&self, field: &str) -> bool {
        !self.is_derived(field) && self.refreshable.iter().any(|f| f == field)
    }

    /// Attributes for a first-seen record: everything except deny-listed fields.
    pub fn insert_attributes(&self, fields: &Map<String, Value>) -> Value {
        Value::Object(
            fields
                .iter()
                .filter(|(name, _)| !self.is_derived(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    /// Allow-listed fields present in `incoming` whose value differs from `existing`.
    /// A field the record does not carry is not a change.
    pub fn changed_fields(&self, existing: &Value, incoming: &Map<String, Value>) -> Vec<String> {
        self.refreshable
            .iter()
            .filter(|field| !self.is_derived(field))
            .filter_map(|field| {
                let new_value = incoming.get(field.as_str())?;
                let old_value = existing.get(field.as_str());
                values_differ(old_value, new_value, self.tolerance).then(|| field.clone())
            })
            .collect()
    }
}

fn values_differ(old: Option<&Value>, new: &Value, tolerance: f64) -> bool {
    match (old, new) {
        (None, Value::Null) => false,
        (None, _) => true,
        (Some(Value::Number(a)), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() > tolerance,
            _ => a != b,
        },
        (Some(old), new) => old != new,
    }
}

/// Write plan for one page plus its record-level counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMerge {
    pub ops: Vec<WriteOp>,
    pub records: u64,
    pub skipped: u64,
    /// Records rejected before matching (malformed)
    pub errors: u64,
}

impl PageMerge {
    pub fn planned_inserts(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| matches!(op, WriteOp::Insert(_)))
            .count() as u64
    }

    pub fn planned_updates(&self) -> u64 {
        self.ops
            .iter()
            .filter(|op| matches!(op, WriteOp::Update(_)))
            .count() as u64
    }
}

/// An entity visible while merging a page: either loaded from the store or created by
/// an earlier record of the same page.
struct WorkingEntity {
    snapshot: EntitySnapshot,
    op: Option<usize>,
}

pub struct MergeEngine {
    store: Arc<dyn EntityStore>,
    policy: FieldPolicy,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn EntityStore>, policy: FieldPolicy) -> Self {
        Self { store, policy }
    }

    /// Plan the writes for one page. Only a failed store lookup is an error; malformed
    /// records are counted and skipped.
    #[instrument(skip(self, items), fields(records = items.len()))]
    pub async fn merge_page(&self, items: Vec<Value>) -> Result<PageMerge, SyncError> {
        let mut plan = PageMerge {
            records: items.len() as u64,
            ..PageMerge::default()
        };

        let mut resolved: Vec<(RawRecord, ResolvedIdentity)> = Vec::with_capacity(items.len());
        let mut keys = CandidateKeys::default();
        for item in items {
            match RawRecord::from_value(item) {
                Ok(record) => {
                    let identity = identity::resolve(&record);
                    keys.add(&record, &identity);
                    resolved.push((record, identity));
                }
                Err(e) => {
                    debug!("skipping record: {}", e);
                    plan.errors += 1;
                }
            }
        }

        let mut working: Vec<WorkingEntity> = self
            .store
            .find_by_candidate_keys(&keys)
            .await?
            .into_iter()
            .map(|snapshot| WorkingEntity { snapshot, op: None })
            .collect();

        for (record, identity) in resolved {
            match find_match(&working, &record, &identity) {
                None => {
                    let new = NewEntity {
                        id: Uuid::new_v4(),
                        identity_key: identity.key.clone(),
                        item_id: record.item_id.clone(),
                        offer_id: record.offer_id.clone(),
                        sku: record.sku.clone(),
                        key_reliable: identity.reliable,
                        attributes: self.policy.insert_attributes(&record.fields),
                    };
                    working.push(WorkingEntity {
                        snapshot: EntitySnapshot {
                            id: new.id,
                            identity_key: new.identity_key.clone(),
                            item_id: new.item_id.clone(),
                            offer_id: new.offer_id.clone(),
                            sku: new.sku.clone(),
                            attributes: new.attributes.clone(),
                        },
                        op: Some(plan.ops.len()),
                    });
                    plan.ops.push(WriteOp::Insert(new));
                }
                Some(index) => {
                    let entry = &mut working[index];
                    let changed = self
                        .policy
                        .changed_fields(&entry.snapshot.attributes, &record.fields);

                    if changed.is_empty() {
                        plan.skipped += 1;
                        continue;
                    }

                    let changes: Map<String, Value> = changed
                        .iter()
                        .filter_map(|f| record.fields.get(f).map(|v| (f.clone(), v.clone())))
                        .collect();

                    match &mut entry.snapshot.attributes {
                        Value::Object(attributes) => {
                            attributes.extend(changes.clone());
                        }
                        other => *other = Value::Object(changes.clone()),
                    }

                    let filled = fill_missing_keys(&mut entry.snapshot, &record);

                    match entry.op {
                        // Same entity seen earlier in this page: fold into its pending write
                        Some(op_index) => {
                            match &mut plan.ops[op_index] {
                                WriteOp::Insert(new) => {
                                    new.attributes = entry.snapshot.attributes.clone();
                                    new.item_id = entry.snapshot.item_id.clone();
                                    new.offer_id = entry.snapshot.offer_id.clone();
                                    new.sku = entry.snapshot.sku.clone();
                                }
                                WriteOp::Update(update) => {
                                    update.changes.extend(changes);
                                    update.item_id = update.item_id.take().or(filled.item_id);
                                    update.offer_id = update.offer_id.take().or(filled.offer_id);
                                    update.sku = update.sku.take().or(filled.sku);
                                }
                            }
                            plan.skipped += 1;
                        }
                        None => {
                            entry.op = Some(plan.ops.len());
                            plan.ops.push(WriteOp::Update(EntityUpdate {
                                id: entry.snapshot.id,
                                changes,
                                item_id: filled.item_id,
                                offer_id: filled.offer_id,
                                sku: filled.sku,
                            }));
                        }
                    }
                }
            }
        }

        debug!(
            inserts = plan.planned_inserts(),
            updates = plan.planned_updates(),
            skipped = plan.skipped,
            errors = plan.errors,
            "page merged"
        );
        Ok(plan)
    }
}

fn find_match(
    working: &[WorkingEntity],
    record: &RawRecord,
    identity: &ResolvedIdentity,
) -> Option<usize> {
    position_by(working, |s| Some(s.identity_key.as_str()), Some(identity.key.as_str()))
        .or_else(|| position_by(working, |s| s.item_id.as_deref(), record.item_id.as_deref()))
        .or_else(|| position_by(working, |s| s.offer_id.as_deref(), record.offer_id.as_deref()))
        .or_else(|| position_by(working, |s| s.sku.as_deref(), record.sku.as_deref()))
}

fn position_by(
    working: &[WorkingEntity],
    pick: fn(&EntitySnapshot) -> Option<&str>,
    value: Option<&str>,
) -> Option<usize> {
    let value = value?;
    working
        .iter()
        .position(|entity| pick(&entity.snapshot) == Some(value))
}

#[derive(Default)]
struct FilledKeys {
    item_id: Option<String>,
    offer_id: Option<String>,
    sku: Option<String>,
}

/// Copy keys the entity lacks from the record; returns what was filled.
fn fill_missing_keys(snapshot: &mut EntitySnapshot, record: &RawRecord) -> FilledKeys {
    let mut filled = FilledKeys::default();
    if snapshot.item_id.is_none() && record.item_id.is_some() {
        snapshot.item_id = record.item_id.clone();
        filled.item_id = record.item_id.clone();
    }
    if snapshot.offer_id.is_none() && record.offer_id.is_some() {
        snapshot.offer_id = record.offer_id.clone();
        filled.offer_id = record.offer_id.clone();
    }
    if snapshot.sku.is_none() && record.sku.is_some() {
        snapshot.sku = record.sku.clone();
        filled.sku = record.sku.clone();
    }
    filled
}
