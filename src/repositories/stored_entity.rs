//! # Stored Entity Repository
//!
//! The document-store collaborator behind the merge engine and batch writer. Every
//! query and write is stamped with the collection resolved from configuration at
//! startup. The `derived` column is never selected or written here.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    FromQueryResult, QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::stored_entity::{ActiveModel, Column, Entity};
use crate::sync::SyncError;
use crate::sync::identity::CandidateKeys;

/// The slice of a stored entity the merge engine is allowed to see.
#[derive(Debug, Clone, PartialEq, FromQueryResult)]
pub struct EntitySnapshot {
    pub id: Uuid,
    pub identity_key: String,
    pub item_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub id: Uuid,
    pub identity_key: String,
    pub item_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,
    pub key_reliable: bool,
    pub attributes: JsonValue,
}

/// Refresh of an existing entity. `changes` holds only the allow-listed fields whose
/// value moved; they are merged key by key into the stored attributes. Key columns are
/// only written when `Some`, so a key learned from a later record fills a gap without
/// clearing anything.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub id: Uuid,
    pub changes: Map<String, JsonValue>,
    pub item_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(NewEntity),
    Update(EntityUpdate),
}

#[derive(Debug, FromQueryResult)]
struct StoredAttributes {
    attributes: JsonValue,
}

/// Overlay `changes` onto `current`, leaving every other key as stored.
fn merge_attributes(current: JsonValue, changes: &Map<String, JsonValue>) -> JsonValue {
    let mut merged = match current {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    };
    for (field, value) in changes {
        merged.insert(field.clone(), value.clone());
    }
    JsonValue::Object(merged)
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// All entities matching any of the candidate keys, in one round trip.
    async fn find_by_candidate_keys(
        &self,
        keys: &CandidateKeys,
    ) -> Result<Vec<EntitySnapshot>, SyncError>;

    /// Commit one chunk atomically; either every op lands or none does.
    async fn commit_chunk(&self, ops: &[WriteOp]) -> Result<(), SyncError>;

    /// Hard cap on ops per `commit_chunk` call.
    fn max_batch_size(&self) -> usize;
}

pub struct SeaOrmEntityStore {
    db: DatabaseConnection,
    collection: String,
    max_batch_size: usize,
}

impl SeaOrmEntityStore {
    pub fn new(db: DatabaseConnection, collection: impl Into<String>, max_batch_size: usize) -> Self {
        Self {
            db,
            collection: collection.into(),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Number of entities stored in this collection.
    pub async fn count(&self) -> Result<u64, SyncError> {
        use sea_orm::PaginatorTrait;

        Ok(Entity::find()
            .filter(Column::Collection.eq(self.collection.as_str()))
            .count(&self.db)
            .await?)
    }
}

#[async_trait]
impl EntityStore for SeaOrmEntityStore {
    async fn find_by_candidate_keys(
        &self,
        keys: &CandidateKeys,
    ) -> Result<Vec<EntitySnapshot>, SyncError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut any_key = Condition::any();
        if !keys.identity_keys.is_empty() {
            any_key = any_key.add(Column::IdentityKey.is_in(keys.identity_keys.iter().cloned()));
        }
        if !keys.item_ids.is_empty() {
            any_key = any_key.add(Column::ItemId.is_in(keys.item_ids.iter().cloned()));
        }
        if !keys.offer_ids.is_empty() {
            any_key = any_key.add(Column::OfferId.is_in(keys.offer_ids.iter().cloned()));
        }
        if !keys.skus.is_empty() {
            any_key = any_key.add(Column::Sku.is_in(keys.skus.iter().cloned()));
        }

        let rows = Entity::find()
            .select_only()
            .columns([
                Column::Id,
                Column::IdentityKey,
                Column::ItemId,
                Column::OfferId,
                Column::Sku,
                Column::Attributes,
            ])
            .filter(Column::Collection.eq(self.collection.as_str()))
            .filter(any_key)
            .into_model::<EntitySnapshot>()
            .all(&self.db)
            .await
            .map_err(|e| {
                error!(collection = %self.collection, "candidate key lookup failed: {}", e);
                SyncError::from(e)
            })?;

        debug!(matched = rows.len(), "candidate key lookup");
        Ok(rows)
    }

    async fn commit_chunk(&self, ops: &[WriteOp]) -> Result<(), SyncError> {
        if ops.is_empty() {
            return Ok(());
        }
        if ops.len() > self.max_batch_size {
            return Err(SyncError::StorageWrite(format!(
                "chunk of {} ops exceeds store limit {}",
                ops.len(),
                self.max_batch_size
            )));
        }

        let now = Utc::now().fixed_offset();
        let write_error = |e: sea_orm::DbErr| SyncError::StorageWrite(e.to_string());

        let txn = self.db.begin().await.map_err(write_error)?;

        let inserts: Vec<ActiveModel> = ops
            .iter()
            .filter_map(|op| match op {
                WriteOp::Insert(new) => Some(ActiveModel {
                    id: Set(new.id),
                    collection: Set(self.collection.clone()),
                    identity_key: Set(new.identity_key.clone()),
                    item_id: Set(new.item_id.clone()),
                    offer_id: Set(new.offer_id.clone()),
                    sku: Set(new.sku.clone()),
                    key_reliable: Set(new.key_reliable),
                    attributes: Set(new.attributes.clone()),
                    derived: NotSet,
                    first_fetched_at: Set(now),
                    fetched_at: Set(now),
                    last_updated_at: Set(None),
                }),
                WriteOp::Update(_) => None,
            })
            .collect();

        if !inserts.is_empty() {
            Entity::insert_many(inserts)
                .exec(&txn)
                .await
                .map_err(write_error)?;
        }

        for op in ops {
            let WriteOp::Update(update) = op else {
                continue;
            };

            // Re-read under the transaction so fields written by anyone else since the
            // page lookup survive.
            let current = Entity::find()
                .select_only()
                .column(Column::Attributes)
                .filter(Column::Id.eq(update.id))
                .filter(Column::Collection.eq(self.collection.as_str()))
                .lock_exclusive()
                .into_model::<StoredAttributes>()
                .one(&txn)
                .await
                .map_err(write_error)?
                .ok_or_else(|| {
                    SyncError::StorageWrite(format!("entity {} vanished before update", update.id))
                })?;

            let mut statement = Entity::update_many()
                .col_expr(
                    Column::Attributes,
                    Expr::value(merge_attributes(current.attributes, &update.changes)),
                )
                .col_expr(Column::FetchedAt, Expr::value(now))
                .col_expr(Column::LastUpdatedAt, Expr::value(now));
            if let Some(item_id) = &update.item_id {
                statement = statement.col_expr(Column::ItemId, Expr::value(item_id.clone()));
            }
            if let Some(offer_id) = &update.offer_id {
                statement = statement.col_expr(Column::OfferId, Expr::value(offer_id.clone()));
            }
            if let Some(sku) = &update.sku {
                statement = statement.col_expr(Column::Sku, Expr::value(sku.clone()));
            }

            let result = statement
                .filter(Column::Id.eq(update.id))
                .filter(Column::Collection.eq(self.collection.as_str()))
                .exec(&txn)
                .await
                .map_err(write_error)?;

            if result.rows_affected == 0 {
                return Err(SyncError::StorageWrite(format!(
                    "entity {} vanished before update",
                    update.id
                )));
            }
        }

        txn.commit().await.map_err(write_error)?;
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
