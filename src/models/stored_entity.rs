//! StoredEntity entity model
//!
//! A synchronized marketplace record. `attributes` holds refreshable and passthrough
//! fields sourced from the marketplace; `derived` is owned by the analytics process
//! and is never selected, compared or written by the sync engine.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "stored_entities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Storage collection, resolved once from configuration
    pub collection: String,

    /// Canonical identity key, e.g. `item:12345`
    pub identity_key: String,

    pub item_id: Option<String>,
    pub offer_id: Option<String>,
    pub sku: Option<String>,

    /// False when the identity key is a content fingerprint
    pub key_reliable: bool,

    #[sea_orm(column_type = "JsonBinary")]
    pub attributes: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub derived: Option<JsonValue>,

    pub first_fetched_at: DateTimeWithTimeZone,
    pub fetched_at: DateTimeWithTimeZone,
    pub last_updated_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
