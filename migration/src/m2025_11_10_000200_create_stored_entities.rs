//! Migration to create the stored_entities table.
//!
//! Stored entities are the synchronized marketplace records. Refreshable fields live
//! in `attributes`; `derived` belongs to the analytics process and is never written
//! by the sync engine.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StoredEntities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StoredEntities::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StoredEntities::Collection).text().not_null())
                    .col(ColumnDef::new(StoredEntities::IdentityKey).text().not_null())
                    .col(ColumnDef::new(StoredEntities::ItemId).text().null())
                    .col(ColumnDef::new(StoredEntities::OfferId).text().null())
                    .col(ColumnDef::new(StoredEntities::Sku).text().null())
                    .col(
                        ColumnDef::new(StoredEntities::KeyReliable)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(StoredEntities::Attributes)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(StoredEntities::Derived).json_binary().null())
                    .col(
                        ColumnDef::new(StoredEntities::FirstFetchedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(StoredEntities::FetchedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(StoredEntities::LastUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One entity per identity key inside a collection
        manager
            .create_index(
                Index::create()
                    .name("idx_stored_entities_collection_identity")
                    .table(StoredEntities::Table)
                    .col(StoredEntities::Collection)
                    .col(StoredEntities::IdentityKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Candidate key lookups used by the merge engine
        for (name, column) in [
            ("idx_stored_entities_collection_item_id", StoredEntities::ItemId),
            ("idx_stored_entities_collection_offer_id", StoredEntities::OfferId),
            ("idx_stored_entities_collection_sku", StoredEntities::Sku),
        ] {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(StoredEntities::Table)
                        .col(StoredEntities::Collection)
                        .col(column)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StoredEntities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum StoredEntities {
    Table,
    Id,
    Collection,
    IdentityKey,
    ItemId,
    OfferId,
    Sku,
    KeyReliable,
    Attributes,
    Derived,
    FirstFetchedAt,
    FetchedAt,
    LastUpdatedAt,
}
