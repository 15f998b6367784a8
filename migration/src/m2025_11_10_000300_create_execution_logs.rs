//! Migration to create the execution_logs table.
//!
//! One row per invocation of the sync engine, independent from the sync_jobs table so
//! that observability survives a corrupted or deleted job record.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExecutionLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExecutionLogs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExecutionLogs::JobRef).text().null())
                    .col(ColumnDef::new(ExecutionLogs::AccountId).text().null())
                    .col(ColumnDef::new(ExecutionLogs::TriggerType).text().not_null())
                    .col(ColumnDef::new(ExecutionLogs::TriggerSource).text().not_null())
                    .col(
                        ColumnDef::new(ExecutionLogs::Status)
                            .text()
                            .not_null()
                            .default("running"),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::StartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::EndTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ExecutionLogs::DurationMs).big_integer().null())
                    .col(
                        ColumnDef::new(ExecutionLogs::ItemsProcessed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::TotalReads)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::TotalWrites)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::Message)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(ExecutionLogs::ErrorDetails).json_binary().null())
                    .col(ColumnDef::new(ExecutionLogs::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(ExecutionLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_execution_logs_account_start")
                    .table(ExecutionLogs::Table)
                    .col(ExecutionLogs::AccountId)
                    .col(ExecutionLogs::StartTime)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_execution_logs_status_start")
                    .table(ExecutionLogs::Table)
                    .col(ExecutionLogs::Status)
                    .col(ExecutionLogs::StartTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExecutionLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExecutionLogs {
    Table,
    Id,
    JobRef,
    AccountId,
    TriggerType,
    TriggerSource,
    Status,
    StartTime,
    EndTime,
    DurationMs,
    ItemsProcessed,
    TotalReads,
    TotalWrites,
    Message,
    ErrorDetails,
    Metadata,
    CreatedAt,
    UpdatedAt,
}
