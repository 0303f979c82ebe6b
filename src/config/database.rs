//! Database configuration module for the tuition ledger.
//!
//! This module handles `SQLite` database connection and table creation using `SeaORM`.
//! Tables are generated from the entity definitions with `Schema::create_table_from_entity`,
//! so the schema always matches the Rust structs. Composite keys the entity macros cannot
//! express (one ledger record per student and month, one counter per month, one invoice
//! number per month) are added as unique indexes.

use crate::entities::{
    Invoice, InvoiceCounter, LedgerRecord, OpeningBalance, Student, StudentBalance, SystemState,
    Transaction, TuitionGroup, invoice, invoice_counter, ledger_record, transaction,
};
use crate::errors::Result;
use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema,
    sea_query::{Index, IndexCreateStatement},
};
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/tuition_ledger.sqlite?mode=rwc";

/// Gets the database URL from environment variable or returns default `SQLite` path.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection to the database named by `DATABASE_URL`.
///
/// Falls back to a default local `SQLite` file if no environment variable is set.
pub async fn create_connection() -> Result<DatabaseConnection> {
    let database_url = get_database_url();
    info!("Connecting to database at {database_url}");

    // SQLite creates the file but not its directory
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        let file = path.split('?').next().unwrap_or_default();
        if let Some(parent) = std::path::Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Database::connect(&database_url).await.map_err(Into::into)
}

/// Creates all tables and unique indexes if they do not exist yet.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    create_table(db, &schema, Student).await?;
    create_table(db, &schema, TuitionGroup).await?;
    create_table(db, &schema, Transaction).await?;
    create_table(db, &schema, Invoice).await?;
    create_table(db, &schema, InvoiceCounter).await?;
    create_table(db, &schema, LedgerRecord).await?;
    create_table(db, &schema, StudentBalance).await?;
    create_table(db, &schema, OpeningBalance).await?;
    create_table(db, &schema, SystemState).await?;

    let indexes: [IndexCreateStatement; 4] = [
        Index::create()
            .name("idx_ledger_student_period")
            .table(LedgerRecord)
            .col(ledger_record::Column::StudentId)
            .col(ledger_record::Column::Year)
            .col(ledger_record::Column::Month)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_invoice_counter_period")
            .table(InvoiceCounter)
            .col(invoice_counter::Column::Year)
            .col(invoice_counter::Column::Month)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_invoice_number_year")
            .table(Invoice)
            .col(invoice::Column::Year)
            .col(invoice::Column::InvoiceNo)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_transaction_student_period")
            .table(Transaction)
            .col(transaction::Column::StudentId)
            .col(transaction::Column::Year)
            .col(transaction::Column::Month)
            .if_not_exists()
            .to_owned(),
    ];
    for index in &indexes {
        db.execute(builder.build(index)).await?;
    }

    Ok(())
}

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let builder = db.get_database_backend();
    let mut table = schema.create_table_from_entity(entity);
    table.if_not_exists();
    db.execute(builder.build(&table)).await?;
    Ok(())
}
