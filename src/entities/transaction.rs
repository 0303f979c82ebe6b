//! Transaction entity - An immutable collection event.
//!
//! Each row records one payment by a student against a fee code, the invoice
//! number it was issued under, and the `(year, month)` bucket it is counted in.
//! Only `note` may change after insertion.
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Transaction database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    /// Unique identifier for the transaction
    #[sea_orm(primary_key)]
    pub id: i64,
    /// School ID of the paying student
    pub student_id: String,
    /// Fee code the payment is for
    pub fee_code: String,
    /// Amount paid, always positive
    pub amount: i64,
    /// Date the money was received
    pub payment_date: Date,
    /// Free-text note, the only mutable field
    pub note: Option<String>,
    /// Invoice number assigned at collection time (e.g. `"12/03"`)
    pub invoice_no: String,
    /// Ledger year the payment is counted in
    pub year: i32,
    /// Ledger month the payment is counted in
    pub month: i32,
    /// Counts toward the collected amount whatever the fee code
    pub is_other: bool,
    /// When the transaction was recorded
    pub created_at: DateTimeUtc,
}

/// Defines relationships between Transaction and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One transaction has one invoice
    #[sea_orm(has_many = "super::invoice::Entity")]
    Invoices,
}

impl Related<super::invoice::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Invoices.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
