//! Invoice entity - Links a transaction to its invoice number and title.
//!
//! Invoice numbers have the form `<ordinal>/<MM>`, where the ordinal counts
//! invoices issued in that calendar month starting at 1.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Invoice database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invoices")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Month-scoped invoice number, unique together with `year`
    pub invoice_no: String,
    /// Transaction this invoice was issued for
    pub transaction_id: i64,
    /// School ID of the paying student
    pub student_id: String,
    /// Free-text title entered at collection time
    pub detail: String,
    /// Amount on the invoice
    pub total_amount: i64,
    /// Issuance year
    pub year: i32,
    /// Issuance month
    pub month: i32,
    /// When the invoice was issued
    pub created_at: DateTimeUtc,
}

/// Defines relationships between Invoice and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each invoice belongs to one transaction
    #[sea_orm(
        belongs_to = "super::transaction::Entity",
        from = "Column::TransactionId",
        to = "super::transaction::Column::Id"
    )]
    Transaction,
}

impl Related<super::transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transaction.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
