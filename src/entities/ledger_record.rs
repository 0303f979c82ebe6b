//! Ledger record entity - One student's tuition position for one month.
//!
//! This is the authoritative ledger. Each record links to its predecessor
//! month so the chain of opening and closing debts is explicit.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Ledger record database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_records")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// School ID of the student
    pub student_id: String,
    /// Ledger year
    pub year: i32,
    /// Ledger month (1-12)
    pub month: i32,
    /// Comma separated fee codes billed this month
    pub fee_codes: String,
    /// Opening debt (dudau): the predecessor's closing debt
    pub opening_debt: i64,
    /// Amount due this month (phaithu)
    pub amount_due: i64,
    /// Amount collected this month (dathu)
    pub amount_collected: i64,
    /// Closing debt (duno) = opening + due - collected
    pub closing_debt: i64,
    /// JSON map fee code -> amount due; sums to `amount_due`
    pub due_detail: String,
    /// JSON map fee code -> amount collected; sums to `amount_collected`
    pub collected_detail: String,
    /// Most recent transaction counted in `amount_collected`
    pub last_transaction_id: Option<i64>,
    /// Record of the preceding month, `None` for the first month of history
    pub previous_record_id: Option<i64>,
    /// When the record was last computed
    pub updated_at: DateTimeUtc,
}

/// `LedgerRecord` chains to itself through `previous_record_id`
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
