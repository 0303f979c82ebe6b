//! Opening balance entity - Debt carried in from before the ledger began.
//!
//! Written by the bulk balance import and used as the opening debt of a
//! student's first ledger month.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Opening balance database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "opening_balances")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// School ID of the student
    #[sea_orm(unique)]
    pub student_id: String,
    /// Carried-in debt
    pub amount: i64,
    /// When the value was last imported
    pub imported_at: DateTimeUtc,
}

/// `OpeningBalance` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
