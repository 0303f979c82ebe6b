//! Invoice counter entity - One row per calendar month holding the next ordinal.
//!
//! Only `core::invoice` reads or writes this table.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Invoice counter database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invoice_counters")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Counter year
    pub year: i32,
    /// Counter month
    pub month: i32,
    /// Ordinal the next issuance will receive
    pub next_ordinal: i64,
    /// When the counter last moved
    pub updated_at: DateTimeUtc,
}

/// `InvoiceCounter` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
