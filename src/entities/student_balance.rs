//! Student balance entity - Cached snapshot of a student's current position.
//!
//! Never a source of truth: rows are rebuilt from the ledger whenever
//! `is_stale` is set.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Student balance database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "student_balances")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// School ID of the student
    #[sea_orm(unique)]
    pub student_id: String,
    /// Total outstanding
    pub balance: i64,
    /// JSON map fee code -> outstanding amount
    pub detail: String,
    /// Set by every ledger write, cleared by a refresh
    pub is_stale: bool,
    /// When the snapshot was last rebuilt
    pub updated_at: DateTimeUtc,
}

/// `StudentBalance` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
