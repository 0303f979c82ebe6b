//! Student entity - The billable population supplied by the school's records.
//!
//! The engine never creates or deletes students; it reads them. `school_id`
//! is the immutable identity key every other table refers to.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Student database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "students")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// School-issued identifier, unique and immutable
    #[sea_orm(unique)]
    pub school_id: String,
    /// Display name
    pub full_name: String,
    /// Grade the student currently occupies (e.g. "5")
    pub grade: String,
    /// Class or section within the grade (e.g. "5A")
    pub class_name: String,
    /// Enrolled and billable
    pub is_active: bool,
    /// Soft withdrawal flag
    pub is_withdrawn: bool,
    /// Date the withdrawal took effect, if known
    pub withdrawn_on: Option<Date>,
    /// Failed to advance and repeats the current grade
    pub is_retained: bool,
    /// Boarding students are also billed boarding-only groups
    pub boarding: bool,
    /// Flat discount subtracted from the monthly dues
    pub discount: i64,
    /// Recurring extra fee added to the monthly dues
    pub extra_fee: i64,
}

/// `Student` is referenced by school ID rather than by foreign keys
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
