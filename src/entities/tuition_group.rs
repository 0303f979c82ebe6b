//! Tuition group entity - A fee definition scoped to grades, classes and months.
//!
//! List-valued columns are stored comma separated; an empty list means
//! "no restriction".

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Tuition group database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tuition_groups")]
pub struct Model {
    /// Surrogate key
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Short fee code (e.g. "HP", "BT"), unique
    #[sea_orm(unique)]
    pub code: String,
    /// Display name
    pub name: String,
    /// Amount billed per applicable month
    pub default_amount: i64,
    /// Grades the group applies to, empty for every grade
    pub grades: String,
    /// Classes the group applies to, empty for every class
    pub classes: String,
    /// Months (1-12) in which the group is charged, empty for every month
    pub apply_months: String,
    /// Only billed to boarding students
    pub boarding_only: bool,
}

impl Model {
    /// Grades as a list of trimmed, non-empty entries
    #[must_use]
    pub fn grade_list(&self) -> Vec<&str> {
        split_list(&self.grades)
    }

    /// Classes as a list of trimmed, non-empty entries
    #[must_use]
    pub fn class_list(&self) -> Vec<&str> {
        split_list(&self.classes)
    }

    /// Whether the group is charged in `month`. Unparseable entries never match.
    #[must_use]
    pub fn applies_in_month(&self, month: u32) -> bool {
        let months = split_list(&self.apply_months);
        months.is_empty()
            || months
                .iter()
                .any(|m| m.parse::<u32>().is_ok_and(|m| m == month))
    }
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// `TuitionGroup` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
