//! Tuition group resolution - which fees apply to a student in a given month.
//!
//! The resolver is loaded once per batch and answers from memory. A group
//! applies when the student's current grade and class fall inside the group's
//! lists, the month is one of its charging months, and boarding-only groups are
//! matched to boarding students. A grade listed in the configured overrides
//! ignores grade and class matching and takes exactly the listed codes.

use crate::{
    config::settings::TuitionGroupConfig,
    core::period::Period,
    entities::{TuitionGroup, student, tuition_group},
    errors::Result,
};
use sea_orm::{QueryOrder, Set, prelude::*};
use std::collections::HashMap;
use tracing::{debug, info};

/// In-memory view of every tuition group plus the grade overrides.
#[derive(Debug, Clone, Default)]
pub struct TuitionGroupResolver {
    groups: Vec<tuition_group::Model>,
    grade_overrides: HashMap<String, Vec<String>>,
}

impl TuitionGroupResolver {
    /// Builds a resolver from already loaded groups.
    #[must_use]
    pub fn new(
        groups: Vec<tuition_group::Model>,
        grade_overrides: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            groups,
            grade_overrides,
        }
    }

    /// Loads all groups, ordered by code.
    pub async fn load<C>(db: &C, grade_overrides: HashMap<String, Vec<String>>) -> Result<Self>
    where
        C: ConnectionTrait,
    {
        let groups = TuitionGroup::find()
            .order_by_asc(tuition_group::Column::Code)
            .all(db)
            .await?;
        debug!("Loaded {} tuition groups", groups.len());
        Ok(Self::new(groups, grade_overrides))
    }

    /// Every known group
    #[must_use]
    pub fn groups(&self) -> &[tuition_group::Model] {
        &self.groups
    }

    /// The groups billed to `student` in `period`. Empty when nothing applies.
    #[must_use]
    pub fn resolve(
        &self,
        student: &student::Model,
        period: Period,
    ) -> Vec<&tuition_group::Model> {
        let grade = student.grade.trim();
        let overridden = self.grade_overrides.get(grade);

        self.groups
            .iter()
            .filter(|group| {
                let candidate = overridden.map_or_else(
                    || matches_grade(group, grade) && matches_class(group, student),
                    |codes| codes.iter().any(|code| code == &group.code),
                );
                candidate
                    && group.applies_in_month(period.month())
                    && (!group.boarding_only || student.boarding)
            })
            .collect()
    }
}

fn matches_grade(group: &tuition_group::Model, grade: &str) -> bool {
    let grades = group.grade_list();
    grades.is_empty() || grades.contains(&grade)
}

fn matches_class(group: &tuition_group::Model, student: &student::Model) -> bool {
    let classes = group.class_list();
    classes.is_empty() || classes.contains(&student.class_name.trim())
}

/// Inserts configured groups whose code is not in the database yet.
///
/// Existing groups are left untouched, so the seed can run on every start.
/// Returns the number of groups inserted.
pub async fn seed_tuition_groups(
    db: &DatabaseConnection,
    configs: &[TuitionGroupConfig],
) -> Result<usize> {
    let mut inserted = 0;
    for config in configs {
        let exists = TuitionGroup::find()
            .filter(tuition_group::Column::Code.eq(config.code.trim()))
            .one(db)
            .await?
            .is_some();
        if exists {
            debug!("Tuition group {} already present", config.code);
            continue;
        }

        let months: Vec<String> = config.apply_months.iter().map(u32::to_string).collect();
        tuition_group::ActiveModel {
            code: Set(config.code.trim().to_string()),
            name: Set(config.name.clone()),
            default_amount: Set(config.default_amount),
            grades: Set(config.grades.join(",")),
            classes: Set(config.classes.join(",")),
            apply_months: Set(months.join(",")),
            boarding_only: Set(config.boarding_only),
            ..Default::default()
        }
        .insert(db)
        .await?;
        inserted += 1;
    }
    info!("Seeded {inserted} tuition groups");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;

    fn group(code: &str, grades: &str, classes: &str, months: &str) -> tuition_group::Model {
        tuition_group::Model {
            id: 0,
            code: code.to_string(),
            name: code.to_string(),
            default_amount: 100,
            grades: grades.to_string(),
            classes: classes.to_string(),
            apply_months: months.to_string(),
            boarding_only: false,
        }
    }

    fn codes(groups: &[&tuition_group::Model]) -> Vec<String> {
        groups.iter().map(|g| g.code.clone()).collect()
    }

    fn march() -> Period {
        Period::new(2025, 3).unwrap()
    }

    #[test]
    fn test_grade_and_month_filters() {
        let resolver = TuitionGroupResolver::new(
            vec![
                group("HP5", "5", "", ""),
                group("HP6", "6", "", ""),
                group("BT", "", "", "1,2,3"),
                group("EXAM", "5", "", "6"),
            ],
            HashMap::new(),
        );
        let s = student_model("HS001", "5", "5A");

        assert_eq!(codes(&resolver.resolve(&s, march())), vec!["HP5", "BT"]);
    }

    #[test]
    fn test_class_list_restricts() {
        let resolver = TuitionGroupResolver::new(
            vec![group("LAB", "5", "5B, 5C", "")],
            HashMap::new(),
        );
        assert!(resolver.resolve(&student_model("HS001", "5", "5A"), march()).is_empty());
        assert_eq!(
            codes(&resolver.resolve(&student_model("HS002", "5", "5C"), march())),
            vec!["LAB"]
        );
    }

    #[test]
    fn test_boarding_only_groups() {
        let mut boarding = group("NT", "", "", "");
        boarding.boarding_only = true;
        let resolver = TuitionGroupResolver::new(vec![boarding], HashMap::new());

        let mut s = student_model("HS001", "5", "5A");
        assert!(resolver.resolve(&s, march()).is_empty());
        s.boarding = true;
        assert_eq!(codes(&resolver.resolve(&s, march())), vec!["NT"]);
    }

    #[test]
    fn test_retained_student_keeps_current_grade_groups_only() {
        let resolver = TuitionGroupResolver::new(
            vec![group("HP5", "5", "", ""), group("HP6", "6", "", "")],
            HashMap::new(),
        );
        let mut s = student_model("HS001", "5", "5A");
        s.is_retained = true;
        assert_eq!(codes(&resolver.resolve(&s, march())), vec!["HP5"]);
    }

    #[test]
    fn test_override_is_authoritative() {
        let mut overrides = HashMap::new();
        overrides.insert("12".to_string(), vec!["EXAM".to_string(), "BT".to_string()]);
        let resolver = TuitionGroupResolver::new(
            vec![
                group("HP12", "12", "", ""),
                group("EXAM", "9", "", ""),
                group("BT", "", "", "9"),
            ],
            overrides,
        );
        let s = student_model("HS001", "12", "12A");

        // EXAM is listed for grade 9 but the override wins; BT still honours its months
        assert_eq!(codes(&resolver.resolve(&s, march())), vec!["EXAM"]);
        assert_eq!(
            codes(&resolver.resolve(&s, Period::new(2025, 9).unwrap())),
            vec!["EXAM", "BT"]
        );
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let resolver = TuitionGroupResolver::default();
        assert!(resolver.resolve(&student_model("HS001", "1", "1A"), march()).is_empty());
    }

    #[tokio::test]
    async fn test_seed_is_idempotent_and_loadable() -> Result<()> {
        let db = setup_test_db().await?;
        let configs = vec![TuitionGroupConfig {
            code: "BT".to_string(),
            name: "Meals".to_string(),
            default_amount: 150,
            grades: vec![],
            classes: vec![],
            apply_months: vec![9, 10],
            boarding_only: false,
        }];

        assert_eq!(seed_tuition_groups(&db, &configs).await?, 1);
        assert_eq!(seed_tuition_groups(&db, &configs).await?, 0);

        let resolver = TuitionGroupResolver::load(&db, HashMap::new()).await?;
        assert_eq!(resolver.groups().len(), 1);
        assert!(resolver.groups()[0].applies_in_month(10));
        assert!(!resolver.groups()[0].applies_in_month(11));
        Ok(())
    }
}
