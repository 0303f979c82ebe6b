//! Monthly ledger trigger
//!
//! An external scheduler calls the trigger at least once a day. The trigger
//! converts the instant to the school's local date and, when the run policy
//! allows it, generates the ledger for the month containing that date. The
//! date of the last run is kept in the `system_state` table so a second call
//! in the same month does nothing.

use crate::{
    core::{ledger::LedgerGenerator, period::Period},
    entities::{SystemState, system_state},
    errors::{Error, Result},
};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use sea_orm::{Set, prelude::*};
use tracing::info;

const LAST_LEDGER_RUN_KEY: &str = "last_ledger_run";

/// Decides on which local dates the trigger may generate.
pub trait RunPolicy: Send + Sync {
    /// Whether a run is allowed on `today`
    fn should_run(&self, today: NaiveDate) -> bool;

    /// Short description for log and outcome messages
    fn describe(&self) -> &'static str;
}

/// Runs on the first day of each month only.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstDayOfMonth;

impl RunPolicy for FirstDayOfMonth {
    fn should_run(&self, today: NaiveDate) -> bool {
        today.day() == 1
    }

    fn describe(&self) -> &'static str {
        "first day of the month"
    }
}

/// What a trigger invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Whether a ledger run happened
    pub ran: bool,
    /// Month generated, if any
    pub period: Option<Period>,
    /// Records created
    pub created: usize,
    /// Records updated
    pub updated: usize,
    /// Students skipped on bad data
    pub skipped: usize,
    /// Human-readable explanation
    pub message: String,
}

impl TriggerOutcome {
    fn idle(message: String) -> Self {
        Self {
            ran: false,
            period: None,
            created: 0,
            updated: 0,
            skipped: 0,
            message,
        }
    }
}

/// The school-local calendar date of `now`.
#[must_use]
pub fn local_date(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

/// Checks if a run is needed for the month of `today`. True when no run was
/// recorded yet or the last one was in an earlier month.
pub async fn is_run_needed(db: &DatabaseConnection, today: NaiveDate) -> Result<bool> {
    let last_run = get_last_run_date(db).await?;
    Ok(last_run.is_none_or(|last| Period::containing(last) != Period::containing(today)))
}

/// Retrieves the date of the last ledger run from the `system_state` table.
pub async fn get_last_run_date(db: &DatabaseConnection) -> Result<Option<NaiveDate>> {
    let state = SystemState::find()
        .filter(system_state::Column::Key.eq(LAST_LEDGER_RUN_KEY))
        .one(db)
        .await?;

    match state {
        // Stored as YYYY-MM-DD
        Some(s) => NaiveDate::parse_from_str(&s.value, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| Error::Config {
                message: format!("Failed to parse last ledger run date: {e}"),
            }),
        None => Ok(None),
    }
}

async fn set_last_run_date<C>(db: &C, date: NaiveDate) -> Result<()>
where
    C: ConnectionTrait,
{
    let date_str = date.format("%Y-%m-%d").to_string();
    let now = Utc::now().naive_utc();

    let existing = SystemState::find()
        .filter(system_state::Column::Key.eq(LAST_LEDGER_RUN_KEY))
        .one(db)
        .await?;

    if let Some(state) = existing {
        let mut active_model: system_state::ActiveModel = state.into();
        active_model.value = Set(date_str);
        active_model.updated_at = Set(now);
        active_model.update(db).await?;
    } else {
        system_state::ActiveModel {
            key: Set(LAST_LEDGER_RUN_KEY.to_string()),
            value: Set(date_str),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }

    Ok(())
}

/// Runs the ledger for the current local month when `policy` allows it.
///
/// Returns an idle outcome when the policy says no or the month was already
/// generated. Fatal generation errors are returned as `Err` and the run date
/// is not recorded, so the next invocation retries.
pub async fn run_monthly_trigger(
    db: &DatabaseConnection,
    generator: &LedgerGenerator,
    policy: &dyn RunPolicy,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> Result<TriggerOutcome> {
    let today = local_date(now, offset);
    if !policy.should_run(today) {
        return Ok(TriggerOutcome::idle(format!(
            "{today} is not a run date ({})",
            policy.describe()
        )));
    }
    if !is_run_needed(db, today).await? {
        return Ok(TriggerOutcome::idle(format!(
            "Ledger for {} already generated",
            Period::containing(today)
        )));
    }

    let period = Period::containing(today);
    info!("Monthly trigger generating ledger for {period}");
    let summary = generator.generate(db, period).await?;
    set_last_run_date(db, today).await?;

    Ok(TriggerOutcome {
        ran: true,
        period: Some(period),
        created: summary.created,
        updated: summary.updated,
        skipped: summary.skipped,
        message: format!(
            "Ledger for {period} generated: {} created, {} updated, {} skipped",
            summary.created, summary.updated, summary.skipped
        ),
    })
}

/// Formats a trigger outcome into a human-readable summary string.
#[must_use]
pub fn format_trigger_outcome(outcome: &TriggerOutcome) -> String {
    match outcome.period {
        Some(period) if outcome.ran => format!(
            "Monthly Trigger - {}\n  {}",
            period.first_day().map_or_else(
                |_| period.to_string(),
                |day| day.format("%B %Y").to_string()
            ),
            outcome.message
        ),
        _ => format!("Monthly Trigger - idle\n  {}", outcome.message),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{core::ledger::find_record, test_utils::*};
    use chrono::TimeZone;

    fn bangkok() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    async fn setup() -> Result<(DatabaseConnection, LedgerGenerator)> {
        let db = setup_test_db().await?;
        seed_group(&db, "HP", 400, "", "").await?;
        seed_student(&db, "HS001", "5", "5A").await?;
        let generator = test_generator(&db).await?;
        Ok((db, generator))
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        // 18:30 UTC on the last day of February is already March 1 at +7
        let now = Utc.with_ymd_and_hms(2025, 2, 28, 18, 30, 0).unwrap();
        assert_eq!(
            local_date(now, bangkok()),
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
        );
        assert!(FirstDayOfMonth.should_run(local_date(now, bangkok())));
    }

    #[tokio::test]
    async fn test_get_last_run_date_none() -> Result<()> {
        let db = setup_test_db().await?;
        assert!(get_last_run_date(&db).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_set_last_run_date_updates_existing() -> Result<()> {
        let db = setup_test_db().await?;
        let first = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        set_last_run_date(&db, first).await?;
        set_last_run_date(&db, second).await?;

        assert_eq!(get_last_run_date(&db).await?, Some(second));
        let count = SystemState::find()
            .filter(system_state::Column::Key.eq(LAST_LEDGER_RUN_KEY))
            .count(&db)
            .await?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_not_first_day_is_noop() -> Result<()> {
        let (db, generator) = setup().await?;
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 3, 0, 0).unwrap();

        let outcome =
            run_monthly_trigger(&db, &generator, &FirstDayOfMonth, bangkok(), now).await?;
        assert!(!outcome.ran);
        assert!(outcome.message.contains("not a run date"));
        assert!(get_last_run_date(&db).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_first_day_runs_once() -> Result<()> {
        let (db, generator) = setup().await?;
        let now = Utc.with_ymd_and_hms(2025, 2, 28, 20, 0, 0).unwrap();

        let outcome =
            run_monthly_trigger(&db, &generator, &FirstDayOfMonth, bangkok(), now).await?;
        assert!(outcome.ran);
        assert_eq!(outcome.period, Some(Period::new(2025, 3)?));
        assert_eq!(outcome.created, 1);
        assert!(
            find_record(&db, "HS001", Period::new(2025, 3)?)
                .await?
                .is_some()
        );

        let again = run_monthly_trigger(&db, &generator, &FirstDayOfMonth, bangkok(), now).await?;
        assert!(!again.ran);
        assert!(again.message.contains("already generated"));
        Ok(())
    }

    #[test]
    fn test_format_trigger_outcome() {
        let outcome = TriggerOutcome {
            ran: true,
            period: Some(Period::new(2024, 3).unwrap()),
            created: 3,
            updated: 0,
            skipped: 1,
            message: "Ledger for 2024-03 generated: 3 created, 0 updated, 1 skipped".to_string(),
        };
        let summary = format_trigger_outcome(&outcome);
        assert!(summary.contains("March 2024"));
        assert!(summary.contains("1 skipped"));

        let idle = format_trigger_outcome(&TriggerOutcome::idle("nothing".to_string()));
        assert!(idle.contains("idle"));
    }
}
