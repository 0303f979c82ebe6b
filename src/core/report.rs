//! Read-side reporting.
//!
//! This module provides a student's ledger history and the yearly
//! outstanding-debt rollup. Functions return structured data; the command
//! line formats it with the helpers at the bottom.

use crate::{
    core::{ledger::invariant, period::Period},
    entities::{LedgerRecord, Student, ledger_record, student},
    errors::{Error, Result},
};
use sea_orm::{QueryOrder, prelude::*};
use std::collections::{BTreeMap, HashMap};

/// One month of the yearly rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthRollup {
    /// The month
    pub period: Period,
    /// Students with a record that month
    pub students: usize,
    /// Σ amount collected
    pub revenue: i64,
    /// Σ amount due
    pub outstanding_debt: i64,
    /// Σ closing debt
    pub debt: i64,
}

/// Totals for a school year of ledger records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingDebt {
    /// Calendar year summarised
    pub year: i32,
    /// Total collected during the year
    pub revenue: i64,
    /// Total billed during the year
    pub outstanding_debt: i64,
    /// Sum over students of their latest closing debt in the year
    pub debt: i64,
    /// Per-month breakdown, in calendar order
    pub months: Vec<MonthRollup>,
}

/// A student's ledger records in chronological order.
pub async fn ledger_history(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<Vec<ledger_record::Model>> {
    let exists = Student::find()
        .filter(student::Column::SchoolId.eq(student_id))
        .one(db)
        .await?
        .is_some();
    if !exists {
        return Err(Error::StudentNotFound {
            student_id: student_id.to_string(),
        });
    }

    Ok(LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(student_id))
        .order_by_asc(ledger_record::Column::Year)
        .order_by_asc(ledger_record::Column::Month)
        .all(db)
        .await?)
}

/// Rolls up every ledger record of `year`.
pub async fn yearly_rollup(db: &DatabaseConnection, year: i32) -> Result<OutstandingDebt> {
    let records = LedgerRecord::find()
        .filter(ledger_record::Column::Year.eq(year))
        .order_by_asc(ledger_record::Column::Month)
        .all(db)
        .await?;

    let mut months: BTreeMap<i32, MonthRollup> = BTreeMap::new();
    let mut revenue: i64 = 0;
    let mut outstanding_debt: i64 = 0;
    // Records are in month order, so the last write per student wins
    let mut latest_closing: HashMap<&str, (Period, i64)> = HashMap::new();
    for record in &records {
        let period = Period::from_columns(record.year, record.month)?;
        let overflow = || invariant(&record.student_id, period, "yearly rollup overflows");
        let month = months.entry(record.month).or_insert(MonthRollup {
            period,
            students: 0,
            revenue: 0,
            outstanding_debt: 0,
            debt: 0,
        });
        month.students += 1;
        month.revenue = month
            .revenue
            .checked_add(record.amount_collected)
            .ok_or_else(overflow)?;
        month.outstanding_debt = month
            .outstanding_debt
            .checked_add(record.amount_due)
            .ok_or_else(overflow)?;
        month.debt = month
            .debt
            .checked_add(record.closing_debt)
            .ok_or_else(overflow)?;
        revenue = revenue
            .checked_add(record.amount_collected)
            .ok_or_else(overflow)?;
        outstanding_debt = outstanding_debt
            .checked_add(record.amount_due)
            .ok_or_else(overflow)?;
        latest_closing.insert(record.student_id.as_str(), (period, record.closing_debt));
    }

    let mut debt: i64 = 0;
    for (student_id, (period, closing)) in latest_closing {
        debt = debt
            .checked_add(closing)
            .ok_or_else(|| invariant(student_id, period, "yearly rollup overflows"))?;
    }

    Ok(OutstandingDebt {
        year,
        revenue,
        outstanding_debt,
        debt,
        months: months.into_values().collect(),
    })
}

/// Formats an amount with `,` thousands separators.
#[must_use]
pub fn format_amount(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// One line per month: period, dudau, phaithu, dathu, duno.
#[must_use]
pub fn format_history(records: &[ledger_record::Model]) -> String {
    if records.is_empty() {
        return "No ledger records".to_string();
    }
    let mut lines = vec![format!(
        "{:<8} {:>14} {:>14} {:>14} {:>14}",
        "Month", "Opening", "Due", "Collected", "Closing"
    )];
    for r in records {
        lines.push(format!(
            "{:04}-{:02}  {:>14} {:>14} {:>14} {:>14}",
            r.year,
            r.month,
            format_amount(r.opening_debt),
            format_amount(r.amount_due),
            format_amount(r.amount_collected),
            format_amount(r.closing_debt)
        ));
    }
    lines.join("\n")
}

/// Yearly totals followed by the monthly breakdown.
#[must_use]
pub fn format_yearly_rollup(rollup: &OutstandingDebt) -> String {
    let mut lines = vec![format!(
        "{} - revenue {}, billed {}, debt {}",
        rollup.year,
        format_amount(rollup.revenue),
        format_amount(rollup.outstanding_debt),
        format_amount(rollup.debt)
    )];
    lines.extend(rollup.months.iter().map(|m| {
        format!(
            "  {} ({} students): collected {}, billed {}, closing {}",
            m.period,
            m.students,
            format_amount(m.revenue),
            format_amount(m.outstanding_debt),
            format_amount(m.debt)
        )
    }));
    lines.join("\n")
}
