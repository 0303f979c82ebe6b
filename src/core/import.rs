//! Bulk opening-balance import from CSV.
//!
//! The file needs a student-id column and a balance column. Headers are
//! matched case-insensitively, trying `mshs`/`balance` first and
//! `ma_hoc_sinh`/`so_du` after. Each valid row replaces the student's opening
//! balance, re-chains their ledger from it and invalidates the cached
//! balance, all in one transaction. Bad rows are counted and skipped.

use crate::{
    core::{balance, ledger},
    entities::{OpeningBalance, Student, opening_balance, student},
    errors::{Error, Result},
};
use chrono::Utc;
use csv::{ReaderBuilder, StringRecord, Trim};
use sea_orm::{Set, TransactionTrait, prelude::*};
use std::{fs::File, io::Read, path::Path};
use tracing::{info, warn};

const ID_HEADERS: [&str; 2] = ["mshs", "ma_hoc_sinh"];
const BALANCE_HEADERS: [&str; 2] = ["balance", "so_du"];

/// Counts reported by an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Students that had no opening balance before
    pub created: usize,
    /// Students whose opening balance was replaced
    pub updated: usize,
    /// Rows naming an unknown student
    pub not_found: usize,
    /// Rows that could not be read or parsed
    pub errors: usize,
}

/// Parses a balance cell, dropping `,` and space thousands separators.
#[must_use]
pub fn parse_balance(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn find_column(headers: &StringRecord, candidates: &[&str]) -> Option<usize> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(candidate))
    })
}

fn locate_columns(headers: &StringRecord) -> Result<(usize, usize)> {
    let id = find_column(headers, &ID_HEADERS);
    let balance = find_column(headers, &BALANCE_HEADERS);
    match (id, balance) {
        (Some(id), Some(balance)) => Ok((id, balance)),
        _ => Err(Error::Import {
            message: format!(
                "expected a student id column ({}) and a balance column ({})",
                ID_HEADERS.join("/"),
                BALANCE_HEADERS.join("/")
            ),
        }),
    }
}

/// Imports opening balances from CSV data.
pub async fn import_balances<R: Read>(db: &DatabaseConnection, reader: R) -> Result<ImportSummary> {
    let mut rows = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);
    let headers = rows.headers()?.clone();
    let (id_col, balance_col) = locate_columns(&headers)?;

    let mut summary = ImportSummary::default();
    for (index, row) in rows.records().enumerate() {
        // Header is line 1
        let line = index + 2;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("Line {line}: unreadable row: {e}");
                summary.errors += 1;
                continue;
            }
        };

        let student_id = row.get(id_col).unwrap_or_default();
        if student_id.is_empty() {
            continue;
        }
        let Some(amount) = row.get(balance_col).and_then(parse_balance) else {
            warn!("Line {line}: invalid balance for {student_id}");
            summary.errors += 1;
            continue;
        };

        let exists = Student::find()
            .filter(student::Column::SchoolId.eq(student_id))
            .one(db)
            .await?
            .is_some();
        if !exists {
            warn!("Line {line}: student {student_id} not found");
            summary.not_found += 1;
            continue;
        }

        if apply_opening_balance(db, student_id, amount).await? {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
    }

    info!(
        "Balance import: {} created, {} updated, {} not found, {} errors",
        summary.created, summary.updated, summary.not_found, summary.errors
    );
    Ok(summary)
}

/// Imports opening balances from a CSV file.
pub async fn import_balances_from_path(
    db: &DatabaseConnection,
    path: impl AsRef<Path>,
) -> Result<ImportSummary> {
    let file = File::open(path.as_ref())?;
    import_balances(db, file).await
}

/// Upserts one opening balance and re-chains the student. True when created.
async fn apply_opening_balance(
    db: &DatabaseConnection,
    student_id: &str,
    amount: i64,
) -> Result<bool> {
    let txn = db.begin().await?;
    let existing = OpeningBalance::find()
        .filter(opening_balance::Column::StudentId.eq(student_id))
        .one(&txn)
        .await?;
    let created = existing.is_none();
    match existing {
        Some(model) => {
            let mut active: opening_balance::ActiveModel = model.into();
            active.amount = Set(amount);
            active.imported_at = Set(Utc::now());
            active.update(&txn).await?;
        }
        None => {
            opening_balance::ActiveModel {
                student_id: Set(student_id.to_string()),
                amount: Set(amount),
                imported_at: Set(Utc::now()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }
    }
    ledger::rechain_student(&txn, student_id).await?;
    balance::invalidate(&txn, student_id).await?;
    txn.commit().await?;
    Ok(created)
}
