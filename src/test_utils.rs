//! Shared test utilities for the ledger engine.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults.

use crate::{
    config::settings::{SequencerSettings, WithdrawnPolicy},
    core::{
        invoice::InvoiceSequencer, ledger::LedgerGenerator, period::Period,
        tuition_group::TuitionGroupResolver,
    },
    entities::{
        OpeningBalance, invoice, opening_balance, student, transaction, tuition_group,
    },
    errors::Result,
};
use chrono::Utc;
use sea_orm::{Set, prelude::*};
use std::collections::HashMap;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Routes log output through the test harness. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// An active, non-boarding student with no discount or extra fee.
#[must_use]
pub fn student_model(school_id: &str, grade: &str, class_name: &str) -> student::Model {
    student::Model {
        id: 0,
        school_id: school_id.to_string(),
        full_name: format!("Student {school_id}"),
        grade: grade.to_string(),
        class_name: class_name.to_string(),
        is_active: true,
        is_withdrawn: false,
        withdrawn_on: None,
        is_retained: false,
        boarding: false,
        discount: 0,
        extra_fee: 0,
    }
}

/// Inserts `model`, letting the database assign the id.
pub async fn insert_student(
    db: &DatabaseConnection,
    model: student::Model,
) -> Result<student::Model> {
    Ok(student::ActiveModel {
        school_id: Set(model.school_id),
        full_name: Set(model.full_name),
        grade: Set(model.grade),
        class_name: Set(model.class_name),
        is_active: Set(model.is_active),
        is_withdrawn: Set(model.is_withdrawn),
        withdrawn_on: Set(model.withdrawn_on),
        is_retained: Set(model.is_retained),
        boarding: Set(model.boarding),
        discount: Set(model.discount),
        extra_fee: Set(model.extra_fee),
        ..Default::default()
    }
    .insert(db)
    .await?)
}

/// Inserts a default student.
pub async fn seed_student(
    db: &DatabaseConnection,
    school_id: &str,
    grade: &str,
    class_name: &str,
) -> Result<student::Model> {
    insert_student(db, student_model(school_id, grade, class_name)).await
}

/// An unrestricted group charged every month.
#[must_use]
pub fn group_model(code: &str, amount: i64) -> tuition_group::Model {
    tuition_group::Model {
        id: 0,
        code: code.to_string(),
        name: code.to_string(),
        default_amount: amount,
        grades: String::new(),
        classes: String::new(),
        apply_months: String::new(),
        boarding_only: false,
    }
}

/// Inserts a group charged every month for the given comma-separated grades
/// and classes.
pub async fn seed_group(
    db: &DatabaseConnection,
    code: &str,
    amount: i64,
    grades: &str,
    classes: &str,
) -> Result<tuition_group::Model> {
    Ok(tuition_group::ActiveModel {
        code: Set(code.to_string()),
        name: Set(code.to_string()),
        default_amount: Set(amount),
        grades: Set(grades.to_string()),
        classes: Set(classes.to_string()),
        apply_months: Set(String::new()),
        boarding_only: Set(false),
        ..Default::default()
    }
    .insert(db)
    .await?)
}

/// An unsaved transaction in March 2025.
#[must_use]
pub fn transaction_model(
    id: i64,
    student_id: &str,
    fee_code: &str,
    amount: i64,
    is_other: bool,
) -> transaction::Model {
    transaction::Model {
        id,
        student_id: student_id.to_string(),
        fee_code: fee_code.to_string(),
        amount,
        payment_date: chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap_or_default(),
        note: None,
        invoice_no: format!("{id}/03"),
        year: 2025,
        month: 3,
        is_other,
        created_at: Utc::now(),
    }
}

/// Inserts a transaction counted in `period`, bypassing the sequencer.
pub async fn insert_transaction(
    db: &DatabaseConnection,
    student_id: &str,
    fee_code: &str,
    amount: i64,
    period: Period,
    is_other: bool,
) -> Result<transaction::Model> {
    Ok(transaction::ActiveModel {
        student_id: Set(student_id.to_string()),
        fee_code: Set(fee_code.to_string()),
        amount: Set(amount),
        payment_date: Set(period.first_day()?),
        note: Set(None),
        invoice_no: Set(String::new()),
        year: Set(period.year()),
        month: Set(period.month_i32()),
        is_other: Set(is_other),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?)
}

/// Inserts an invoice numbered `invoice_no` in `period` together with the
/// transaction it references.
pub async fn insert_raw_invoice(
    db: &DatabaseConnection,
    student_id: &str,
    invoice_no: &str,
    period: Period,
) -> Result<invoice::Model> {
    let tx = insert_transaction(db, student_id, "HP", 100, period, false).await?;
    Ok(invoice::ActiveModel {
        invoice_no: Set(invoice_no.to_string()),
        transaction_id: Set(tx.id),
        student_id: Set(student_id.to_string()),
        detail: Set("Tuition".to_string()),
        total_amount: Set(tx.amount),
        year: Set(period.year()),
        month: Set(period.month_i32()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?)
}

/// Creates or replaces a student's opening balance.
pub async fn set_opening_balance(
    db: &DatabaseConnection,
    student_id: &str,
    amount: i64,
) -> Result<()> {
    let existing = OpeningBalance::find()
        .filter(opening_balance::Column::StudentId.eq(student_id))
        .one(db)
        .await?;
    let mut active: opening_balance::ActiveModel = existing.map_or_else(
        || opening_balance::ActiveModel {
            student_id: Set(student_id.to_string()),
            ..Default::default()
        },
        Into::into,
    );
    active.amount = Set(amount);
    active.imported_at = Set(Utc::now());
    active.save(db).await?;
    Ok(())
}

/// Sequencer with default settings.
#[must_use]
pub fn test_sequencer() -> InvoiceSequencer {
    InvoiceSequencer::new(SequencerSettings::default())
}

/// Generator over the groups currently in `db`, no overrides, withdrawn
/// students excluded.
pub async fn test_generator(db: &DatabaseConnection) -> Result<LedgerGenerator> {
    let resolver = TuitionGroupResolver::load(db, HashMap::new()).await?;
    Ok(LedgerGenerator::new(resolver, WithdrawnPolicy::Exclude, 4))
}
