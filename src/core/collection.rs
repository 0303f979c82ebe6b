//! Recording collections.
//!
//! A collection is one payment: a transaction row plus the invoice issued for
//! it. The invoice number belongs to the month the invoice is issued in; the
//! transaction is counted in its own `(year, month)` bucket, which may be an
//! earlier month. When that month already has a ledger record, it is
//! regenerated and the change cascades forward.

use crate::{
    core::{
        balance::{self, BalanceSnapshot},
        invoice::InvoiceSequencer,
        ledger::{self, LedgerGenerator, StudentRun},
        period::Period,
    },
    entities::{Student, Transaction, invoice, student, transaction},
    errors::{Error, Result},
};
use chrono::{NaiveDate, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{info, instrument, warn};

/// A payment to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCollection {
    /// School ID of the paying student
    pub student_id: String,
    /// Fee code paid
    pub fee_code: String,
    /// Amount received, must be positive
    pub amount: i64,
    /// Date the money was received
    pub payment_date: NaiveDate,
    /// Date the invoice is issued; picks the invoice number's month
    pub issued_on: NaiveDate,
    /// Ledger month to count the payment in, defaults to the payment month
    pub bucket: Option<Period>,
    /// Counts toward the collected amount whatever the fee code
    pub is_other: bool,
    /// Invoice title
    pub title: String,
    /// Optional note on the transaction
    pub note: Option<String>,
}

/// What recording a collection produced.
#[derive(Debug, Clone)]
pub struct CollectionReceipt {
    /// The stored transaction
    pub transaction: transaction::Model,
    /// The invoice issued for it
    pub invoice: invoice::Model,
    /// The ledger month that was regenerated, if one existed
    pub regenerated: Option<StudentRun>,
    /// Why the existing ledger month could not be regenerated. The payment
    /// is stored regardless and counts once the month is repaired.
    pub regeneration_error: Option<String>,
    /// Balance after the payment
    pub balance: BalanceSnapshot,
}

/// Records a payment and issues its invoice.
#[instrument(skip(db, sequencer, generator, new), fields(student = %new.student_id))]
pub async fn record_collection(
    db: &DatabaseConnection,
    sequencer: &InvoiceSequencer,
    generator: &LedgerGenerator,
    new: NewCollection,
) -> Result<CollectionReceipt> {
    if new.amount <= 0 {
        return Err(Error::InvalidAmount { amount: new.amount });
    }
    let student = Student::find()
        .filter(student::Column::SchoolId.eq(new.student_id.as_str()))
        .one(db)
        .await?
        .ok_or_else(|| Error::StudentNotFound {
            student_id: new.student_id.clone(),
        })?;

    let bucket = new
        .bucket
        .unwrap_or_else(|| Period::containing(new.payment_date));
    let issued = Period::containing(new.issued_on);
    let now = Utc::now();

    // Held until commit so a rolled back collection returns its ordinal
    let held = sequencer.hold(issued).await?;
    let txn = db.begin().await?;
    let invoice_no = sequencer.next_invoice_number_in(&held, &txn, issued).await?;
    let transaction = transaction::ActiveModel {
        student_id: Set(student.school_id.clone()),
        fee_code: Set(new.fee_code.trim().to_string()),
        amount: Set(new.amount),
        payment_date: Set(new.payment_date),
        note: Set(new.note),
        invoice_no: Set(invoice_no.clone()),
        year: Set(bucket.year()),
        month: Set(bucket.month_i32()),
        is_other: Set(new.is_other),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let invoice = invoice::ActiveModel {
        invoice_no: Set(invoice_no),
        transaction_id: Set(transaction.id),
        student_id: Set(student.school_id.clone()),
        detail: Set(new.title),
        total_amount: Set(new.amount),
        year: Set(issued.year()),
        month: Set(issued.month_i32()),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let mut regeneration_error = None;
    let regenerated = if ledger::find_record(&txn, &student.school_id, bucket)
        .await?
        .is_some()
    {
        match generator.generate_student_in(&txn, &student, bucket).await {
            Ok(run) => Some(run),
            Err(err) if err.is_record_level() => {
                warn!("Collection stored but {bucket} not regenerated: {err}");
                regeneration_error = Some(err.to_string());
                None
            }
            Err(err) => return Err(err),
        }
    } else {
        None
    };
    balance::invalidate(&txn, &student.school_id).await?;
    txn.commit().await?;
    drop(held);

    let balance = balance::refresh(db, &student.school_id).await?;
    info!(
        "Collected {} from {} under invoice {} (bucket {bucket})",
        transaction.amount, transaction.student_id, invoice.invoice_no
    );
    Ok(CollectionReceipt {
        transaction,
        invoice,
        regenerated,
        regeneration_error,
        balance,
    })
}

/// Replaces the note of a stored transaction. Nothing else may change.
pub async fn annotate_transaction(
    db: &DatabaseConnection,
    transaction_id: i64,
    note: Option<String>,
) -> Result<transaction::Model> {
    let existing = Transaction::find_by_id(transaction_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("transaction {transaction_id}")))?;
    let mut active: transaction::ActiveModel = existing.into();
    active.note = Set(note);
    Ok(active.update(db).await?)
}

/// All transactions of a student, oldest first.
pub async fn transactions_for_student(
    db: &DatabaseConnection,
    student_id: &str,
) -> Result<Vec<transaction::Model>> {
    Ok(Transaction::find()
        .filter(transaction::Column::StudentId.eq(student_id))
        .order_by_asc(transaction::Column::Id)
        .all(db)
        .await?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{
        core::{
            invoice::audit,
            ledger::{UpsertOutcome, find_record},
        },
        entities::{Invoice, ledger_record},
        test_utils::*,
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn payment(amount: i64, paid: NaiveDate, issued: NaiveDate) -> NewCollection {
        NewCollection {
            student_id: "HS001".to_string(),
            fee_code: "HP".to_string(),
            amount,
            payment_date: paid,
            issued_on: issued,
            bucket: None,
            is_other: false,
            title: "Tuition".to_string(),
            note: None,
        }
    }

    async fn setup() -> Result<(DatabaseConnection, InvoiceSequencer, LedgerGenerator)> {
        let db = setup_test_db().await?;
        seed_group(&db, "HP", 400, "", "").await?;
        seed_student(&db, "HS001", "5", "5A").await?;
        let generator = test_generator(&db).await?;
        Ok((db, test_sequencer(), generator))
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let err = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(0, date(2025, 3, 5), date(2025, 3, 5)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount { amount: 0 }));
        assert!(Invoice::find().all(&db).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_student() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let mut new = payment(100, date(2025, 3, 5), date(2025, 3, 5));
        new.student_id = "GHOST".to_string();
        let err = record_collection(&db, &sequencer, &generator, new)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StudentNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_invoice_numbers_follow_issuance_month() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let first = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(100, date(2025, 3, 5), date(2025, 3, 5)),
        )
        .await?;
        // Paid for February, issued in March
        let mut late = payment(50, date(2025, 2, 27), date(2025, 3, 6));
        late.bucket = Some(Period::new(2025, 2)?);
        let second = record_collection(&db, &sequencer, &generator, late).await?;

        assert_eq!(first.invoice.invoice_no, "1/03");
        assert_eq!(second.invoice.invoice_no, "2/03");
        assert_eq!(second.transaction.month, 2);
        assert_eq!(second.invoice.transaction_id, second.transaction.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_retroactive_collection_regenerates_and_cascades() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let feb = Period::new(2025, 2)?;
        generator.generate(&db, feb).await?;
        generator.generate(&db, feb.next()).await?;

        let receipt = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(300, date(2025, 2, 20), date(2025, 3, 2)),
        )
        .await?;

        match receipt.regenerated {
            Some(StudentRun::Written {
                outcome, cascaded, ..
            }) => {
                assert_eq!(outcome, UpsertOutcome::Updated);
                assert_eq!(cascaded, 1);
            }
            other => panic!("expected a regenerated month, got {other:?}"),
        }
        let march = find_record(&db, "HS001", feb.next()).await?.unwrap();
        assert_eq!((march.opening_debt, march.closing_debt), (100, 500));
        assert_eq!(receipt.balance.total, 500);
        Ok(())
    }

    #[tokio::test]
    async fn test_collection_without_ledger_month_only_updates_balance() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let receipt = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(100, date(2025, 3, 5), date(2025, 3, 5)),
        )
        .await?;
        assert!(receipt.regenerated.is_none());
        assert!(receipt.regeneration_error.is_none());
        assert!(
            find_record(&db, "HS001", Period::new(2025, 3)?)
                .await?
                .is_none()
        );
        // Counted once the month is generated
        generator.generate(&db, Period::new(2025, 3)?).await?;
        let r = find_record(&db, "HS001", Period::new(2025, 3)?)
            .await?
            .unwrap();
        assert_eq!(r.amount_collected, 100);
        Ok(())
    }

    async fn update_student(
        db: &DatabaseConnection,
        change: impl FnOnce(&mut student::ActiveModel),
    ) -> Result<()> {
        let model = Student::find()
            .filter(student::Column::SchoolId.eq("HS001"))
            .one(db)
            .await?
            .unwrap();
        let mut active: student::ActiveModel = model.into();
        change(&mut active);
        active.update(db).await?;
        Ok(())
    }

    async fn set_closing_debt(db: &DatabaseConnection, period: Period, closing: i64) -> Result<()> {
        let record = find_record(db, "HS001", period).await?.unwrap();
        let mut active: ledger_record::ActiveModel = record.into();
        active.closing_debt = Set(closing);
        active.update(db).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_collection_leaves_no_invoice_gap() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let feb = Period::new(2025, 2)?;
        let march = feb.next();
        generator.generate(&db, feb).await?;
        generator.generate(&db, march).await?;

        // An unbalanced March stops the cascade after the number is taken
        set_closing_debt(&db, march, 801).await?;
        let err = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(300, date(2025, 2, 20), date(2025, 3, 2)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));
        assert!(transactions_for_student(&db, "HS001").await?.is_empty());

        let report = audit(&db, march).await?;
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.issued, 0);

        set_closing_debt(&db, march, 800).await?;
        let receipt = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(300, date(2025, 2, 20), date(2025, 3, 2)),
        )
        .await?;
        assert_eq!(receipt.invoice.invoice_no, "1/03");
        assert!(audit(&db, march).await?.is_clean());
        Ok(())
    }

    #[tokio::test]
    async fn test_withdrawn_student_settles_billed_month() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let feb = Period::new(2025, 2)?;
        generator.generate(&db, feb).await?;
        generator.generate(&db, feb.next()).await?;
        update_student(&db, |s| {
            s.is_withdrawn = Set(true);
            s.withdrawn_on = Set(NaiveDate::from_ymd_opt(2025, 1, 31));
        })
        .await?;

        let receipt = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(400, date(2025, 2, 20), date(2025, 3, 2)),
        )
        .await?;

        match receipt.regenerated {
            Some(StudentRun::Written {
                outcome,
                record,
                cascaded,
            }) => {
                assert_eq!(outcome, UpsertOutcome::Updated);
                assert_eq!(record.amount_due, 400);
                assert_eq!(record.amount_collected, 400);
                assert_eq!(record.closing_debt, 0);
                assert_eq!(cascaded, 1);
            }
            other => panic!("expected the billed month to be recounted, got {other:?}"),
        }
        let march = find_record(&db, "HS001", feb.next()).await?.unwrap();
        assert_eq!((march.opening_debt, march.closing_debt), (0, 400));
        assert_eq!(receipt.balance.total, 400);
        Ok(())
    }

    #[tokio::test]
    async fn test_skipped_regeneration_is_reported() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let march = Period::new(2025, 3)?;
        generator.generate(&db, march).await?;
        update_student(&db, |s| s.discount = Set(-5)).await?;

        let receipt = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(100, date(2025, 3, 5), date(2025, 3, 5)),
        )
        .await?;

        assert!(receipt.regenerated.is_none());
        let reason = receipt.regeneration_error.unwrap();
        assert!(reason.contains("negative discount"), "{reason}");
        assert_eq!(transactions_for_student(&db, "HS001").await?.len(), 1);
        assert_eq!(
            find_record(&db, "HS001", march).await?.unwrap().amount_collected,
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_annotate_changes_only_note() -> Result<()> {
        let (db, sequencer, generator) = setup().await?;
        let receipt = record_collection(
            &db,
            &sequencer,
            &generator,
            payment(100, date(2025, 3, 5), date(2025, 3, 5)),
        )
        .await?;
        let annotated =
            annotate_transaction(&db, receipt.transaction.id, Some("cash".to_string())).await?;
        assert_eq!(annotated.note.as_deref(), Some("cash"));
        assert_eq!(annotated.amount, receipt.transaction.amount);
        assert_eq!(annotated.invoice_no, receipt.transaction.invoice_no);

        let all = transactions_for_student(&db, "HS001").await?;
        assert_eq!(all.len(), 1);
        assert!(annotate_transaction(&db, 999, None).await.is_err());
        Ok(())
    }
}
