//! Current-balance cache.
//!
//! The ledger is the source of truth. A student's balance is the closing debt
//! of their latest ledger month (or the imported opening balance before any
//! month exists), broken down per fee code by replaying each month's due and
//! collected detail. Snapshots are stored in `student_balances` and rebuilt
//! lazily once a ledger write marks them stale.

use crate::{
    core::{
        ledger::{invariant, opening_balance_of},
        period::Period,
    },
    entities::{LedgerRecord, Student, StudentBalance, ledger_record, student, student_balance},
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::Expr};
use std::collections::BTreeMap;
use tracing::debug;

/// Detail key for the carried-in opening balance
pub const OPENING_KEY: &str = "opening";

/// A student's current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    /// School ID of the student
    pub student_id: String,
    /// Total outstanding
    pub total: i64,
    /// Fee code -> outstanding amount, zero entries omitted
    pub detail: BTreeMap<String, i64>,
    /// When the snapshot was built
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    fn from_model(model: &student_balance::Model) -> Result<Self> {
        Ok(Self {
            student_id: model.student_id.clone(),
            total: model.balance,
            detail: serde_json::from_str(&model.detail)?,
            updated_at: model.updated_at,
        })
    }
}

/// Marks the cached snapshot stale. A student without a snapshot needs nothing.
pub async fn invalidate<C>(conn: &C, student_id: &str) -> Result<()>
where
    C: ConnectionTrait,
{
    StudentBalance::update_many()
        .col_expr(student_balance::Column::IsStale, Expr::value(true))
        .filter(student_balance::Column::StudentId.eq(student_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Derives the balance from the ledger without touching the cache.
pub async fn compute<C>(conn: &C, student_id: &str) -> Result<BalanceSnapshot>
where
    C: ConnectionTrait,
{
    let exists = Student::find()
        .filter(student::Column::SchoolId.eq(student_id))
        .one(conn)
        .await?
        .is_some();
    if !exists {
        return Err(Error::StudentNotFound {
            student_id: student_id.to_string(),
        });
    }

    let records = LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(student_id))
        .order_by_asc(ledger_record::Column::Year)
        .order_by_asc(ledger_record::Column::Month)
        .all(conn)
        .await?;

    let mut detail: BTreeMap<String, i64> = BTreeMap::new();
    let total = match (records.first(), records.last()) {
        (Some(first), Some(last)) => {
            detail.insert(OPENING_KEY.to_string(), first.opening_debt);
            for record in &records {
                let period = Period::from_columns(record.year, record.month)?;
                let overflow = || invariant(student_id, period, "balance detail overflows");
                let due: BTreeMap<String, i64> = serde_json::from_str(&record.due_detail)?;
                let collected: BTreeMap<String, i64> =
                    serde_json::from_str(&record.collected_detail)?;
                for (code, amount) in due {
                    let line = detail.entry(code).or_default();
                    *line = line.checked_add(amount).ok_or_else(overflow)?;
                }
                for (code, amount) in collected {
                    let line = detail.entry(code).or_default();
                    *line = line.checked_sub(amount).ok_or_else(overflow)?;
                }
            }
            let last_period = Period::from_columns(last.year, last.month)?;
            let sum = detail
                .values()
                .try_fold(0_i64, |acc, v| acc.checked_add(*v))
                .ok_or_else(|| invariant(student_id, last_period, "balance detail overflows"))?;
            if sum != last.closing_debt {
                return Err(invariant(
                    student_id,
                    last_period,
                    &format!(
                        "balance detail sums to {sum}, closing debt is {}",
                        last.closing_debt
                    ),
                ));
            }
            last.closing_debt
        }
        _ => {
            let opening = opening_balance_of(conn, student_id).await?;
            detail.insert(OPENING_KEY.to_string(), opening);
            opening
        }
    };
    detail.retain(|_, amount| *amount != 0);

    Ok(BalanceSnapshot {
        student_id: student_id.to_string(),
        total,
        detail,
        updated_at: Utc::now(),
    })
}

/// Recomputes the snapshot and stores it as fresh.
pub async fn refresh<C>(conn: &C, student_id: &str) -> Result<BalanceSnapshot>
where
    C: ConnectionTrait,
{
    let snapshot = compute(conn, student_id).await?;
    let detail = serde_json::to_string(&snapshot.detail)?;

    let existing = StudentBalance::find()
        .filter(student_balance::Column::StudentId.eq(student_id))
        .one(conn)
        .await?;
    match existing {
        Some(model) => {
            let mut active: student_balance::ActiveModel = model.into();
            active.balance = Set(snapshot.total);
            active.detail = Set(detail);
            active.is_stale = Set(false);
            active.updated_at = Set(snapshot.updated_at);
            active.update(conn).await?;
        }
        None => {
            student_balance::ActiveModel {
                student_id: Set(student_id.to_string()),
                balance: Set(snapshot.total),
                detail: Set(detail),
                is_stale: Set(false),
                updated_at: Set(snapshot.updated_at),
                ..Default::default()
            }
            .insert(conn)
            .await?;
        }
    }
    debug!("Refreshed balance of {student_id}: {}", snapshot.total);
    Ok(snapshot)
}

/// Cached balance, rebuilt first when missing or stale.
pub async fn get_balance<C>(conn: &C, student_id: &str) -> Result<BalanceSnapshot>
where
    C: ConnectionTrait,
{
    let cached = StudentBalance::find()
        .filter(student_balance::Column::StudentId.eq(student_id))
        .one(conn)
        .await?;
    match cached {
        Some(model) if !model.is_stale => BalanceSnapshot::from_model(&model),
        _ => refresh(conn, student_id).await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{core::period::Period, test_utils::*};

    #[tokio::test]
    async fn test_unknown_student() -> Result<()> {
        let db = setup_test_db().await?;
        let err = get_balance(&db, "NOPE").await.unwrap_err();
        assert!(matches!(err, Error::StudentNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_history_uses_opening_balance() -> Result<()> {
        let db = setup_test_db().await?;
        seed_student(&db, "HS001", "5", "5A").await?;
        assert_eq!(get_balance(&db, "HS001").await?.total, 0);

        set_opening_balance(&db, "HS001", 700).await?;
        invalidate(&db, "HS001").await?;
        let snapshot = get_balance(&db, "HS001").await?;
        assert_eq!(snapshot.total, 700);
        assert_eq!(snapshot.detail.get(OPENING_KEY), Some(&700));
        Ok(())
    }

    #[tokio::test]
    async fn test_detail_sums_to_total() -> Result<()> {
        let db = setup_test_db().await?;
        seed_group(&db, "HP", 400, "", "").await?;
        seed_group(&db, "BT", 100, "", "").await?;
        let mut s = student_model("HS001", "5", "5A");
        s.discount = 50;
        s.extra_fee = 20;
        insert_student(&db, s).await?;
        set_opening_balance(&db, "HS001", 300).await?;

        let generator = test_generator(&db).await?;
        let march = Period::new(2025, 3)?;
        insert_transaction(&db, "HS001", "HP", 400, march, false).await?;
        generator.generate(&db, march).await?;
        generator.generate(&db, march.next()).await?;

        let snapshot = get_balance(&db, "HS001").await?;
        // 300 + (500 - 50 + 20) * 2 - 400
        assert_eq!(snapshot.total, 840);
        assert_eq!(snapshot.detail.values().sum::<i64>(), snapshot.total);
        assert_eq!(snapshot.detail["HP"], 400);
        assert_eq!(snapshot.detail["BT"], 200);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rebuilt() -> Result<()> {
        let db = setup_test_db().await?;
        seed_group(&db, "HP", 400, "", "").await?;
        seed_student(&db, "HS001", "5", "5A").await?;
        let generator = test_generator(&db).await?;
        let march = Period::new(2025, 3)?;

        generator.generate(&db, march).await?;
        assert_eq!(get_balance(&db, "HS001").await?.total, 400);

        insert_transaction(&db, "HS001", "HP", 150, march, false).await?;
        generator.generate(&db, march).await?;
        let cached = StudentBalance::find().one(&db).await?.unwrap();
        assert!(cached.is_stale);

        assert_eq!(get_balance(&db, "HS001").await?.total, 250);
        let cached = StudentBalance::find().one(&db).await?.unwrap();
        assert!(!cached.is_stale);
        Ok(())
    }

    #[tokio::test]
    async fn test_fresh_cache_is_served() -> Result<()> {
        let db = setup_test_db().await?;
        seed_student(&db, "HS001", "5", "5A").await?;
        refresh(&db, "HS001").await?;

        // A fresh row is trusted as stored
        StudentBalance::update_many()
            .col_expr(student_balance::Column::Balance, Expr::value(99_i64))
            .exec(&db)
            .await?;
        assert_eq!(get_balance(&db, "HS001").await?.total, 99);
        assert_eq!(compute(&db, "HS001").await?.total, 0);
        Ok(())
    }
}
