//! Invoice numbering - month-scoped, gap-free ordinals.
//!
//! Invoice numbers look like `"<ordinal>/<MM>"`. The ordinal restarts at 1 in
//! every calendar month and is drawn from one `invoice_counters` row per month.
//! Allocation is the engine's only shared critical section: callers wait a
//! bounded time for an in-process lock, then a database transaction bumps the
//! counter with a single `next_ordinal = next_ordinal + 1` statement. A
//! collection allocates inside its own transaction so the bump rolls back
//! with it. Nothing outside this module reads or writes the counter table.
//!
//! When invoices are written behind the sequencer's back (bulk imports, manual
//! edits) the counter can drift. [`InvoiceSequencer::resync`] puts it back to
//! one past the highest persisted ordinal, and [`audit`] reports gaps and
//! duplicates.

use crate::{
    config::settings::SequencerSettings,
    core::period::Period,
    entities::{Invoice, InvoiceCounter, invoice, invoice_counter},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{
    QueryOrder, Set, SqlErr, TransactionTrait, prelude::*, sea_query::Expr,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Formats an invoice number, e.g. ordinal 12 in March is `"12/03"`.
#[must_use]
pub fn format_invoice_number(ordinal: i64, period: Period) -> String {
    format!("{ordinal}/{:02}", period.month())
}

/// Extracts the ordinal from an invoice number, `None` if it is malformed.
#[must_use]
pub fn parse_invoice_ordinal(invoice_no: &str) -> Option<i64> {
    let (ordinal, _) = invoice_no.trim().split_once('/')?;
    ordinal.trim().parse::<i64>().ok().filter(|n| *n > 0)
}

/// The allocation lock, held. Dropping it lets the next allocation start.
#[derive(Debug)]
pub struct SequenceGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Issues invoice numbers. Cheap to clone; clones share the allocation lock.
#[derive(Debug, Clone)]
pub struct InvoiceSequencer {
    lock: Arc<Mutex<()>>,
    settings: SequencerSettings,
}

impl InvoiceSequencer {
    /// Creates a sequencer with its own allocation lock.
    #[must_use]
    pub fn new(settings: SequencerSettings) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            settings,
        }
    }

    /// Allocates the next invoice number for `period` in its own transaction.
    pub async fn next_invoice_number(
        &self,
        db: &DatabaseConnection,
        period: Period,
    ) -> Result<String> {
        let ordinal = self.allocate(db, period).await?;
        Ok(format_invoice_number(ordinal, period))
    }

    /// Takes the allocation lock, waiting at most the configured timeout.
    ///
    /// Take it before beginning the transaction that will allocate, so that
    /// every caller orders the lock ahead of the connection.
    pub async fn hold(&self, period: Period) -> Result<SequenceGuard> {
        tokio::time::timeout(
            self.settings.lock_timeout(),
            Arc::clone(&self.lock).lock_owned(),
        )
        .await
        .map(|guard| SequenceGuard { _guard: guard })
        .map_err(|_| Error::SequenceConflict {
            year: period.year(),
            month: period.month(),
            attempts: 0,
        })
    }

    /// Allocates the next invoice number for `period` inside the caller's
    /// transaction. The counter bump commits or rolls back with `txn`, so a
    /// failed caller leaves no hole. The guard must be kept until `txn` ends.
    pub async fn next_invoice_number_in<C>(
        &self,
        _held: &SequenceGuard,
        txn: &C,
        period: Period,
    ) -> Result<String>
    where
        C: TransactionTrait,
    {
        let ordinal = self.allocate_locked(txn, period).await?;
        Ok(format_invoice_number(ordinal, period))
    }

    /// Allocates the next ordinal for `period`, retrying contention a bounded
    /// number of times.
    #[instrument(skip(self, db))]
    pub async fn allocate(&self, db: &DatabaseConnection, period: Period) -> Result<i64> {
        let _guard = self.hold(period).await?;
        self.allocate_locked(db, period).await
    }

    async fn allocate_locked<C>(&self, conn: &C, period: Period) -> Result<i64>
    where
        C: TransactionTrait,
    {
        let max_attempts = self.settings.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match try_allocate(conn, period).await {
                Ok(ordinal) => {
                    debug!("Allocated invoice ordinal {ordinal} on attempt {attempt}");
                    return Ok(ordinal);
                }
                Err(Error::Database(err)) if is_contention(&err) => {
                    if attempt >= max_attempts {
                        warn!("Invoice counter contention persisted: {err}");
                        return Err(Error::SequenceConflict {
                            year: period.year(),
                            month: period.month(),
                            attempts: attempt,
                        });
                    }
                    warn!("Invoice counter contention on attempt {attempt}: {err}");
                    tokio::time::sleep(self.settings.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resets the counter for `period` to one past the highest ordinal found in
    /// persisted invoices. Returns the ordinal the next issuance will receive.
    #[instrument(skip(self, db))]
    pub async fn resync(&self, db: &DatabaseConnection, period: Period) -> Result<i64> {
        let _guard = self.hold(period).await?;

        let txn = db.begin().await?;
        let max_persisted = max_persisted_ordinal(&txn, period).await?;
        let next = max_persisted + 1;
        set_next_ordinal(&txn, period, next).await?;
        txn.commit().await?;

        info!("Invoice counter for {period} reset to {next}");
        Ok(next)
    }

    /// Resyncs every month that has invoices or a counter row.
    pub async fn resync_all(&self, db: &DatabaseConnection) -> Result<Vec<(Period, i64)>> {
        let mut periods = BTreeSet::new();
        for inv in Invoice::find().all(db).await? {
            periods.insert(Period::from_columns(inv.year, inv.month)?);
        }
        for counter in InvoiceCounter::find().all(db).await? {
            periods.insert(Period::from_columns(counter.year, counter.month)?);
        }

        let mut repaired = Vec::with_capacity(periods.len());
        for period in periods {
            repaired.push((period, self.resync(db, period).await?));
        }
        Ok(repaired)
    }
}

/// Bumps the counter in a transaction of its own, or a savepoint when `conn`
/// is already a transaction.
async fn try_allocate<C>(conn: &C, period: Period) -> Result<i64>
where
    C: TransactionTrait,
{
    let txn = conn.begin().await?;

    let bumped = InvoiceCounter::update_many()
        .col_expr(
            invoice_counter::Column::NextOrdinal,
            Expr::col(invoice_counter::Column::NextOrdinal).add(1),
        )
        .col_expr(invoice_counter::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(invoice_counter::Column::Year.eq(period.year()))
        .filter(invoice_counter::Column::Month.eq(period.month_i32()))
        .exec(&txn)
        .await?;

    let ordinal = if bumped.rows_affected == 0 {
        // First issuance of the month
        invoice_counter::ActiveModel {
            year: Set(period.year()),
            month: Set(period.month_i32()),
            next_ordinal: Set(2),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        1
    } else {
        let counter = find_counter(&txn, period)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("invoice counter {period}")))?;
        counter.next_ordinal - 1
    };

    txn.commit().await?;
    Ok(ordinal)
}

fn is_contention(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    let message = err.to_string().to_lowercase();
    message.contains("database is locked") || message.contains("busy")
}

async fn find_counter<C>(db: &C, period: Period) -> Result<Option<invoice_counter::Model>>
where
    C: ConnectionTrait,
{
    InvoiceCounter::find()
        .filter(invoice_counter::Column::Year.eq(period.year()))
        .filter(invoice_counter::Column::Month.eq(period.month_i32()))
        .one(db)
        .await
        .map_err(Into::into)
}

async fn period_invoices<C>(db: &C, period: Period) -> Result<Vec<invoice::Model>>
where
    C: ConnectionTrait,
{
    Invoice::find()
        .filter(invoice::Column::Year.eq(period.year()))
        .filter(invoice::Column::Month.eq(period.month_i32()))
        .order_by_asc(invoice::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

async fn max_persisted_ordinal<C>(db: &C, period: Period) -> Result<i64>
where
    C: ConnectionTrait,
{
    Ok(period_invoices(db, period)
        .await?
        .iter()
        .filter_map(|inv| parse_invoice_ordinal(&inv.invoice_no))
        .max()
        .unwrap_or(0))
}

async fn set_next_ordinal<C>(db: &C, period: Period, next: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    if let Some(counter) = find_counter(db, period).await? {
        let mut active: invoice_counter::ActiveModel = counter.into();
        active.next_ordinal = Set(next);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
    } else {
        invoice_counter::ActiveModel {
            year: Set(period.year()),
            month: Set(period.month_i32()),
            next_ordinal: Set(next),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }
    Ok(())
}

/// Findings of an invoice sequence audit for one month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceAudit {
    /// Month audited
    pub period: Period,
    /// Invoices found for the month
    pub issued: usize,
    /// Highest ordinal found, 0 when none
    pub max_ordinal: i64,
    /// Ordinals below the maximum that were never issued
    pub gaps: Vec<i64>,
    /// Ordinals issued more than once
    pub duplicates: Vec<i64>,
    /// Invoice numbers whose ordinal could not be read
    pub unparseable: Vec<String>,
    /// Value stored in the counter row, if any
    pub counter_next: Option<i64>,
}

impl SequenceAudit {
    /// How far the counter is ahead (positive) or behind (negative) of
    /// `max_ordinal + 1`. Zero when no counter row exists yet.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.counter_next
            .map_or(0, |next| next - (self.max_ordinal + 1))
    }

    /// True when ordinals are contiguous from 1 and the counter agrees.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty()
            && self.duplicates.is_empty()
            && self.unparseable.is_empty()
            && self.drift() == 0
    }
}

/// Checks one month's invoices for gaps, duplicates and counter drift.
pub async fn audit<C>(db: &C, period: Period) -> Result<SequenceAudit>
where
    C: ConnectionTrait,
{
    let invoices = period_invoices(db, period).await?;
    let mut seen: BTreeMap<i64, usize> = BTreeMap::new();
    let mut unparseable = Vec::new();
    for inv in &invoices {
        match parse_invoice_ordinal(&inv.invoice_no) {
            Some(ordinal) => *seen.entry(ordinal).or_default() += 1,
            None => unparseable.push(inv.invoice_no.clone()),
        }
    }

    let max_ordinal = seen.keys().next_back().copied().unwrap_or(0);
    let gaps = (1..max_ordinal).filter(|n| !seen.contains_key(n)).collect();
    let duplicates = seen
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(ordinal, _)| *ordinal)
        .collect();
    let counter_next = find_counter(db, period).await?.map(|c| c.next_ordinal);

    let report = SequenceAudit {
        period,
        issued: invoices.len(),
        max_ordinal,
        gaps,
        duplicates,
        unparseable,
        counter_next,
    };
    if !report.is_clean() {
        warn!(
            "Invoice sequence for {period} is not clean: gaps={:?} duplicates={:?} drift={}",
            report.gaps,
            report.duplicates,
            report.drift()
        );
    }
    Ok(report)
}
