//! Monthly ledger generation.
//!
//! For a `(year, month)` the generator writes one ledger record per billable
//! student:
//!
//! - opening debt (dudau) is the previous month's closing debt, or the
//!   imported opening balance for the first month of history
//! - amount due (phaithu) is the resolved tuition groups net of discount,
//!   plus the recurring extra fee
//! - amount collected (dathu) is the sum of the month's matching transactions
//! - closing debt (duno) = dudau + phaithu - dathu
//!
//! Writing a month is an idempotent upsert followed by a cascade over every
//! later month of the same student, since each opening debt depends on the
//! month before. Upsert, cascade and balance invalidation share one database
//! transaction per student. Students are independent, so a batch runs them on
//! a bounded number of concurrent tasks.

use crate::{
    config::settings::{AppConfig, WithdrawnPolicy},
    core::{balance, period::Period, tuition_group::TuitionGroupResolver},
    entities::{
        LedgerRecord, OpeningBalance, Student, Transaction, ledger_record, opening_balance,
        student, transaction, tuition_group,
    },
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{Condition, QueryOrder, Set, TransactionTrait, prelude::*};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Detail key for the discount line of the amount due
pub const DISCOUNT_KEY: &str = "discount";
/// Detail key for the extra fee line of the amount due
pub const EXTRA_FEE_KEY: &str = "extra_fee";
/// Detail key for the reduction applied to a partial month
pub const PRORATION_KEY: &str = "proration";

/// The four ledger figures of one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerFigures {
    /// dudau
    pub opening_debt: i64,
    /// phaithu
    pub amount_due: i64,
    /// dathu
    pub amount_collected: i64,
    /// duno
    pub closing_debt: i64,
}

impl LedgerFigures {
    /// Computes the closing debt. `None` on arithmetic overflow.
    #[must_use]
    pub fn compute(opening_debt: i64, amount_due: i64, amount_collected: i64) -> Option<Self> {
        let closing_debt = opening_debt
            .checked_add(amount_due)?
            .checked_sub(amount_collected)?;
        Some(Self {
            opening_debt,
            amount_due,
            amount_collected,
            closing_debt,
        })
    }

    /// Whether `closing = opening + due - collected` holds.
    #[must_use]
    pub fn holds(&self) -> bool {
        Self::compute(self.opening_debt, self.amount_due, self.amount_collected)
            .is_some_and(|expected| expected.closing_debt == self.closing_debt)
    }

    fn of(record: &ledger_record::Model) -> Self {
        Self {
            opening_debt: record.opening_debt,
            amount_due: record.amount_due,
            amount_collected: record.amount_collected,
            closing_debt: record.closing_debt,
        }
    }
}

/// How a student takes part in a given month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrollment {
    /// Billed in full
    Billable,
    /// Billed for `days_enrolled` of `days_in_month` days
    Prorated {
        /// Days up to and including the withdrawal date
        days_enrolled: u32,
        /// Length of the month
        days_in_month: u32,
    },
    /// Not billed, no record written
    Excluded,
}

/// Decides whether `student` is billed in `period`.
///
/// Inactive students and students withdrawn before the month are excluded.
/// The month the withdrawal takes effect follows `policy`.
pub fn enrollment_for(
    student: &student::Model,
    period: Period,
    policy: WithdrawnPolicy,
) -> Result<Enrollment> {
    if !student.is_active {
        return Ok(Enrollment::Excluded);
    }
    if !student.is_withdrawn {
        return Ok(Enrollment::Billable);
    }
    let Some(withdrawn_on) = student.withdrawn_on else {
        return Ok(Enrollment::Excluded);
    };

    let withdrawal_month = Period::containing(withdrawn_on);
    if withdrawal_month < period {
        return Ok(Enrollment::Excluded);
    }
    if withdrawal_month > period {
        return Ok(Enrollment::Billable);
    }
    Ok(match policy {
        WithdrawnPolicy::Exclude => Enrollment::Excluded,
        WithdrawnPolicy::BillInFull => Enrollment::Billable,
        WithdrawnPolicy::Prorate => Enrollment::Prorated {
            days_enrolled: chrono::Datelike::day(&withdrawn_on),
            days_in_month: period.days_in_month()?,
        },
    })
}

/// Amount due with its per-code breakdown. The breakdown sums to `total`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DueBreakdown {
    /// Fee code -> amount, plus discount and extra fee lines
    pub detail: BTreeMap<String, i64>,
    /// phaithu
    pub total: i64,
}

/// Computes the amount due from the resolved groups.
///
/// The discount cannot push the group total below zero. A negative discount
/// or extra fee is malformed input.
pub fn compute_due(
    student: &student::Model,
    groups: &[&tuition_group::Model],
    enrollment: Enrollment,
) -> Result<DueBreakdown> {
    let invalid = |reason: String| Error::InvalidStudentData {
        student_id: student.school_id.clone(),
        reason,
    };
    if student.discount < 0 {
        return Err(invalid(format!("negative discount {}", student.discount)));
    }
    if student.extra_fee < 0 {
        return Err(invalid(format!("negative extra fee {}", student.extra_fee)));
    }

    let mut detail: BTreeMap<String, i64> = BTreeMap::new();
    let mut gross: i64 = 0;
    for group in groups {
        if group.default_amount < 0 {
            return Err(invalid(format!(
                "tuition group {} has negative amount",
                group.code
            )));
        }
        gross = gross
            .checked_add(group.default_amount)
            .ok_or_else(|| invalid("amount due overflows".to_string()))?;
        *detail.entry(group.code.clone()).or_default() += group.default_amount;
    }

    let discount = student.discount.min(gross);
    if discount > 0 {
        detail.insert(DISCOUNT_KEY.to_string(), -discount);
    }
    if student.extra_fee > 0 {
        detail.insert(EXTRA_FEE_KEY.to_string(), student.extra_fee);
    }

    let total = detail.values().try_fold(0_i64, |acc, v| acc.checked_add(*v));
    let mut total = total.ok_or_else(|| invalid("amount due overflows".to_string()))?;

    if let Enrollment::Prorated {
        days_enrolled,
        days_in_month,
    } = enrollment
    {
        let prorated = i128::from(total) * i128::from(days_enrolled)
            / i128::from(days_in_month.max(1));
        let prorated =
            i64::try_from(prorated).map_err(|_| invalid("proration overflows".to_string()))?;
        if prorated != total {
            detail.insert(PRORATION_KEY.to_string(), prorated - total);
        }
        total = prorated;
    }

    Ok(DueBreakdown { detail, total })
}

/// Collected amount with its per-code breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Collected {
    /// Fee code -> amount collected
    pub detail: BTreeMap<String, i64>,
    /// dathu
    pub total: i64,
    /// Latest transaction counted
    pub last_transaction_id: Option<i64>,
}

/// Sums the transactions that count toward the month: those paying a billed
/// fee code, and those flagged as other collections. `None` on overflow.
#[must_use]
pub fn compute_collected(
    transactions: &[transaction::Model],
    fee_codes: &[&str],
) -> Option<Collected> {
    let mut collected = Collected::default();
    for tx in transactions
        .iter()
        .filter(|tx| tx.is_other || fee_codes.contains(&tx.fee_code.as_str()))
    {
        let line = collected.detail.entry(tx.fee_code.clone()).or_default();
        *line = line.checked_add(tx.amount)?;
        collected.total = collected.total.checked_add(tx.amount)?;
        collected.last_transaction_id = collected.last_transaction_id.max(Some(tx.id));
    }
    Some(collected)
}

/// Whether a write created a record or replaced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed for the month
    Created,
    /// The month's record was overwritten
    Updated,
}

/// Result of generating one student's month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentRun {
    /// A record was written
    Written {
        /// Created or updated
        outcome: UpsertOutcome,
        /// The stored record
        record: ledger_record::Model,
        /// Later months whose opening and closing debts were rewritten
        cascaded: usize,
    },
    /// The student is not billed this month
    Excluded,
}

/// A student the batch had to skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentFailure {
    /// School ID of the student
    pub student_id: String,
    /// Why the student was skipped
    pub reason: String,
}

/// Counts reported by a batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSummary {
    /// Month generated
    pub period: Period,
    /// Records inserted
    pub created: usize,
    /// Records overwritten
    pub updated: usize,
    /// Students skipped because of bad data
    pub skipped: usize,
    /// Students not billed (inactive or withdrawn)
    pub excluded: usize,
    /// Later-month records re-chained
    pub cascaded: usize,
    /// Whether the run stopped early on request
    pub aborted: bool,
    /// Details of skipped students
    pub failures: Vec<StudentFailure>,
}

impl GenerationSummary {
    fn new(period: Period) -> Self {
        Self {
            period,
            created: 0,
            updated: 0,
            skipped: 0,
            excluded: 0,
            cascaded: 0,
            aborted: false,
            failures: Vec::new(),
        }
    }

    /// Folds one student's result in. Fatal errors are handed back.
    fn absorb(&mut self, student_id: String, result: Result<StudentRun>) -> Result<()> {
        match result {
            Ok(StudentRun::Written {
                outcome, cascaded, ..
            }) => {
                match outcome {
                    UpsertOutcome::Created => self.created += 1,
                    UpsertOutcome::Updated => self.updated += 1,
                }
                self.cascaded += cascaded;
                Ok(())
            }
            Ok(StudentRun::Excluded) => {
                self.excluded += 1;
                Ok(())
            }
            Err(err) if err.is_record_level() => {
                warn!("Skipping student {student_id} for {}: {err}", self.period);
                self.skipped += 1;
                self.failures.push(StudentFailure {
                    student_id,
                    reason: err.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                error!("Ledger run for {} failed on student {student_id}: {err}", self.period);
                Err(err)
            }
        }
    }
}

/// Best-effort stop signal for a running batch. Students already started
/// finish; no new ones are started.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Requests the batch to stop issuing work.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Generates ledger records. Cheap to clone; clones share the resolver.
#[derive(Debug, Clone)]
pub struct LedgerGenerator {
    resolver: Arc<TuitionGroupResolver>,
    withdrawn_policy: WithdrawnPolicy,
    workers: usize,
}

impl LedgerGenerator {
    /// Builds a generator around an already loaded resolver.
    #[must_use]
    pub fn new(
        resolver: TuitionGroupResolver,
        withdrawn_policy: WithdrawnPolicy,
        workers: usize,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            withdrawn_policy,
            workers: workers.max(1),
        }
    }

    /// Loads the tuition groups and settings a batch needs.
    pub async fn load(db: &DatabaseConnection, config: &AppConfig) -> Result<Self> {
        let resolver = TuitionGroupResolver::load(db, config.grade_overrides.clone()).await?;
        Ok(Self::new(
            resolver,
            config.ledger.withdrawn_policy,
            config.ledger.workers,
        ))
    }

    /// The resolver this generator bills with
    #[must_use]
    pub fn resolver(&self) -> &TuitionGroupResolver {
        &self.resolver
    }

    /// Generates `period` for every active student.
    pub async fn generate(
        &self,
        db: &DatabaseConnection,
        period: Period,
    ) -> Result<GenerationSummary> {
        self.generate_with_abort(db, period, &AbortHandle::default())
            .await
    }

    /// Generates `period` for every active student, checking `abort` before
    /// each student is started.
    #[instrument(skip(self, db, abort))]
    pub async fn generate_with_abort(
        &self,
        db: &DatabaseConnection,
        period: Period,
        abort: &AbortHandle,
    ) -> Result<GenerationSummary> {
        let students = Student::find()
            .filter(student::Column::IsActive.eq(true))
            .order_by_asc(student::Column::SchoolId)
            .all(db)
            .await?;
        info!(
            "Generating ledger for {period}: {} active students, {} workers",
            students.len(),
            self.workers
        );

        let mut summary = GenerationSummary::new(period);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(String, Result<StudentRun>)> = JoinSet::new();

        for student in students {
            if abort.is_aborted() {
                info!("Ledger run for {period} aborted, no further students started");
                summary.aborted = true;
                break;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| Error::TaskFailed {
                    message: e.to_string(),
                })?;
            while let Some(joined) = tasks.try_join_next() {
                absorb_joined(&mut summary, &mut tasks, joined)?;
            }

            let generator = self.clone();
            let db = db.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = generator.generate_student(&db, &student, period).await;
                (student.school_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            absorb_joined(&mut summary, &mut tasks, joined)?;
        }

        info!(
            "Ledger for {period}: created {}, updated {}, skipped {}, excluded {}, cascaded {}",
            summary.created, summary.updated, summary.skipped, summary.excluded, summary.cascaded
        );
        Ok(summary)
    }

    /// Generates `period` for one student in its own database transaction.
    pub async fn generate_student(
        &self,
        db: &DatabaseConnection,
        student: &student::Model,
        period: Period,
    ) -> Result<StudentRun> {
        let txn = db.begin().await?;
        let run = self.generate_student_in(&txn, student, period).await?;
        txn.commit().await?;
        Ok(run)
    }

    /// Generates `period` for one student on an existing connection or
    /// transaction: resolve, compute, upsert, cascade, invalidate.
    pub async fn generate_student_in<C>(
        &self,
        conn: &C,
        student: &student::Model,
        period: Period,
    ) -> Result<StudentRun>
    where
        C: ConnectionTrait,
    {
        let enrollment = enrollment_for(student, period, self.withdrawn_policy)?;
        if enrollment == Enrollment::Excluded {
            // Exclusion only stops a new month; a stored one keeps its bill
            return match find_record(conn, &student.school_id, period).await? {
                Some(record) => refresh_collected(conn, record).await,
                None => {
                    debug!("Student {} not billed in {period}", student.school_id);
                    Ok(StudentRun::Excluded)
                }
            };
        }

        let groups = self.resolver.resolve(student, period);
        let due = compute_due(student, &groups, enrollment)?;
        let fee_codes: Vec<&str> = groups.iter().map(|g| g.code.as_str()).collect();

        let (opening_debt, previous_record_id) =
            opening_position(conn, &student.school_id, period).await?;
        ensure_no_gap_after(conn, &student.school_id, period).await?;

        let transactions = month_transactions(conn, &student.school_id, period).await?;
        let collected = compute_collected(&transactions, &fee_codes)
            .ok_or_else(|| invariant(&student.school_id, period, "amount collected overflows"))?;

        let figures = LedgerFigures::compute(opening_debt, due.total, collected.total)
            .ok_or_else(|| invariant(&student.school_id, period, "closing debt overflows"))?;
        if !figures.holds() {
            return Err(invariant(&student.school_id, period, "figures do not balance"));
        }

        let existing = find_record(conn, &student.school_id, period).await?;
        let outcome = if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        };
        let mut active: ledger_record::ActiveModel = match existing {
            Some(record) => record.into(),
            None => ledger_record::ActiveModel {
                student_id: Set(student.school_id.clone()),
                year: Set(period.year()),
                month: Set(period.month_i32()),
                ..Default::default()
            },
        };
        active.fee_codes = Set(fee_codes.join(","));
        active.opening_debt = Set(figures.opening_debt);
        active.amount_due = Set(figures.amount_due);
        active.amount_collected = Set(figures.amount_collected);
        active.closing_debt = Set(figures.closing_debt);
        active.due_detail = Set(serde_json::to_string(&due.detail)?);
        active.collected_detail = Set(serde_json::to_string(&collected.detail)?);
        active.last_transaction_id = Set(collected.last_transaction_id);
        active.previous_record_id = Set(previous_record_id);
        active.updated_at = Set(Utc::now());
        let record = match outcome {
            UpsertOutcome::Created => active.insert(conn).await?,
            UpsertOutcome::Updated => active.update(conn).await?,
        };

        let cascaded = rechain_after(conn, &record).await?;
        balance::invalidate(conn, &student.school_id).await?;

        debug!(
            "Student {} {period}: dudau {} phaithu {} dathu {} duno {} ({outcome:?}, {cascaded} cascaded)",
            student.school_id,
            record.opening_debt,
            record.amount_due,
            record.amount_collected,
            record.closing_debt
        );
        Ok(StudentRun::Written {
            outcome,
            record,
            cascaded,
        })
    }
}

/// Recounts the collected amount of a stored month and cascades, leaving its
/// amount due and fee codes as they were billed.
async fn refresh_collected<C>(conn: &C, record: ledger_record::Model) -> Result<StudentRun>
where
    C: ConnectionTrait,
{
    let period = Period::from_columns(record.year, record.month)?;
    let student_id = record.student_id.clone();
    let fee_codes: Vec<&str> = record
        .fee_codes
        .split(',')
        .filter(|code| !code.is_empty())
        .collect();

    let (opening_debt, previous_record_id) =
        opening_position(conn, &student_id, period).await?;
    let transactions = month_transactions(conn, &student_id, period).await?;
    let collected = compute_collected(&transactions, &fee_codes)
        .ok_or_else(|| invariant(&student_id, period, "amount collected overflows"))?;
    let figures = LedgerFigures::compute(opening_debt, record.amount_due, collected.total)
        .ok_or_else(|| invariant(&student_id, period, "closing debt overflows"))?;

    let collected_detail = serde_json::to_string(&collected.detail)?;
    let mut active: ledger_record::ActiveModel = record.into();
    active.opening_debt = Set(figures.opening_debt);
    active.amount_collected = Set(figures.amount_collected);
    active.closing_debt = Set(figures.closing_debt);
    active.collected_detail = Set(collected_detail);
    active.last_transaction_id = Set(collected.last_transaction_id);
    active.previous_record_id = Set(previous_record_id);
    active.updated_at = Set(Utc::now());
    let record = active.update(conn).await?;

    let cascaded = rechain_after(conn, &record).await?;
    balance::invalidate(conn, &student_id).await?;
    debug!(
        "Student {student_id} {period} no longer billed; collected recounted to {}",
        record.amount_collected
    );
    Ok(StudentRun::Written {
        outcome: UpsertOutcome::Updated,
        record,
        cascaded,
    })
}

async fn month_transactions<C>(
    conn: &C,
    student_id: &str,
    period: Period,
) -> Result<Vec<transaction::Model>>
where
    C: ConnectionTrait,
{
    Transaction::find()
        .filter(transaction::Column::StudentId.eq(student_id))
        .filter(transaction::Column::Year.eq(period.year()))
        .filter(transaction::Column::Month.eq(period.month_i32()))
        .order_by_asc(transaction::Column::Id)
        .all(conn)
        .await
        .map_err(Into::into)
}

fn absorb_joined(
    summary: &mut GenerationSummary,
    tasks: &mut JoinSet<(String, Result<StudentRun>)>,
    joined: std::result::Result<(String, Result<StudentRun>), tokio::task::JoinError>,
) -> Result<()> {
    let outcome = joined
        .map_err(|e| Error::TaskFailed {
            message: e.to_string(),
        })
        .and_then(|(student_id, result)| summary.absorb(student_id, result));
    if outcome.is_err() {
        // Dropped transactions roll back
        tasks.abort_all();
    }
    outcome
}

/// An [`Error::InvariantViolation`] for one student's month.
pub(crate) fn invariant(student_id: &str, period: Period, detail: &str) -> Error {
    Error::InvariantViolation {
        student_id: student_id.to_string(),
        year: period.year(),
        month: period.month(),
        detail: detail.to_string(),
    }
}

/// The stored record for one student and month, if any.
pub async fn find_record<C>(
    conn: &C,
    student_id: &str,
    period: Period,
) -> Result<Option<ledger_record::Model>>
where
    C: ConnectionTrait,
{
    LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(student_id))
        .filter(ledger_record::Column::Year.eq(period.year()))
        .filter(ledger_record::Column::Month.eq(period.month_i32()))
        .one(conn)
        .await
        .map_err(Into::into)
}

/// Imported opening balance, zero when none was imported.
pub async fn opening_balance_of<C>(conn: &C, student_id: &str) -> Result<i64>
where
    C: ConnectionTrait,
{
    Ok(OpeningBalance::find()
        .filter(opening_balance::Column::StudentId.eq(student_id))
        .one(conn)
        .await?
        .map_or(0, |ob| ob.amount))
}

fn before(period: Period) -> Condition {
    Condition::any()
        .add(ledger_record::Column::Year.lt(period.year()))
        .add(
            Condition::all()
                .add(ledger_record::Column::Year.eq(period.year()))
                .add(ledger_record::Column::Month.lt(period.month_i32())),
        )
}

fn after(period: Period) -> Condition {
    Condition::any()
        .add(ledger_record::Column::Year.gt(period.year()))
        .add(
            Condition::all()
                .add(ledger_record::Column::Year.eq(period.year()))
                .add(ledger_record::Column::Month.gt(period.month_i32())),
        )
}

/// Opening debt and predecessor link for `period`.
///
/// Uses the previous month's record when it exists. Without one, the month
/// starts the student's history only if nothing earlier was ever recorded.
async fn opening_position<C>(
    conn: &C,
    student_id: &str,
    period: Period,
) -> Result<(i64, Option<i64>)>
where
    C: ConnectionTrait,
{
    let previous = period.previous();
    if let Some(record) = find_record(conn, student_id, previous).await? {
        return Ok((record.closing_debt, Some(record.id)));
    }

    let earlier = LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(student_id))
        .filter(before(period))
        .one(conn)
        .await?;
    if earlier.is_some() {
        return Err(Error::MissingPredecessor {
            student_id: student_id.to_string(),
            year: previous.year(),
            month: previous.month(),
        });
    }
    Ok((opening_balance_of(conn, student_id).await?, None))
}

/// Refuses to write a month that would leave a hole before later history.
async fn ensure_no_gap_after<C>(conn: &C, student_id: &str, period: Period) -> Result<()>
where
    C: ConnectionTrait,
{
    let first_later = LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(student_id))
        .filter(after(period))
        .order_by_asc(ledger_record::Column::Year)
        .order_by_asc(ledger_record::Column::Month)
        .one(conn)
        .await?;
    if let Some(record) = first_later {
        let later = Period::from_columns(record.year, record.month)?;
        if later != period.next() {
            let missing = later.previous();
            return Err(Error::MissingPredecessor {
                student_id: student_id.to_string(),
                year: missing.year(),
                month: missing.month(),
            });
        }
    }
    Ok(())
}

/// Rewrites opening and closing debt of every month after `anchor`, in
/// order, leaving their due and collected amounts alone. Returns the number
/// of records changed.
pub async fn rechain_after<C>(conn: &C, anchor: &ledger_record::Model) -> Result<usize>
where
    C: ConnectionTrait,
{
    let anchor_period = Period::from_columns(anchor.year, anchor.month)?;
    let later = LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(anchor.student_id.as_str()))
        .filter(after(anchor_period))
        .order_by_asc(ledger_record::Column::Year)
        .order_by_asc(ledger_record::Column::Month)
        .all(conn)
        .await?;

    let mut previous = anchor.clone();
    let mut changed = 0;
    for record in later {
        let period = Period::from_columns(record.year, record.month)?;
        let expected = Period::from_columns(previous.year, previous.month)?.next();
        if period != expected {
            warn!(
                "Ledger chain for {} breaks before {period}; cascade stopped",
                anchor.student_id
            );
            break;
        }
        if !LedgerFigures::of(&record).holds() {
            return Err(invariant(&record.student_id, period, "stored record does not balance"));
        }
        if record.opening_debt == previous.closing_debt
            && record.previous_record_id == Some(previous.id)
        {
            previous = record;
            continue;
        }

        let figures =
            LedgerFigures::compute(previous.closing_debt, record.amount_due, record.amount_collected)
                .ok_or_else(|| invariant(&record.student_id, period, "closing debt overflows"))?;
        let mut active: ledger_record::ActiveModel = record.into();
        active.opening_debt = Set(figures.opening_debt);
        active.closing_debt = Set(figures.closing_debt);
        active.previous_record_id = Set(Some(previous.id));
        active.updated_at = Set(Utc::now());
        previous = active.update(conn).await?;
        changed += 1;
    }
    Ok(changed)
}

/// Re-chains a student's whole history from the opening balance. Used after
/// the opening balance changes.
pub async fn rechain_student<C>(conn: &C, student_id: &str) -> Result<usize>
where
    C: ConnectionTrait,
{
    let Some(first) = LedgerRecord::find()
        .filter(ledger_record::Column::StudentId.eq(student_id))
        .order_by_asc(ledger_record::Column::Year)
        .order_by_asc(ledger_record::Column::Month)
        .one(conn)
        .await?
    else {
        return Ok(0);
    };

    let opening = opening_balance_of(conn, student_id).await?;
    let period = Period::from_columns(first.year, first.month)?;
    let (first, mut changed) = if first.opening_debt == opening {
        (first, 0)
    } else {
        let figures = LedgerFigures::compute(opening, first.amount_due, first.amount_collected)
            .ok_or_else(|| invariant(student_id, period, "closing debt overflows"))?;
        let mut active: ledger_record::ActiveModel = first.into();
        active.opening_debt = Set(figures.opening_debt);
        active.closing_debt = Set(figures.closing_debt);
        active.updated_at = Set(Utc::now());
        (active.update(conn).await?, 1)
    };
    changed += rechain_after(conn, &first).await?;
    Ok(changed)
}

/// Formats a batch summary for logs and the command line.
#[must_use]
pub fn format_generation_summary(summary: &GenerationSummary) -> String {
    use std::fmt::Write;

    let mut out = format!(
        "Ledger {} - created {}, updated {}, skipped {}, excluded {}, cascaded {}",
        summary.period,
        summary.created,
        summary.updated,
        summary.skipped,
        summary.excluded,
        summary.cascaded
    );
    if summary.aborted {
        out.push_str(" (aborted)");
    }
    for failure in &summary.failures {
        // write! is infallible when writing to String, so unwrap is safe
        write!(out, "\n  skipped {}: {}", failure.student_id, failure.reason).unwrap();
    }
    out
}
