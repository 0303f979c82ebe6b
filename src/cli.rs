//! Command line interface.
//!
//! Each subcommand maps onto one core operation. Handlers return the text to
//! print so the binary stays a thin shell around [`execute`].

use crate::{
    config::settings::AppConfig,
    core::{
        balance,
        collection::{self, NewCollection},
        import,
        invoice::{self, InvoiceSequencer},
        ledger::{self, LedgerGenerator},
        monthly::{self, FirstDayOfMonth},
        period::Period,
        report,
        tuition_group::seed_tuition_groups,
    },
    errors::Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use std::{fmt::Write, path::PathBuf};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "tuition-ledger")]
#[command(about = "Monthly tuition ledger engine")]
#[command(version)]
pub struct Cli {
    /// Path to config.toml (default: $CONFIG_PATH or ./config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// Ledger operations
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate the current month if today is a run day
    Trigger {
        /// Evaluate as of this instant instead of now (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Generate (or regenerate) one month for every active student
    Generate {
        /// Month to generate, as YYYY-MM
        #[arg(value_parser = parse_period)]
        period: Period,
    },

    /// Record a payment and issue its invoice
    Collect {
        /// School ID of the paying student
        student_id: String,
        /// Fee code paid
        fee_code: String,
        /// Amount received
        amount: i64,
        /// Date the money was received (default: today)
        #[arg(long)]
        paid_on: Option<NaiveDate>,
        /// Date the invoice is issued (default: today)
        #[arg(long)]
        issued_on: Option<NaiveDate>,
        /// Ledger month to count the payment in, as YYYY-MM
        #[arg(long, value_parser = parse_period)]
        for_month: Option<Period>,
        /// Count toward the collected amount whatever the fee code
        #[arg(long)]
        other: bool,
        /// Invoice title
        #[arg(long, default_value = "Tuition")]
        title: String,
        /// Note on the transaction
        #[arg(long)]
        note: Option<String>,
    },

    /// Import opening balances from a CSV file
    ImportBalances {
        /// CSV with a student id column and a balance column
        path: PathBuf,
    },

    /// Reset every invoice counter to the highest issued number + 1
    RepairInvoiceSequence,

    /// Report gaps and duplicates in one month's invoice numbers
    AuditInvoices {
        /// Issuance month, as YYYY-MM
        #[arg(value_parser = parse_period)]
        period: Period,
    },

    /// Show a student's current balance
    Balance {
        /// School ID
        student_id: String,
    },

    /// Show a student's ledger history
    History {
        /// School ID
        student_id: String,
    },

    /// Yearly revenue and debt rollup
    Rollup {
        /// Calendar year
        year: i32,
    },

    /// Insert configured tuition groups that are missing from the database
    Seed,
}

/// Parses `YYYY-MM`.
pub fn parse_period(raw: &str) -> std::result::Result<Period, String> {
    let (year, month) = raw
        .trim()
        .split_once('-')
        .ok_or_else(|| format!("expected YYYY-MM, got {raw:?}"))?;
    let year: i32 = year.parse().map_err(|_| format!("bad year in {raw:?}"))?;
    let month: u32 = month.parse().map_err(|_| format!("bad month in {raw:?}"))?;
    Period::new(year, month).map_err(|e| e.to_string())
}

/// Runs `command` and returns the text to print.
pub async fn execute(
    command: Command,
    db: &DatabaseConnection,
    config: &AppConfig,
) -> Result<String> {
    let offset = config.ledger.timezone()?;
    let today = monthly::local_date(Utc::now(), offset);

    match command {
        Command::Trigger { at } => {
            let generator = LedgerGenerator::load(db, config).await?;
            let outcome = monthly::run_monthly_trigger(
                db,
                &generator,
                &FirstDayOfMonth,
                offset,
                at.unwrap_or_else(Utc::now),
            )
            .await?;
            Ok(monthly::format_trigger_outcome(&outcome))
        }
        Command::Generate { period } => {
            let generator = LedgerGenerator::load(db, config).await?;
            let summary = generator.generate(db, period).await?;
            Ok(ledger::format_generation_summary(&summary))
        }
        Command::Collect {
            student_id,
            fee_code,
            amount,
            paid_on,
            issued_on,
            for_month,
            other,
            title,
            note,
        } => {
            let generator = LedgerGenerator::load(db, config).await?;
            let sequencer = InvoiceSequencer::new(config.sequencer.clone());
            let receipt = collection::record_collection(
                db,
                &sequencer,
                &generator,
                NewCollection {
                    student_id,
                    fee_code,
                    amount,
                    payment_date: paid_on.unwrap_or(today),
                    issued_on: issued_on.unwrap_or(today),
                    bucket: for_month,
                    is_other: other,
                    title,
                    note,
                },
            )
            .await?;
            Ok(format!(
                "Invoice {} for {} ({}), counted in {}-{:02}. Balance now {}",
                receipt.invoice.invoice_no,
                receipt.transaction.student_id,
                report::format_amount(receipt.transaction.amount),
                receipt.transaction.year,
                receipt.transaction.month,
                report::format_amount(receipt.balance.total)
            ))
        }
        Command::ImportBalances { path } => {
            let summary = import::import_balances_from_path(db, &path).await?;
            Ok(format!(
                "Imported {}: {} created, {} updated, {} not found, {} errors",
                path.display(),
                summary.created,
                summary.updated,
                summary.not_found,
                summary.errors
            ))
        }
        Command::RepairInvoiceSequence => {
            let sequencer = InvoiceSequencer::new(config.sequencer.clone());
            let repaired = sequencer.resync_all(db).await?;
            let mut out = format!("Resynced {} invoice counters", repaired.len());
            for (period, next) in repaired {
                // write! is infallible when writing to String, so unwrap is safe
                write!(out, "\n  {period}: next {next}").unwrap();
            }
            Ok(out)
        }
        Command::AuditInvoices { period } => {
            let audit = invoice::audit(db, period).await?;
            Ok(format!(
                "{}: {} issued, max {}, gaps {:?}, duplicates {:?}, unparseable {:?}, drift {}",
                audit.period,
                audit.issued,
                audit.max_ordinal,
                audit.gaps,
                audit.duplicates,
                audit.unparseable,
                audit.drift()
            ))
        }
        Command::Balance { student_id } => {
            let snapshot = balance::get_balance(db, &student_id).await?;
            let mut out = format!(
                "{}: {}",
                snapshot.student_id,
                report::format_amount(snapshot.total)
            );
            for (code, amount) in &snapshot.detail {
                write!(out, "\n  {code}: {}", report::format_amount(*amount)).unwrap();
            }
            Ok(out)
        }
        Command::History { student_id } => {
            let records = report::ledger_history(db, &student_id).await?;
            Ok(report::format_history(&records))
        }
        Command::Rollup { year } => {
            let rollup = report::yearly_rollup(db, year).await?;
            Ok(report::format_yearly_rollup(&rollup))
        }
        Command::Seed => {
            let inserted = seed_tuition_groups(db, &config.tuition_groups).await?;
            Ok(format!("Seeded {inserted} tuition groups"))
        }
    }
}
