use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tuition_ledger::{
    cli::{self, Cli},
    config::{
        database,
        settings::{load_config, load_default_config},
    },
    core::tuition_group::seed_tuition_groups,
    errors::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file, non-fatal since env vars can be set externally
    dotenv().ok();

    let cli = Cli::parse();

    // 3. Load the engine configuration
    let config = match &cli.config {
        Some(path) => load_config(path),
        None => load_default_config(),
    }
    .inspect_err(|e| error!("Failed to load configuration: {e}"))?;

    // 4. Connect and make sure the schema exists
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {e}"))?;
    database::create_tables(&db)
        .await
        .inspect(|_| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to create tables: {e}"))?;

    // 5. Seed configured tuition groups so a fresh database can bill
    seed_tuition_groups(&db, &config.tuition_groups)
        .await
        .inspect_err(|e| error!("Failed to seed tuition groups: {e}"))?;

    // 6. Run the requested operation
    let output = cli::execute(cli.command, &db, &config)
        .await
        .inspect_err(|e| error!("{e}"))?;
    println!("{output}");

    Ok(())
}
