use anyhow::{Context, Result};
use census_service::config::Config;
use census_service::household_store::{HouseholdStore, PgHouseholdStore};
use census_service::seed;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "census-seed", about = "Census database seeder")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Add sample households to the database
    Import {
        /// Seed file
        #[arg(long, value_name = "PATH", default_value = "data/households.json")]
        file: PathBuf,
    },
    /// Remove all households from the database
    Delete,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let store = PgHouseholdStore::new(&config.database)
        .await
        .context("Failed to initialize household store")?;
    if config.database.run_migrations {
        store.run_migrations().await?;
    }

    match cli.cmd {
        Cmd::Import { file } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let imported = seed::import(&store, seed::parse(&body)?).await?;
            info!(imported, file = %file.display(), "Data imported");
        }
        Cmd::Delete => {
            let deleted = store
                .delete_all()
                .await
                .context("Failed to delete households")?;
            info!(deleted, "Data destroyed");
        }
    }

    Ok(())
}
