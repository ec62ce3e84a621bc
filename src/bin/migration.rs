use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use course_market::migrator::Migrator;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "migration", about = "Manage the course-market database schema")]
struct Cli {
    /// Database URL; falls back to DATABASE_URL, then the configured default
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations (default)
    Up,
    /// Roll back applied migrations
    Down {
        /// How many to roll back; all when omitted
        #[arg(long)]
        steps: Option<u32>,
    },
    /// Show applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let database_url = match cli.database_url {
        Some(url) => url,
        None => {
            course_market::config::load_config()
                .context("failed to load configuration")?
                .database_url
        }
    };

    let mut options = ConnectOptions::new(database_url);
    options
        .max_connections(5)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .context("failed to connect to database")?;

    match cli.command.unwrap_or(Command::Up) {
        Command::Up => {
            Migrator::up(&db, None).await?;
            info!("Migration completed successfully");
        }
        Command::Down { steps } => {
            Migrator::down(&db, steps).await?;
            info!("Rollback completed successfully");
        }
        Command::Status => Migrator::status(&db).await?,
    }

    Ok(())
}
