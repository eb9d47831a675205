//! Hivemind CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use hivemind::adapters::sqlite::initialize_database;
use hivemind::cli::{commands, Cli, Commands, DbCommands};
use hivemind::config::{init_tracing, ConfigLoader};
use hivemind::services::{store_migration, AnalyticsService, EventService};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before configuration exists.
    if let Commands::Init { force } = cli.command {
        return commands::init::handle_init(force).await;
    }

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("Failed to load configuration")?,
    };
    init_tracing(&config);

    let pool = initialize_database(&config.database.url)
        .await
        .context("Failed to open database")?;

    // Fold an older project-local store into this one, once.
    if let Some(report) =
        store_migration::auto_migrate(&pool, std::path::Path::new("."), false).await?
    {
        tracing::info!(
            rows = report.total_rows(),
            backup = ?report.backed_up_to,
            "legacy store merged"
        );
    }

    let events = EventService::new(pool.clone());

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Db(db_command) => {
            let analytics = AnalyticsService::new(pool);
            match db_command {
                DbCommands::List => commands::db::handle_list(cli.json).await?,
                DbCommands::Query { sql } => {
                    commands::db::handle_query(&analytics, &sql, cli.json).await?;
                }
                DbCommands::Analytics { name, since, until, project, epic, format } => {
                    commands::db::handle_analytics(
                        &analytics, &name, since, until, project, epic, &format, cli.json,
                    )
                    .await?;
                }
            }
        }
        Commands::Serve { host, port } => {
            commands::serve::handle_serve(events, &config, host, port).await?;
        }
    }

    Ok(())
}
