use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rsd_core::RequestId;
use rsd_dispatch::{build_service, maybe_build_scheduler, AutoFinishSweep, DispatchConfig};
use rsd_storage::PgStore;
use rsd_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rsd-cli")]
#[command(about = "Roadside service dispatch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with the auto-finish scheduler.
    Serve,
    /// Finish requests whose client confirmation window has lapsed.
    Sweep,
    /// Settle one finished request.
    Settle { request_id: RequestId },
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DispatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let service = Arc::new(build_service(&config).await?);
            let scheduler = maybe_build_scheduler(&config, service.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.auto_finish_cron, "auto-finish scheduler running");
            }
            rsd_web::serve(AppState::new(service.clone()), config.web_port).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            service.shutdown();
        }
        Commands::Sweep => {
            let service = Arc::new(build_service(&config).await?);
            let report = AutoFinishSweep::new(service.clone()).run_once().await?;
            println!(
                "sweep complete: scanned={} finished={} skipped={} failed={}",
                report.scanned, report.finished, report.skipped, report.failed
            );
            service.shutdown();
        }
        Commands::Settle { request_id } => {
            let service = build_service(&config).await?;
            let outcome = service.settle(request_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            service.shutdown();
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
