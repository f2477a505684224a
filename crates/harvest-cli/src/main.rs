use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_auth::{AuthOrchestrator, Credentials};
use harvest_browser::{Bounded, WebDriverBrowser};
use harvest_storage::{HttpFetcher, MemoryRecordStore, PgRecordStore, RecordStore};
use harvest_sync::{
    build_scheduler, report_recent_runs_markdown, session_store_for, HarvestConfig,
    HarvestPipeline, OpenAiEmbedder,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Ticket harvest: SSO login, paginated extraction, embedding and ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Authenticate, extract every enabled collection, embed and upsert.
    Run {
        /// Write into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the login flow only and persist the session.
    Login,
    /// Report whether the stored session is still live.
    CheckSession,
    Migrate,
    /// Run on the configured cron expressions until interrupted.
    Schedule,
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_pipeline(config: HarvestConfig, dry_run: bool) -> Result<HarvestPipeline> {
    let credentials = Credentials::from_env()?;
    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let sessions = session_store_for(&config, Some(Arc::clone(&fetcher)));
    let api_key = config
        .embedding_api_key
        .clone()
        .context("EMBEDDING_API_KEY (or OPENAI_API_KEY) is not set")?;
    let embedder = OpenAiEmbedder::new(
        fetcher,
        &config.embedding_base_url,
        config.embedding_model.clone(),
        api_key,
    )?;
    let store: Arc<dyn RecordStore> = if dry_run {
        Arc::new(MemoryRecordStore::new())
    } else {
        Arc::new(PgRecordStore::connect(&config.database_url).await?)
    };
    Ok(HarvestPipeline::new(
        config,
        credentials,
        sessions,
        store,
        Arc::new(embedder),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let pipeline = build_pipeline(config, dry_run).await?;
            let summary = pipeline.run_with_webdriver().await?;
            let s = &summary.stages;
            println!(
                "harvest complete: run_id={} tickets={} degraded={} written={} failed_batches={} reports={}",
                summary.run_id,
                s.unique_tickets,
                s.records_degraded,
                s.records_written,
                s.batches_failed,
                summary.reports_dir
            );
        }
        Commands::Login => {
            let credentials = Credentials::from_env()?;
            let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
            let sessions = session_store_for(&config, Some(fetcher));
            let driver = WebDriverBrowser::connect(&config.webdriver_config())
                .await
                .context("connecting to webdriver")?;
            let browser = Bounded::new(driver.clone(), config.browser_call_timeout);
            let result = AuthOrchestrator::new(&browser, &sessions, config.auth_config())
                .ensure_session(&credentials)
                .await;
            if let Err(err) = driver.close().await {
                warn!(error = %err, "closing webdriver session failed");
            }
            let outcome = result?;
            println!(
                "session ready: domain={} cookies={} reused={} iterations={} path={}",
                outcome.session.domain,
                outcome.session.cookies.len(),
                outcome.reused,
                outcome.iterations,
                sessions.path().display()
            );
        }
        Commands::CheckSession => {
            let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
            let sessions = session_store_for(&config, Some(fetcher));
            let stored = sessions.load().await;
            let fresh = sessions.is_fresh(stored.as_ref()).await;
            match stored {
                Some(session) => println!(
                    "session: domain={} captured_at={} cookies={} fresh={}",
                    session.domain,
                    session.captured_at,
                    session.cookies.len(),
                    fresh
                ),
                None => println!("session: none stored at {}", sessions.path().display()),
            }
        }
        Commands::Migrate => {
            let store = PgRecordStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            anyhow::ensure!(
                config.scheduler_enabled,
                "scheduler disabled; set HARVEST_SCHEDULER_ENABLED=true"
            );
            let pipeline = Arc::new(build_pipeline(config, false).await?);
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let markdown = report_recent_runs_markdown(&config.reports_dir, runs)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
