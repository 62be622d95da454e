use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use govscout_core::RunState;
use govscout_storage::PgStore;
use govscout_sync::{
    maybe_build_scheduler, BatchSelection, JobState, PipelineOptions, PipelineResponse, Services,
    SyncConfig,
};
use govscout_web::AppState;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "govscout")]
#[command(about = "Government contract opportunity scout")]
struct Cli {
    /// Run against JSON fixtures and an in-memory store instead of the live
    /// services and Postgres.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass now.
    Ingest,
    /// Push opportunities through scrape, enrich and analyze.
    Pipeline(PipelineArgs),
    /// Show the ingestion run record.
    Status {
        #[arg(long, default_value_t = 0)]
        history: usize,
    },
    ResolveOutage,
    DeclareOutage {
        #[arg(long)]
        reason: String,
    },
    /// Serve the JSON API, with the scheduler when enabled.
    Serve,
    Migrate,
    /// Run the cron scheduler in the foreground.
    Schedule,
}

#[derive(Debug, Args)]
struct PipelineArgs {
    #[arg(long = "id", value_delimiter = ',')]
    ids: Vec<Uuid>,
    #[arg(long, conflicts_with = "ids")]
    auto_select: bool,
    #[arg(long, default_value_t = 25)]
    limit: usize,
    /// Requeue items interrupted mid-stage and process them.
    #[arg(long, conflicts_with_all = ["ids", "auto_select"])]
    resume: bool,
    #[arg(long)]
    force_scrape: bool,
    #[arg(long)]
    force_enrich: bool,
    #[arg(long)]
    force_analyze: bool,
}

impl PipelineArgs {
    fn options(&self) -> PipelineOptions {
        PipelineOptions {
            force_scrape: self.force_scrape,
            force_enrich: self.force_enrich,
            force_analyze: self.force_analyze,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("govscout=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Ingest => {
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            let summary = services.ingestion.run_once(Utc::now()).await?;
            print_json(&summary)?;
            if summary.state == RunState::Outage {
                bail!("ingestion stopped: listing source outage");
            }
        }
        Commands::Pipeline(args) => {
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            let response = if args.resume {
                services.pipeline.resume_interrupted().await?
            } else {
                let selection = if args.auto_select {
                    BatchSelection::AutoSelect { limit: args.limit }
                } else if !args.ids.is_empty() {
                    BatchSelection::Ids(args.ids.clone())
                } else {
                    bail!("pass --id, --auto-select or --resume");
                };
                services.pipeline.run(selection, args.options()).await?
            };
            match response {
                PipelineResponse::Completed(summary) => print_json(&summary)?,
                PipelineResponse::Queued { job_id, queued } => {
                    info!(job_id = %job_id, queued, "waiting for queued pipeline job");
                    wait_for_job(&services, job_id).await?;
                }
            }
        }
        Commands::Status { history } => {
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            print_json(&services.tracker.status().await?)?;
            if history > 0 {
                print_json(&services.tracker.history(history).await?)?;
            }
        }
        Commands::ResolveOutage => {
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            print_json(&services.tracker.resolve_outage(Utc::now()).await?)?;
        }
        Commands::DeclareOutage { reason } => {
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            print_json(&services.tracker.declare_outage(&reason, Utc::now()).await?)?;
        }
        Commands::Serve => {
            let port = config.web_port;
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            let scheduler =
                maybe_build_scheduler(&services.config, services.ingestion.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            govscout_web::serve(AppState::new(services), port).await?;
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let services = build_services(config, cli.fixtures.as_ref()).await?;
            let Some(mut sched) =
                maybe_build_scheduler(&services.config, services.ingestion.clone()).await?
            else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %services.config.ingest_cron_1,
                cron_2 = %services.config.ingest_cron_2,
                "scheduler running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn build_services(config: SyncConfig, fixtures: Option<&PathBuf>) -> Result<Services> {
    match fixtures {
        Some(dir) => Services::from_fixtures(config, dir).await,
        None => Services::live(config).await,
    }
}

async fn wait_for_job(services: &Services, job_id: Uuid) -> Result<()> {
    loop {
        let record = services
            .pipeline
            .job(job_id)
            .await
            .with_context(|| format!("pipeline job {job_id} disappeared"))?;
        if record.state == JobState::Completed {
            return print_json(&record);
        }
        tokio::time::sleep(JOB_POLL_INTERVAL).await;
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
