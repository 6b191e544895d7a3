mod app;
mod archive;
mod dag;
mod model;
mod monitor;
mod provider;
mod queue;
mod registry;
mod scheduler;
mod storage;
mod sync;
mod transform;
mod worker;

use clap::{Parser, Subcommand};
use model::{JobSpec, JobType, SyncMode};
use pipeline_core::{telemetry, Config};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::process;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[clap(name = "pipeline")]
#[clap(about = "Personal data ELT pipeline", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Run the worker: claim loops plus the cron trigger
    Worker {
        /// Override configured concurrency
        #[clap(long)]
        concurrency: Option<usize>,
    },

    /// Run one scheduler pass and exit
    Trigger,

    /// Submit a job
    Enqueue {
        /// Job type: sync, transform or archive
        #[clap(long)]
        job_type: JobType,

        #[clap(long)]
        source: Option<Uuid>,

        #[clap(long)]
        stream: Option<String>,

        /// Sync mode (sync jobs): full_refresh or incremental
        #[clap(long, default_value = "incremental")]
        mode: SyncMode,

        /// Transform name (transform jobs)
        #[clap(long)]
        transform: Option<String>,

        #[clap(long, default_value_t = 0)]
        priority: i32,

        /// Job ids this job must wait for (repeatable)
        #[clap(long = "depends-on")]
        depends_on: Vec<Uuid>,
    },

    /// Cancel a pending or running job (dependents cascade)
    Cancel { job_id: Uuid },

    /// Show one job as JSON
    Status { job_id: Uuid },

    /// Show a job's dependency readiness and direct dependents
    Deps { job_id: Uuid },

    /// List jobs, newest first
    Jobs {
        #[clap(long)]
        source: Option<Uuid>,

        /// Filter by status (pending, running, succeeded, failed, cancelled)
        #[clap(long)]
        status: Option<model::JobStatus>,

        #[clap(long, default_value_t = 20)]
        limit: i64,
    },

    /// Pipeline health: queue depth, stream freshness, checkpoints
    Overview,

    /// Everything needing operator attention
    FailedWork,

    /// Manage sources and streams
    #[clap(subcommand)]
    Source(SourceCommands),
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Register a source
    Add {
        name: String,

        #[clap(long)]
        provider: String,

        /// token, device, api_key or none
        #[clap(long, default_value = "token")]
        auth_type: String,
    },

    /// List sources
    List,

    /// Enable or disable a source
    SetActive {
        source_id: Uuid,

        #[clap(long, action = clap::ArgAction::Set)]
        active: bool,
    },

    /// Register or update a stream on a source
    AddStream {
        source_id: Uuid,
        stream_name: String,

        /// Cron expression, e.g. "*/15 * * * *"
        #[clap(long)]
        schedule: Option<String>,

        #[clap(long, action = clap::ArgAction::Set, default_value_t = true)]
        enabled: bool,
    },

    /// Issue a pairing code for a device source
    PairBegin { source_id: Uuid },

    /// Complete pairing from the device side
    PairComplete {
        code: String,

        #[clap(long)]
        device_id: String,

        #[clap(long)]
        device_token: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut config =
        Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            config.database.connect_timeout_secs,
        ))
        .idle_timeout(std::time::Duration::from_secs(
            config.database.idle_timeout_secs,
        ))
        .connect(&config.database.url)
        .await?;

    match cli.command {
        Commands::Migrate => {
            info!("Running database migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
            info!("Migrations completed successfully");
        }

        Commands::Worker { concurrency } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }

            let app = app::App::new(config, pool).await?;
            app.run_worker().await?;
        }

        Commands::Trigger => {
            let enqueued = scheduler::enqueue_due_streams(&pool, chrono::Utc::now()).await?;
            println!("{}", serde_json::json!({ "enqueued": enqueued }));
        }

        Commands::Enqueue {
            job_type,
            source,
            stream,
            mode,
            transform,
            priority,
            depends_on,
        } => {
            let spec = JobSpec {
                job_type,
                source_id: source,
                stream_name: stream,
                sync_mode: (job_type == JobType::Sync).then_some(mode),
                transform_name: transform,
                priority,
                parent_job_id: None,
                depends_on,
                metadata: serde_json::Value::Null,
            };

            let job = queue::enqueue(&pool, spec).await?;
            print_json(&job)?;
        }

        Commands::Cancel { job_id } => {
            queue::cancel(&pool, job_id).await?;
            let job = queue::get_job(&pool, job_id).await?;
            print_json(&job)?;
        }

        Commands::Status { job_id } => {
            let job = queue::get_job(&pool, job_id).await?;
            print_json(&serde_json::json!({
                "id": job.id,
                "status": job.status,
                "records_processed": job.records_processed,
                "error_message": job.error_message,
                "error_class": job.error_class,
            }))?;
        }

        Commands::Deps { job_id } => {
            let ready = dag::is_ready(&pool, job_id).await?;
            let dependents = dag::dependents_of(&pool, job_id).await?;
            print_json(&serde_json::json!({
                "job_id": job_id,
                "ready": ready,
                "dependents": dependents,
            }))?;
        }

        Commands::Jobs {
            source,
            status,
            limit,
        } => {
            let jobs = queue::query_jobs(&pool, source, status, limit).await?;
            print_json(&jobs)?;
        }

        Commands::Overview => {
            let status = monitor::status(&pool).await?;
            print_json(&status)?;
        }

        Commands::FailedWork => {
            let report = monitor::failed_work(&pool, 50).await?;
            print_json(&report)?;
            if !report.is_clean() {
                process::exit(2);
            }
        }

        Commands::Source(cmd) => run_source_command(&pool, cmd).await?,
    }

    telemetry::shutdown();
    Ok(())
}

async fn run_source_command(pool: &PgPool, cmd: SourceCommands) -> anyhow::Result<()> {
    match cmd {
        SourceCommands::Add {
            name,
            provider,
            auth_type,
        } => {
            let source = registry::create_source(pool, &name, &provider, &auth_type).await?;
            print_json(&source)?;
        }

        SourceCommands::List => {
            let sources = registry::list_sources(pool).await?;
            print_json(&sources)?;
        }

        SourceCommands::SetActive { source_id, active } => {
            registry::set_source_active(pool, source_id, active).await?;
            let source = registry::get_source(pool, source_id).await?;
            print_json(&source)?;
        }

        SourceCommands::AddStream {
            source_id,
            stream_name,
            schedule,
            enabled,
        } => {
            let stream = registry::upsert_stream(
                pool,
                source_id,
                &stream_name,
                schedule.as_deref(),
                enabled,
            )
            .await?;
            print_json(&stream)?;
        }

        SourceCommands::PairBegin { source_id } => {
            let code = registry::begin_device_pairing(pool, source_id).await?;
            print_json(&serde_json::json!({ "pairing_code": code }))?;
        }

        SourceCommands::PairComplete {
            code,
            device_id,
            device_token,
        } => {
            let source =
                registry::complete_device_pairing(pool, &code, &device_id, &device_token).await?;
            print_json(&source)?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
