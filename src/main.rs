mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands, DrainModeArg};

use cf_av::ToolRegistry;
use cf_core::config::Config;
use cf_core::{Caller, JobId};
use cf_worker::{dlq, producer, report, status, worker, DrainMode, WorkerContext};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "clipforge=trace,cf_worker=trace,cf_queue=debug,cf_av=debug,cf_blob=debug,cf_db=debug,cf_core=debug".to_string()
        } else {
            "clipforge=debug,cf_worker=debug,cf_queue=info,cf_av=info,cf_blob=info,cf_db=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Worker { concurrency, once } => {
            let mut config = Config::load_or_default(config_path);
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            let rt = tokio::runtime::Runtime::new()?;
            if once {
                rt.block_on(run_once(config))
            } else {
                tracing::info!("Starting clipforge workers");
                rt.block_on(cf_worker::start(config)).map_err(Into::into)
            }
        }
        Commands::Enqueue { owner, source_ref } => {
            let ctx = open(config_path)?;
            let rt = tokio::runtime::Runtime::new()?;
            let job_id = rt.block_on(producer::enqueue_job(&ctx, &owner, &source_ref))?;
            println!("{job_id}");
            Ok(())
        }
        Commands::Upload {
            owner,
            file,
            content_type,
        } => upload(config_path, &owner, &file, content_type),
        Commands::Status { owner, job_id, link } => {
            let ctx = open(config_path)?;
            let view = status::get_job_status(&ctx, &owner, &job_id)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            if link {
                let id: JobId = job_id.parse()?;
                let ttl = Duration::from_secs(ctx.config.storage.link_ttl_secs);
                let signed = status::download_link(&ctx, &owner, id, ttl)?;
                println!("Download: {}", signed.url);
                println!("Expires:  {}", signed.expires_at.to_rfc3339());
            }
            Ok(())
        }
        Commands::List { owner, json } => {
            let ctx = open(config_path)?;
            print_jobs(&status::list_jobs(&ctx, &owner)?, json)
        }
        Commands::Jobs { json } => {
            let ctx = open(config_path)?;
            print_jobs(&status::admin_list_jobs(&ctx, &Caller::Admin)?, json)
        }
        Commands::Requeue { owner, job_id } => {
            let ctx = open(config_path)?;
            let id: JobId = job_id.parse()?;
            let rt = tokio::runtime::Runtime::new()?;
            let job = rt.block_on(producer::requeue_job(&ctx, &owner, id))?;
            println!("Job {} is {}", job.job_id, job.state);
            Ok(())
        }
        Commands::Delete { owner, job_id } => {
            let ctx = open(config_path)?;
            let id: JobId = job_id.parse()?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(producer::delete_job(&ctx, &Caller::Admin, &owner, id))?;
            println!("Deleted job {id}");
            Ok(())
        }
        Commands::DrainDlq { batch, mode, all } => {
            let ctx = open(config_path)?;
            let mode = match mode {
                DrainModeArg::Inspect => DrainMode::Inspect,
                DrainModeArg::Requeue => DrainMode::Requeue,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(drain_dlq(&ctx, batch, mode, all))
        }
        Commands::DeadLetters { limit } => {
            let ctx = open(config_path)?;
            for record in dlq::recent_dead_letters(&ctx, limit)? {
                println!(
                    "{}  {}  job={}  receives={}  {}",
                    record.recorded_at,
                    record.message_id,
                    record
                        .job_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".into()),
                    record.receive_count,
                    record.action
                );
            }
            Ok(())
        }
        Commands::Report { json } => {
            let ctx = open(config_path)?;
            let rt = tokio::runtime::Runtime::new()?;
            let summary = rt.block_on(report::summarize(&ctx))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Jobs: {}", summary.total_jobs);
                for (state, n) in &summary.jobs_by_state {
                    println!("  {state:<11} {n}");
                }
                for q in [&summary.work_queue, &summary.dead_letter_queue] {
                    println!("Queue {}: {} visible, {} in flight", q.name, q.visible, q.in_flight);
                }
                println!("Dead-letter records: {}", summary.dead_letter_records);
            }
            Ok(())
        }
        Commands::CheckTools => check_tools(config_path),
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(cli.config);
            validate_config(path.as_deref())
        }
    }
}

fn open(config_path: Option<&Path>) -> Result<WorkerContext> {
    let config = Config::load_or_default(config_path);
    WorkerContext::open(config).context("failed to open clipforge state")
}

async fn run_once(config: Config) -> Result<()> {
    let ctx = WorkerContext::open(config)?;
    let outcomes = worker::run_once(&ctx).await?;
    if outcomes.is_empty() {
        println!("No messages received");
    }
    for outcome in &outcomes {
        println!("{outcome:?}");
    }
    Ok(())
}

fn upload(
    config_path: Option<&Path>,
    owner: &str,
    file: &Path,
    content_type: Option<String>,
) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }
    let content_type = content_type.unwrap_or_else(|| guess_content_type(file).to_string());
    let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let ctx = open(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let job_id = rt.block_on(producer::upload_and_enqueue(
        &ctx,
        owner,
        &file_name,
        &content_type,
        Bytes::from(data),
    ))?;
    println!("{job_id}");
    Ok(())
}

fn guess_content_type(file: &Path) -> &'static str {
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mpg" | "mpeg" => "video/mpeg",
        _ => "application/octet-stream",
    }
}

async fn drain_dlq(ctx: &WorkerContext, batch: u32, mode: DrainMode, all: bool) -> Result<()> {
    let mut total = dlq::DrainReport::default();
    loop {
        let pass = dlq::drain(ctx, batch, mode).await?;
        total.received += pass.received;
        total.recorded += pass.recorded;
        total.requeued += pass.requeued;
        total.retained += pass.retained;
        if !all || pass.received == 0 || pass.recorded == 0 {
            break;
        }
    }
    println!(
        "Received {}, recorded {}, requeued {}, left in place {}",
        total.received, total.recorded, total.requeued, total.retained
    );
    Ok(())
}

fn print_jobs(jobs: &[cf_db::models::Job], json: bool) -> Result<()> {
    if json {
        let views: Vec<_> = jobs.iter().map(|j| j.status_view()).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs");
    }
    for job in jobs {
        println!(
            "{}  {}  {:<10}  attempts={}  {}",
            job.created_at,
            job.job_id,
            job.state,
            job.attempt_count,
            job.output_ref.as_deref().unwrap_or(&job.source_ref)
        );
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Workers need ffmpeg to transcode.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for warning in &warnings {
            println!("! {warning}");
        }
    }
    println!("  Database: {}", config.database.path.display());
    println!(
        "  Queues: {} -> {} after {} receives",
        config.queue.work_queue, config.queue.dead_letter_queue, config.queue.max_receive_count
    );
    println!("  Visibility timeout: {}s", config.queue.visibility_timeout_secs);
    println!(
        "  Jobs settle within: {}s",
        config.queue.resolution_bound().as_secs()
    );
    println!("  Workers: {}", config.worker.concurrency);
    println!("  Storage: {}", config.storage.root.display());
    println!("  Default preset: {}", config.transcode.default_preset);

    Ok(())
}
