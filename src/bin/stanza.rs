//! stanza CLI: operator interface to the translation job engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use stanza_rs::config::Config;
use stanza_rs::db::Db;
use stanza_rs::engine::{Backends, Collaborators, DriveOutcome, Engine, compute_processing_status};
use stanza_rs::llm::anthropic::AnthropicCollaborator;
use stanza_rs::model::{JobId, JobStatus, Mode, NewJob, TranslationContext, split_stanzas};
use stanza_rs::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "stanza", about = "Background poem translation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translation job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Create a job from a text file; stanzas are separated by blank lines
    Create {
        file: PathBuf,
        #[arg(long)]
        source_lang: String,
        #[arg(long)]
        target_lang: String,
        /// conservative | balanced | adventurous
        #[arg(long, default_value = "balanced")]
        mode: Mode,
        #[arg(long)]
        title: Option<String>,
        /// Free-form guidance for the translator
        #[arg(long)]
        notes: Option<String>,
        /// Override the configured chunk concurrency
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Run a single tick
    Advance {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Tick until the job is finished (Ctrl-C stops after the current tick)
    Run {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Show job progress and per-line state
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
        /// Print every variant text
        #[arg(long)]
        variants: bool,
    },
    /// List jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<JobStatus>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(
        TelemetryConfig::new("stanza")
            .endpoint(config.otel_endpoint.clone())
            .log_level(config.log_level.clone()),
    )?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let Command::Job { action } = cli.command;
    if let JobAction::List { status, limit } = action {
        return cmd_job_list(&db, status, limit).await;
    }

    let engine = build_engine(&config, db.clone())?;
    match action {
        JobAction::Create {
            file,
            source_lang,
            target_lang,
            mode,
            title,
            notes,
            max_concurrent,
        } => {
            let mut context = TranslationContext::new(source_lang, target_lang, mode);
            if let Some(title) = title {
                context = context.title(title);
            }
            if let Some(notes) = notes {
                context = context.notes(notes);
            }
            cmd_job_create(&engine, file, context, max_concurrent).await
        }
        JobAction::Advance { id } => {
            let id = resolve_job_id(&db, &id).await?;
            let tick = engine.advance(id).await?;
            println!("{}", serde_json::to_string_pretty(&tick)?);
            Ok(())
        }
        JobAction::Run { id } => {
            let id = resolve_job_id(&db, &id).await?;
            cmd_job_run(&engine, id).await
        }
        JobAction::Show { id, variants } => {
            let id = resolve_job_id(&db, &id).await?;
            cmd_job_show(&engine, id, variants).await
        }
        JobAction::List { .. } => Ok(()),
    }
}

fn build_engine(config: &Config, db: Db) -> anyhow::Result<Engine> {
    let engine_config = config.engine()?;
    let collaborator = AnthropicCollaborator::new(
        &config.anthropic_api_key,
        config.model.clone(),
        engine_config.processing.variants_per_line,
    )?;
    let db = Arc::new(db);
    let backends = Backends {
        jobs: db.clone(),
        locks: db.clone(),
        recipes: db,
    };
    Ok(Engine::new(
        backends,
        Collaborators::shared(Arc::new(collaborator)),
        engine_config,
    )?)
}

async fn cmd_job_create(
    engine: &Engine,
    file: PathBuf,
    context: TranslationContext,
    max_concurrent: Option<usize>,
) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&file).await?;
    let stanzas = split_stanzas(&text);
    if stanzas.is_empty() {
        anyhow::bail!("{} contains no lines", file.display());
    }

    let mut new = NewJob::new(context, stanzas);
    if let Some(n) = max_concurrent {
        new = new.max_concurrent_chunks(n);
    }
    let job = engine.create_job(new).await?;
    println!(
        "Created: {} ({} chunks, {} lines)",
        job.id,
        job.chunks.len(),
        job.total_lines()
    );
    Ok(())
}

async fn cmd_job_run(engine: &Engine, id: JobId) -> anyhow::Result<()> {
    let driver = engine.driver();
    let stopper = driver.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    match driver.run_until_complete(id).await? {
        DriveOutcome::Finished(tick) => {
            println!("Finished: {} (status: {}, version {})", id, tick.status, tick.version);
        }
        DriveOutcome::Stopped => println!("Stopped: {id}"),
    }
    Ok(())
}

async fn cmd_job_show(engine: &Engine, id: JobId, show_variants: bool) -> anyhow::Result<()> {
    let job = engine.get_job(id).await?;
    let status = compute_processing_status(&job);

    println!("ID:         {}", job.id);
    println!("Status:     {}", job.status);
    println!("Version:    {}", job.version);
    println!(
        "Languages:  {} -> {} ({})",
        job.context.source_language, job.context.target_language, job.context.mode
    );
    if let Some(ref title) = job.context.title {
        println!("Title:      {title}");
    }
    println!(
        "Lines:      {}/{} processed, {} failed",
        status.lines_processed, status.total_lines, status.lines_failed
    );
    println!(
        "Chunks:     {} pending, {} queued, {} processing, {} completed, {} failed",
        status.pending, status.queued, status.processing, status.completed, status.failed
    );
    if status.incomplete > 0 {
        println!("Warning:    {} chunk(s) marked finished with missing lines", status.incomplete);
    }
    println!("Queue:      {:?}", job.queue);
    println!("Active:     {:?}", job.active);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(done) = job.completed_at {
        println!("Completed:  {done}");
    }

    for chunk in job.chunks.values() {
        println!(
            "\n[chunk {}] {} ({}/{} lines, retries {}/{})",
            chunk.index,
            chunk.status,
            chunk.lines_processed,
            chunk.total_lines,
            chunk.retries,
            chunk.max_retries
        );
        for source in &chunk.source {
            let Some(line) = chunk.line(source.line_number) else {
                println!("  {:>4}  {:<10}  {}", source.line_number, "-", source.text);
                continue;
            };
            let flag = match &line.quality {
                Some(q) if q.still_failing => " (similar)",
                Some(q) if q.regenerated => " (regenerated)",
                _ => "",
            };
            println!(
                "  {:>4}  {:<10}  {}{flag}",
                source.line_number, line.translation_status, source.text
            );
            if let Some(ref err) = line.last_error {
                println!("        error: {err}");
            }
            if show_variants {
                for v in &line.variants {
                    println!("        {}: {}", v.label, v.text);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_job_list(db: &Db, status: Option<JobStatus>, limit: i64) -> anyhow::Result<()> {
    let jobs = db.list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("{:<8}  {:<10}  {:<7}  {:<16}  UPDATED", "ID", "STATUS", "VERSION", "CREATED");
    println!("{}", "-".repeat(64));
    for job in &jobs {
        println!(
            "{:<8}  {:<10}  {:<7}  {:<16}  {}",
            job.id.short(),
            job.status,
            job.version,
            job.created_at.format("%Y-%m-%d %H:%M"),
            job.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

/// Accept a full UUID or a unique prefix of a recent job.
async fn resolve_job_id(db: &Db, id: &str) -> anyhow::Result<JobId> {
    if id.len() >= 36 {
        return Ok(id.parse()?);
    }
    let jobs = db.list_jobs(None, 200).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|j| j.id.to_string().starts_with(id))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id}', be more specific"),
    }
}
