//! Command-line interface for shortforge.
//!
//! Provides commands for producing one video, running a batch of jobs,
//! checking job status, listing jobs, and inspecting themes and
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::core::{Backends, JobStore, Orchestrator};
use crate::domain::{ArtifactLocation, EventType, JobRequest, JobResult, JobStatus};
use crate::prompts::PromptResolver;
use crate::themes::ThemeRegistry;

/// shortforge - staged production pipeline for short vertical videos
#[derive(Parser, Debug)]
#[command(name = "shortforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Produce one video
    Run {
        /// Theme identifier (prefix with builtin: to skip user overrides)
        #[arg(short, long, default_value = "curiosidades")]
        theme: String,

        /// Language code
        #[arg(short, long, default_value = "es")]
        language: String,

        /// Explicit topic (sampled from the theme's pool if omitted)
        #[arg(long)]
        topic: Option<String>,

        /// Content type (e.g. TOP_5)
        #[arg(short, long)]
        content_type: Option<String>,

        /// Upload the finished video
        #[arg(short, long)]
        publish: bool,

        /// Print the job result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Produce several videos concurrently
    Batch {
        /// YAML or JSON file with a list of job requests
        #[arg(short, long, conflicts_with = "count")]
        file: Option<PathBuf>,

        /// Theme for generated requests
        #[arg(short, long, default_value = "curiosidades")]
        theme: String,

        /// Language for generated requests
        #[arg(short, long, default_value = "es")]
        language: String,

        /// Number of sampled-topic jobs to run
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Upload finished videos
        #[arg(short, long)]
        publish: bool,

        /// Override the configured concurrency cap
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Check the status of a job
    Status {
        /// Job ID (UUID)
        job_id: String,
    },

    /// List recent jobs
    Jobs {
        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List available themes and their locales
    Themes,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self, mut config: Config) -> Result<()> {
        match self.command {
            Commands::Run {
                theme,
                language,
                topic,
                content_type,
                publish,
                json,
            } => {
                let mut request = JobRequest::new(theme, language).with_publish(publish);
                if let Some(topic) = topic {
                    request = request.with_topic(topic);
                }
                if let Some(content_type) = content_type {
                    request = request.with_content_type(content_type);
                }
                run_job(&config, request, json).await
            }
            Commands::Batch {
                file,
                theme,
                language,
                count,
                publish,
                max_concurrent,
            } => {
                if let Some(max) = max_concurrent {
                    config.batch.max_concurrent_jobs = max;
                }
                let requests = match file {
                    Some(path) => load_requests(&path)?,
                    None => (0..count.unwrap_or(1))
                        .map(|_| JobRequest::new(theme.clone(), language.clone()).with_publish(publish))
                        .collect(),
                };
                run_batch(&config, requests).await
            }
            Commands::Status { job_id } => show_status(&config, &job_id).await,
            Commands::Jobs { limit } => list_jobs(&config, limit).await,
            Commands::Themes => list_themes(&config),
            Commands::Config => show_config(&config),
        }
    }
}

/// Build the orchestrator from configuration
fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let registry = ThemeRegistry::load(config.themes_dir.as_deref()).context("Failed to load themes")?;
    let prompts = PromptResolver::load(config.prompts_dir.as_deref(), &config.prompts)
        .context("Failed to load prompt templates")?;

    Ok(Orchestrator::new(config, registry, prompts, Backends::from_config(config)))
}

/// Cancel jobs between stages on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            child.cancel();
        }
    });
    token
}

async fn run_job(config: &Config, request: JobRequest, json: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let cancel = cancel_on_ctrl_c();

    let result = orchestrator.run_job(request, &cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if result.status == JobStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_batch(config: &Config, requests: Vec<JobRequest>) -> Result<()> {
    if requests.is_empty() {
        anyhow::bail!("No job requests given");
    }

    let orchestrator = Arc::new(build_orchestrator(config)?);
    let cancel = cancel_on_ctrl_c();
    let results = orchestrator.run_batch(requests, &cancel).await;

    println!("{:<38} {:<10} {:<14} {}", "JOB ID", "STATUS", "THEME", "TOPIC");
    println!("{}", "-".repeat(90));
    for result in &results {
        println!(
            "{:<38} {:<10} {:<14} {}",
            result.job_id, result.status.as_str(), result.theme, result.topic
        );
    }

    let done = results.iter().filter(|r| r.is_success()).count();
    println!("\n{}/{} jobs done", done, results.len());

    if results.iter().any(|r| r.status == JobStatus::Failed) {
        std::process::exit(1);
    }
    Ok(())
}

fn load_requests(path: &PathBuf) -> Result<Vec<JobRequest>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {}", path.display()))?;

    // JSON is valid YAML
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse batch file: {}", path.display()))
}

fn print_result(result: &JobResult) {
    println!("Job ID:   {}", result.job_id);
    println!("Status:   {}", result.status);
    println!("Theme:    {} ({})", result.theme, result.language);
    println!("Type:     {}", result.content_type);
    println!("Topic:    {}", result.topic);

    if let Some(script) = &result.script {
        println!(
            "Script:   \"{}\" ({} segments, ~{:.0}s)",
            script.title,
            script.segments.len(),
            script.estimated_duration().as_secs_f64()
        );
    }
    if let Some(audio) = &result.audio {
        println!("Audio:    {} ({:.1}s)", audio.path.display(), audio.duration.as_secs_f64());
    }
    if let Some(video) = &result.video {
        println!("Video:    {} ({})", video.path.display(), video.resolution);
        println!("Thumb:    {}", video.thumbnail.display());
    }
    if let Some(published) = &result.publish {
        println!("URL:      {} ({})", published.url, published.visibility.as_str());
    }
    if let Some(failure) = &result.failure {
        println!();
        println!(
            "Failed at '{}' after {} attempt(s) [{}]: {}",
            failure.stage, failure.attempts, failure.code, failure.message
        );
        if let Some(last) = &result.last_artifact {
            println!("Last artifact: {}", describe_artifact(last));
        }
    }
}

fn describe_artifact(location: &ArtifactLocation) -> String {
    match location {
        ArtifactLocation::Script { path } => format!("script {}", path.display()),
        ArtifactLocation::Audio { path } => format!("audio {}", path.display()),
        ArtifactLocation::Video { path, .. } => format!("video {}", path.display()),
        ArtifactLocation::Published { url, .. } => format!("published {}", url),
    }
}

/// Show the status of a job
async fn show_status(config: &Config, job_id_str: &str) -> Result<()> {
    let job_id = Uuid::parse_str(job_id_str)
        .with_context(|| format!("Invalid job ID: {}", job_id_str))?;

    let orchestrator = build_orchestrator(config)?;
    let record = orchestrator
        .get_job_status(job_id)
        .await?
        .with_context(|| format!("Job {} not found", job_id))?;

    println!("Job ID:  {}", record.id);
    println!("Job:     {}", record.summary);
    println!("Status:  {}", record.status);
    println!("Started: {}", record.started_at);
    if let Some(finished) = record.finished_at {
        println!("Finished: {}", finished);
    }
    if record.credential_refreshes > 0 {
        println!("Credential refreshes: {}", record.credential_refreshes);
    }
    println!("\nStages:");
    for stage in crate::domain::Stage::ALL {
        if let Some(outcome) = record.stages.get(&stage) {
            let attempts = record.attempts.get(&stage).copied().unwrap_or(0);
            println!("  {:<13} {:?} ({} attempt(s))", stage.as_str(), outcome, attempts);
        }
    }
    if let Some(error) = &record.error {
        println!("\nError: {}", error);
    }

    if let Some(store) = JobStore::existing(&config.jobs_dir(), job_id) {
        if let Some(retry) = store.last_event_of_type(EventType::StageRetrying).await? {
            let stage = retry.stage.map(|s| s.as_str()).unwrap_or("-");
            println!(
                "\nLast retry: {} attempt {} ({})",
                stage,
                retry.attempt.unwrap_or(0),
                retry.error.as_deref().unwrap_or("no error recorded")
            );
        }
    }

    Ok(())
}

/// List recent jobs
async fn list_jobs(config: &Config, limit: usize) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let jobs = orchestrator.list_jobs(limit).await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!("{:<38} {:<13} {:<25} {}", "JOB ID", "STATUS", "STARTED", "JOB");
    println!("{}", "-".repeat(100));

    for job in jobs {
        println!(
            "{:<38} {:<13} {:<25} {}",
            job.id,
            job.status.as_str(),
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            job.summary
        );
    }

    Ok(())
}

fn list_themes(config: &Config) -> Result<()> {
    let registry = ThemeRegistry::load(config.themes_dir.as_deref()).context("Failed to load themes")?;

    for id in registry.theme_ids() {
        let Some(theme) = registry.get(id) else {
            continue;
        };
        println!("{}", id);
        for (language, locale) in &theme.locales {
            let default = theme.default_locale.as_deref() == Some(language.as_str());
            println!(
                "  {}{:<3} {:<24} types: {}  topics: {}",
                if default { "*" } else { " " },
                language,
                locale.channel_name,
                locale.content_types.join(", "),
                locale.topics.len()
            );
        }
    }

    if !registry.sources().is_empty() {
        println!("\nOverrides:");
        for source in registry.sources() {
            println!("  {}", source.display());
        }
    }

    Ok(())
}

fn show_config(cfg: &Config) -> Result<()> {
    println!("shortforge configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Output:              {}", cfg.output_dir.display());
    println!("  Jobs:                {}", cfg.jobs_dir().display());
    println!("  Publish ledger:      {}", cfg.publish_ledger_path().display());
    let optional = |p: &Option<PathBuf>| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in only)".to_string())
    };
    println!("  Themes:              {}", optional(&cfg.themes_dir));
    println!("  Prompts:             {}", optional(&cfg.prompts_dir));
    println!();
    println!("Generation:");
    println!("  Backend:             {}", cfg.generation.backend.kind());
    println!("  Words per minute:    {}", cfg.generation.words_per_minute);
    println!("  Regenerations:       {}", cfg.generation.max_regenerations);
    println!();
    println!("Visual:");
    println!("  Resolution:          {} @ {}fps", cfg.visual.resolution, cfg.visual.fps);
    println!(
        "  Image source key:    {}",
        if cfg.visual.pexels_api_key.is_some() { "set" } else { "missing" }
    );
    println!();
    println!("Publish:");
    println!("  Visibility:          {}", cfg.publish.visibility.as_str());
    println!(
        "  Credentials:         {}",
        if cfg.publish.refresh_token.is_some() { "configured" } else { "missing" }
    );
    println!();
    println!("Stages:");
    for stage in crate::domain::Stage::ALL {
        let limits = cfg.stages.for_stage(stage);
        println!(
            "  {:<13} timeout {}s, {} attempt(s)",
            stage.as_str(),
            limits.timeout_seconds,
            limits.retry.max_attempts
        );
    }
    println!();
    println!("Batch: {} concurrent job(s)", cfg.batch.max_concurrent_jobs);

    Ok(())
}
