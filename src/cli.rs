//! 命令行入口
//!
//! 子命令：sync / list / status / restart / pull / version

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{HostRole, SyncConfig};
use crate::domain::{ChangeSummary, RowChange, StageOutcome, SyncServiceRow, SyncTask, TaskMatrix};
use crate::services::machine::{self, MachineStatus};
use crate::services::render::RatholeRenderer;
use crate::services::ssh::SessionPool;
use crate::services::sync::{stages, ParsedServices, PipelineState, SyncMode, SyncPipeline};

/// rcm - sync Caddyfile services to rathole tunnels
#[derive(Parser, Debug)]
#[command(name = "rcm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/rcm/config.yaml, then ./config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Check pooled SSH sessions with a no-op command before reuse
    #[arg(long, global = true)]
    pub probe: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse, generate, upload and restart
    Sync {
        /// Stop after generating and print the preview
        #[arg(long)]
        dry_run: bool,
        /// Deploy the previewed configs without parsing again
        #[arg(long, requires = "dry_run")]
        commit: bool,
    },
    /// List services from the local (and remote) Caddyfile
    List,
    /// Show rathole / Caddy status on both machines
    Status,
    /// Restart services with post-restart verification
    Restart {
        #[arg(value_enum, default_value_t = RestartTarget::All)]
        target: RestartTarget,
    },
    /// Download the server Caddyfile over the local one
    Pull,
    /// Print version
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RestartTarget {
    Server,
    Client,
    Caddy,
    All,
}

impl RestartTarget {
    fn tasks(&self, config: &SyncConfig) -> Vec<SyncTask> {
        match self {
            RestartTarget::Server => vec![SyncTask::RestartServer],
            RestartTarget::Client => vec![SyncTask::RestartClient],
            RestartTarget::Caddy => vec![SyncTask::RestartCaddy],
            RestartTarget::All => stages::restart_tasks(config),
        }
    }
}

impl Cli {
    /// 执行子命令
    pub async fn run(self, pool: Arc<SessionPool>) -> Result<()> {
        if let Commands::Version = self.command {
            println!("rcm {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let (config, path) = SyncConfig::load(self.config.as_deref())
            .await
            .context("Failed to load config")?;
        tracing::debug!(path = %path.display(), "Loaded config");
        let config = Arc::new(config);

        match self.command {
            Commands::Sync { dry_run, commit } => sync(config, pool, dry_run, commit).await,
            Commands::List => list(&config, &pool).await,
            Commands::Status => status(&config, &pool).await,
            Commands::Restart { target } => restart(&config, &pool, target).await,
            Commands::Pull => pull(&config, &pool).await,
            Commands::Version => Ok(()),
        }
    }
}

async fn sync(
    config: Arc<SyncConfig>,
    pool: Arc<SessionPool>,
    dry_run: bool,
    commit: bool,
) -> Result<()> {
    let mut pipeline = SyncPipeline::new(config.clone(), pool, Arc::new(RatholeRenderer));

    if !dry_run {
        let result = pipeline.run(SyncMode::Full).await;
        print_matrix(pipeline.matrix());
        return finish(&pipeline, result);
    }

    let preview = pipeline.run(SyncMode::Preview).await;
    if let Some(plan) = pipeline.state().plan() {
        print_preview(&config, &plan.parsed);
        println!("--- server.toml ({}) ---", config.server.host);
        println!("{}", plan.artifacts.server);
        println!("--- client.toml ({}) ---", config.client.host);
        println!("{}", plan.artifacts.client);
    }
    if preview.is_err() || !commit {
        if preview.is_err() {
            print_matrix(pipeline.matrix());
        }
        return finish(&pipeline, preview);
    }

    let result = pipeline.commit().await;
    print_matrix(pipeline.matrix());
    finish(&pipeline, result)
}

fn finish(pipeline: &SyncPipeline, result: crate::error::SyncResult<()>) -> Result<()> {
    if let PipelineState::Failed { step, outcome } = pipeline.state() {
        println!();
        println!("Sync failed during {}:", step.as_str());
        print_failures(outcome);
    }
    result.map_err(|e| anyhow!(e))
}

async fn list(config: &SyncConfig, pool: &SessionPool) -> Result<()> {
    let (outcome, parsed) = stages::parse_stage(config, pool).await;
    let Some(parsed) = parsed else {
        print_failures(&outcome);
        return Err(first_error(&outcome));
    };
    print_preview(config, &parsed);
    Ok(())
}

async fn status(config: &SyncConfig, pool: &SessionPool) -> Result<()> {
    let statuses = machine::check_all(config, pool).await;
    for status in &statuses {
        print_machine(status);
    }
    if statuses.iter().all(MachineStatus::healthy) {
        Ok(())
    } else {
        Err(anyhow!("one or more services are not running"))
    }
}

async fn restart(config: &SyncConfig, pool: &SessionPool, target: RestartTarget) -> Result<()> {
    let tasks = target.tasks(config);
    let outcome = machine::restart_targets(config, pool, &tasks).await?;
    for result in &outcome.results {
        let mark = if result.succeeded() { "ok" } else { "FAILED" };
        println!("  {:<16} {}", result.task.label(), mark);
    }
    if outcome.is_success() {
        return Ok(());
    }
    print_failures(&outcome);
    Err(first_error(&outcome))
}

async fn pull(config: &SyncConfig, pool: &SessionPool) -> Result<()> {
    let parsed = machine::pull(config, pool).await?;
    println!(
        "Pulled {} from {} to {}",
        config.server.caddyfile, config.server.host, config.paths.caddyfile
    );
    for svc in &parsed.services {
        println!(
            "  {:<20} {:<24} :{:<6} {}",
            svc.name,
            svc.local_addr,
            svc.remote_port,
            svc.domains_display()
        );
    }
    Ok(())
}

fn first_error(outcome: &StageOutcome) -> anyhow::Error {
    match outcome.first_error().and_then(|r| r.error.clone()) {
        Some(e) => anyhow!(e),
        None => anyhow!("{} failed", outcome.step.as_str()),
    }
}

fn print_preview(config: &SyncConfig, parsed: &ParsedServices) {
    println!("Server: {}@{}", config.server.user, config.server.host);
    println!("Client: {}@{}", config.client.user, config.client.host);
    println!();
    print_rows(&parsed.rows);

    let ChangeSummary { new, update, removed } = parsed.summary();
    println!();
    if parsed.remote_checked {
        println!("{} new, {} update, {} removed", new, update, removed);
    } else {
        println!("{} services (remote Caddyfile not checked)", parsed.services.len());
    }

    if !parsed.diagnostics.is_empty() {
        println!();
        println!("Warnings:");
        for diag in &parsed.diagnostics {
            println!("  {}", diag);
        }
    }
}

fn print_rows(rows: &[SyncServiceRow]) {
    println!(
        "  {:<8} {:<20} {:<24} {:<7} {}",
        "CHANGE", "NAME", "LOCAL", "PORT", "DOMAIN"
    );
    for row in rows {
        let change = match row.change() {
            RowChange::New => "new",
            RowChange::Update => "update",
            RowChange::Removed => "removed",
        };
        println!(
            "  {:<8} {:<20} {:<24} {:<7} {}",
            change, row.name, row.local_addr, row.remote_port, row.domain
        );
    }
}

fn print_matrix(matrix: &TaskMatrix) {
    println!();
    for (task, status) in matrix.statuses() {
        println!("  {:<18} {:?}", task.label(), status);
    }
}

fn print_failures(outcome: &StageOutcome) {
    for result in outcome.errors() {
        let friendly = result.friendly.as_deref().unwrap_or(result.task.label());
        println!("  x {}", friendly);
        if let Some(err) = &result.error {
            println!("    {}", err);
            if let Some(hint) = err.hint() {
                println!("    hint: {}", hint);
            }
        }
    }
}

fn print_machine(status: &MachineStatus) {
    let role = if status.role == HostRole::Server.as_str() {
        "Server"
    } else {
        "Client"
    };
    println!("{} ({})", role, status.host);
    if !status.reachable {
        println!("  unreachable: {}", status.error.as_deref().unwrap_or("unknown error"));
        return;
    }
    for unit in &status.units {
        let mark = if unit.active { "ok" } else { "DOWN" };
        println!("  {:<16} {:<5} {}", unit.name, mark, unit.status);
    }
    if let Some(compose) = &status.compose {
        let mark = if compose.running { "ok" } else { "DOWN" };
        println!("  {:<16} {:<5} {}", "caddy", mark, compose.status);
    }
}
