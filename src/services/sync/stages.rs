//! 同步阶段执行
//!
//! 每个阶段内的任务并发执行，全部完成后按启动顺序汇总结果。
//! 任何任务失败都不会中断同阶段的其他任务。

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::{HostRole, SyncConfig};
use crate::domain::{merge_rows, StageOutcome, SyncStep, SyncTask, TaskResult};
use crate::error::{SyncError, SyncResult};
use crate::parser::{self, ParsedDocument};
use crate::services::render::{ArtifactRenderer, RenderedArtifacts};
use crate::services::ssh::{RemoteSession, SessionPool};

use super::state::{ParsedServices, SyncPlan};

/// 服务端 rathole systemd 单元
pub const SERVER_UNIT: &str = "rathole-server";
/// 客户端 rathole systemd 单元
pub const CLIENT_UNIT: &str = "rathole-client";

/// 远程配置默认路径
pub const DEFAULT_SERVER_CONFIG: &str = "/etc/rathole/server.toml";
pub const DEFAULT_CLIENT_CONFIG: &str = "/etc/rathole/client.toml";

/// 任务失败：原始错误加一句面向用户的说明
struct TaskFailure {
    error: SyncError,
    friendly: String,
}

impl TaskFailure {
    fn new(error: SyncError, friendly: impl Into<String>) -> Self {
        Self {
            error,
            friendly: friendly.into(),
        }
    }
}

/// 给结果附加说明
trait Friendly<T> {
    fn friendly(self, message: impl Into<String>) -> Result<T, TaskFailure>;
}

impl<T> Friendly<T> for SyncResult<T> {
    fn friendly(self, message: impl Into<String>) -> Result<T, TaskFailure> {
        self.map_err(|e| TaskFailure::new(e, message))
    }
}

/// 执行单个任务并记录耗时
async fn run_task<F>(task: SyncTask, work: F) -> TaskResult
where
    F: Future<Output = Result<(), TaskFailure>>,
{
    let started_at = Utc::now();
    debug!(task = ?task, "Task started");

    match work.await {
        Ok(()) => {
            let result = TaskResult::ok(task, started_at);
            info!(task = ?task, duration_ms = result.duration_ms, "Task completed");
            result
        }
        Err(failure) => {
            error!(
                task = ?task,
                kind = failure.error.kind(),
                error = %failure.error,
                "{}", failure.friendly
            );
            TaskResult::failed(task, started_at, failure.error, failure.friendly)
        }
    }
}

async fn connect(
    config: &SyncConfig,
    pool: &SessionPool,
    role: HostRole,
) -> Result<Arc<RemoteSession>, TaskFailure> {
    let target = config.target(role);
    pool.acquire(&target)
        .await
        .friendly(format!("Couldn't connect to {} ({})", role.as_str(), target.host))
}

/// 远程配置路径，未配置时使用默认值
pub fn remote_config_path(config: &SyncConfig, role: HostRole) -> &str {
    let (configured, default) = match role {
        HostRole::Server => (&config.server.rathole_config, DEFAULT_SERVER_CONFIG),
        HostRole::Client => (&config.client.rathole_config, DEFAULT_CLIENT_CONFIG),
    };
    if configured.is_empty() {
        default
    } else {
        configured
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// 解析本地文档，同时（如已配置）读取远程文档
///
/// 远程失败只记录警告
pub async fn parse_stage(
    config: &SyncConfig,
    pool: &SessionPool,
) -> (StageOutcome, Option<ParsedServices>) {
    let started_at = Utc::now();

    let (local, remote) = tokio::join!(parse_local(config), fetch_remote_services(config, pool));

    let (result, parsed) = match local {
        Ok((source, document)) => {
            let remote_checked = remote.is_some();
            let remote_services = remote.map(|d| d.services).unwrap_or_default();
            let rows = merge_rows(&document.services, &remote_services);
            for diag in &document.diagnostics {
                warn!("Caddyfile {}", diag);
            }
            info!(
                services = document.services.len(),
                rows = rows.len(),
                remote = remote_checked,
                "Parsed services"
            );
            let parsed = ParsedServices {
                services: document.services,
                rows,
                diagnostics: document.diagnostics,
                remote_checked,
                source,
            };
            (TaskResult::ok(SyncTask::Parse, started_at), Some(parsed))
        }
        Err(failure) => {
            error!(error = %failure.error, "{}", failure.friendly);
            (
                TaskResult::failed(SyncTask::Parse, started_at, failure.error, failure.friendly),
                None,
            )
        }
    };

    (StageOutcome::new(SyncStep::Parsing, vec![result]), parsed)
}

async fn parse_local(config: &SyncConfig) -> Result<(String, ParsedDocument), TaskFailure> {
    let path = config
        .require_caddyfile()
        .friendly("Couldn't parse local Caddyfile")?;
    parser::parse_file(path)
        .await
        .friendly("Couldn't read local Caddyfile")
}

/// 读取服务器上的 Caddyfile；未配置或失败时返回 None
pub async fn fetch_remote_services(
    config: &SyncConfig,
    pool: &SessionPool,
) -> Option<ParsedDocument> {
    if config.server.caddyfile.is_empty() {
        return None;
    }

    let fetch = async {
        let session = pool.acquire(&config.target(HostRole::Server)).await?;
        session.download_content(&config.server.caddyfile).await
    };

    match fetch.await {
        Ok(bytes) => Some(parser::parse(&String::from_utf8_lossy(&bytes))),
        Err(e) => {
            warn!(host = %config.server.host, error = %e, "Remote Caddyfile unavailable, treating remote services as absent");
            None
        }
    }
}

// ============================================================================
// Generating
// ============================================================================

/// 为两台机器渲染配置
pub fn generate_stage(
    config: &SyncConfig,
    renderer: &dyn ArtifactRenderer,
    parsed: &ParsedServices,
) -> (StageOutcome, Option<RenderedArtifacts>) {
    let started_at = Utc::now();

    let rendered = renderer
        .render_server(config, &parsed.services)
        .friendly("Couldn't generate server config")
        .and_then(|server| {
            renderer
                .render_client(config, &parsed.services)
                .friendly("Couldn't generate client config")
                .map(|client| RenderedArtifacts { server, client })
        });

    let (result, artifacts) = match rendered {
        Ok(artifacts) => {
            info!(
                server_bytes = artifacts.server.len(),
                client_bytes = artifacts.client.len(),
                "Generated rathole configs"
            );
            (TaskResult::ok(SyncTask::Generate, started_at), Some(artifacts))
        }
        Err(failure) => {
            error!(error = %failure.error, "{}", failure.friendly);
            (
                TaskResult::failed(SyncTask::Generate, started_at, failure.error, failure.friendly),
                None,
            )
        }
    };

    (StageOutcome::new(SyncStep::Generating, vec![result]), artifacts)
}

// ============================================================================
// Uploading
// ============================================================================

/// 上传任务
pub fn upload_tasks() -> Vec<SyncTask> {
    vec![SyncTask::UploadServer, SyncTask::UploadClient]
}

/// 每台机器一个并发上传任务
///
/// 服务器同时收到解析时的 Caddyfile 快照（如配置了远程路径）
pub async fn upload_stage(config: &SyncConfig, pool: &SessionPool, plan: &SyncPlan) -> StageOutcome {
    let tasks = upload_tasks();
    let results = join_all(
        tasks
            .iter()
            .map(|task| run_task(*task, upload_one(config, pool, plan, *task))),
    )
    .await;
    StageOutcome::new(SyncStep::Uploading, results)
}

async fn upload_one(
    config: &SyncConfig,
    pool: &SessionPool,
    plan: &SyncPlan,
    task: SyncTask,
) -> Result<(), TaskFailure> {
    let artifacts = &plan.artifacts;
    match task {
        SyncTask::UploadServer => {
            let session = connect(config, pool, HostRole::Server).await?;
            session
                .upload_content(
                    artifacts.server.as_bytes(),
                    remote_config_path(config, HostRole::Server),
                )
                .await
                .friendly("Couldn't upload rathole config to server")?;

            if !config.server.caddyfile.is_empty() {
                session
                    .upload_content(plan.parsed.source.as_bytes(), &config.server.caddyfile)
                    .await
                    .friendly("Couldn't upload Caddyfile to server")?;
            }
            Ok(())
        }
        SyncTask::UploadClient => {
            let session = connect(config, pool, HostRole::Client).await?;
            session
                .upload_content(
                    artifacts.client.as_bytes(),
                    remote_config_path(config, HostRole::Client),
                )
                .await
                .friendly("Couldn't upload config to client")
        }
        other => Err(TaskFailure::new(
            SyncError::config(format!("{:?} is not an upload task", other)),
            "Invalid task",
        )),
    }
}

// ============================================================================
// Restarting
// ============================================================================

/// 需要重启的目标；配置了 compose 目录时包含 Caddy
pub fn restart_tasks(config: &SyncConfig) -> Vec<SyncTask> {
    let mut tasks = vec![SyncTask::RestartServer, SyncTask::RestartClient];
    if !config.server.caddy_compose_dir.is_empty() {
        tasks.push(SyncTask::RestartCaddy);
    }
    tasks
}

/// 并发重启并校验状态
pub async fn restart_stage(
    config: &SyncConfig,
    pool: &SessionPool,
    targets: &[SyncTask],
) -> StageOutcome {
    let results = join_all(
        targets
            .iter()
            .map(|task| run_task(*task, restart_one(config, pool, *task))),
    )
    .await;
    StageOutcome::new(SyncStep::Restarting, results)
}

async fn restart_one(
    config: &SyncConfig,
    pool: &SessionPool,
    task: SyncTask,
) -> Result<(), TaskFailure> {
    match task {
        SyncTask::RestartServer => {
            restart_unit(config, pool, HostRole::Server, SERVER_UNIT).await
        }
        SyncTask::RestartClient => {
            restart_unit(config, pool, HostRole::Client, CLIENT_UNIT).await
        }
        SyncTask::RestartCaddy => {
            let friendly = "Couldn't restart Caddy";
            let dir = &config.server.caddy_compose_dir;
            if dir.is_empty() {
                return Err(TaskFailure::new(
                    SyncError::config("server.caddy_compose_dir is not set"),
                    friendly,
                ));
            }

            let session = connect(config, pool, HostRole::Server).await?;
            session.restart_container_group(dir).await.friendly(friendly)?;

            let (running, status) = match session.query_container_group_status(dir).await {
                Ok(status) => status,
                Err(e) => (false, e.to_string()),
            };
            if !running {
                return Err(TaskFailure::new(
                    SyncError::Verification {
                        target: "caddy".to_string(),
                        host: session.host().to_string(),
                        status,
                    },
                    friendly,
                ));
            }
            Ok(())
        }
        other => Err(TaskFailure::new(
            SyncError::config(format!("{:?} is not a restart task", other)),
            "Invalid task",
        )),
    }
}

async fn restart_unit(
    config: &SyncConfig,
    pool: &SessionPool,
    role: HostRole,
    unit: &str,
) -> Result<(), TaskFailure> {
    let friendly = format!("Couldn't restart rathole on {}", role.as_str());
    let session = connect(config, pool, role).await?;

    session.restart_unit(unit).await.friendly(friendly.clone())?;

    let (active, status) = session.query_unit_status(unit).await;
    if !active {
        return Err(TaskFailure::new(
            SyncError::Verification {
                target: unit.to_string(),
                host: session.host().to_string(),
                status,
            },
            friendly,
        ));
    }
    debug!(host = %session.host(), unit = %unit, "Unit active after restart");
    Ok(())
}
