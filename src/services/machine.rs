//! 单机操作：状态检查、重启、拉取服务器 Caddyfile

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{HostRole, SyncConfig};
use crate::domain::{StageOutcome, SyncTask};
use crate::error::{SyncError, SyncResult};
use crate::parser::{self, ParsedDocument};
use crate::services::ssh::SessionPool;
use crate::services::sync::stages;

/// 单元状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub active: bool,
    pub status: String,
}

/// 容器组状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComposeStatus {
    pub dir: String,
    pub running: bool,
    pub status: String,
}

/// 一台机器的状态
#[derive(Clone, Debug, Serialize)]
pub struct MachineStatus {
    pub role: &'static str,
    pub host: String,
    pub reachable: bool,
    pub error: Option<String>,
    pub units: Vec<UnitStatus>,
    pub compose: Option<ComposeStatus>,
}

impl MachineStatus {
    /// 可达且所有服务都在运行
    pub fn healthy(&self) -> bool {
        self.reachable
            && self.units.iter().all(|u| u.active)
            && self.compose.as_ref().map_or(true, |c| c.running)
    }
}

/// 检查一台机器；连接失败记录在状态中，不返回错误
pub async fn check_machine(config: &SyncConfig, pool: &SessionPool, role: HostRole) -> MachineStatus {
    let target = config.target(role);
    let mut status = MachineStatus {
        role: role.as_str(),
        host: target.host.clone(),
        reachable: false,
        error: None,
        units: Vec::new(),
        compose: None,
    };

    let session = match pool.acquire(&target).await {
        Ok(session) => session,
        Err(e) => {
            warn!(host = %target.host, error = %e, "Machine unreachable");
            status.error = Some(e.to_string());
            return status;
        }
    };
    status.reachable = true;

    let unit = match role {
        HostRole::Server => stages::SERVER_UNIT,
        HostRole::Client => stages::CLIENT_UNIT,
    };
    let (active, text) = session.query_unit_status(unit).await;
    status.units.push(UnitStatus {
        name: unit.to_string(),
        active,
        status: text,
    });

    if role == HostRole::Server && !config.server.caddy_compose_dir.is_empty() {
        let dir = config.server.caddy_compose_dir.clone();
        let (running, text) = match session.query_container_group_status(&dir).await {
            Ok(result) => result,
            Err(e) => (false, e.to_string()),
        };
        status.compose = Some(ComposeStatus {
            dir,
            running,
            status: text,
        });
    }

    status
}

/// 并发检查两台机器
pub async fn check_all(config: &SyncConfig, pool: &SessionPool) -> Vec<MachineStatus> {
    let (server, client) = tokio::join!(
        check_machine(config, pool, HostRole::Server),
        check_machine(config, pool, HostRole::Client),
    );
    vec![server, client]
}

/// 重启指定目标，每个目标重启后校验状态
pub async fn restart_targets(
    config: &SyncConfig,
    pool: &SessionPool,
    targets: &[SyncTask],
) -> SyncResult<StageOutcome> {
    if targets.contains(&SyncTask::RestartCaddy) && config.server.caddy_compose_dir.is_empty() {
        return Err(SyncError::config("server.caddy_compose_dir is not set"));
    }
    Ok(stages::restart_stage(config, pool, targets).await)
}

/// 下载服务器上的 Caddyfile 覆盖本地文件，返回解析结果
pub async fn pull(config: &SyncConfig, pool: &SessionPool) -> SyncResult<ParsedDocument> {
    if config.server.caddyfile.is_empty() {
        return Err(SyncError::config("server.caddyfile is not set"));
    }
    let local = config.require_caddyfile()?;

    let session = pool.acquire(&config.target(HostRole::Server)).await?;
    let content = session.download_content(&config.server.caddyfile).await?;

    write_local(local, &content).await?;
    info!(
        remote = %config.server.caddyfile,
        local = %local.display(),
        bytes = content.len(),
        "Pulled Caddyfile from server"
    );

    Ok(parser::parse(&String::from_utf8_lossy(&content)))
}

async fn write_local(path: &Path, content: &[u8]) -> SyncResult<()> {
    let transfer_err = |e: std::io::Error| SyncError::Transfer {
        operation: "write",
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(transfer_err)?;
    }
    tokio::fs::write(path, content).await.map_err(transfer_err)
}
