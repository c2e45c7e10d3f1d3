//! 远程会话操作
//!
//! 在一个已认证连接上执行命令、传输文件、管理 systemd 单元和 docker compose。
//! 非 root 用户自动加 sudo。

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::client::{CommandOutput, Transport};
use crate::error::{SyncError, SyncResult};

/// 超级用户
const ROOT_USER: &str = "root";

/// 远程会话
pub struct RemoteSession {
    transport: Arc<dyn Transport>,
    host: String,
    user: String,
}

/// `docker compose ps --format json` 的单行
#[derive(Debug, Deserialize)]
struct ComposeEntry {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
}

impl RemoteSession {
    pub fn new(transport: Arc<dyn Transport>, host: &str, user: &str) -> Self {
        Self {
            transport,
            host: host.to_string(),
            user: user.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// 执行命令并返回 stdout
    pub async fn execute(&self, command: &str) -> SyncResult<String> {
        let output = self.transport.exec(command, None).await?;
        check_output(command, &output)?;
        Ok(output.stdout_text())
    }

    /// 需要提权时加 sudo 前缀
    pub fn privileged(&self, command: &str) -> String {
        if self.user == ROOT_USER {
            command.to_string()
        } else {
            format!("sudo {}", command)
        }
    }

    /// 远程用户的 home 目录
    pub fn home_dir(&self) -> String {
        if self.user == ROOT_USER {
            "/root".to_string()
        } else {
            format!("/home/{}", self.user)
        }
    }

    /// 展开远程路径开头的 `~`
    pub fn expand_remote_path(&self, path: &str) -> String {
        if path == "~" {
            return self.home_dir();
        }
        match path.strip_prefix("~/") {
            Some(rest) => format!("{}/{}", self.home_dir(), rest),
            None => path.to_string(),
        }
    }

    /// 整体替换远程文件
    ///
    /// 内容经 stdin 写入同目录临时文件，再 `mv -f` 到目标位置
    pub async fn upload_content(&self, content: &[u8], remote_path: &str) -> SyncResult<()> {
        let path = self.expand_remote_path(remote_path);
        let transfer_err = |reason: String| SyncError::Transfer {
            operation: "upload",
            path: path.clone(),
            reason,
        };

        if let Some(dir) = parent_dir(&path) {
            let mkdir = self.privileged(&format!("mkdir -p {}", shell_quote(dir)));
            if let Err(e) = self.execute(&mkdir).await {
                // 目录已存在等情况
                debug!(host = %self.host, dir = %dir, error = %e, "mkdir before upload failed");
            }
        }

        let tmp = format!("{}.rcm-{}", path, uuid::Uuid::new_v4().simple());
        let write = self.privileged(&format!("tee {} > /dev/null", shell_quote(&tmp)));
        let output = self
            .transport
            .exec(&write, Some(content))
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
        check_output(&write, &output).map_err(|e| transfer_err(e.to_string()))?;

        let rename = self.privileged(&format!("mv -f {} {}", shell_quote(&tmp), shell_quote(&path)));
        if let Err(e) = self.execute(&rename).await {
            let cleanup = self.privileged(&format!("rm -f {}", shell_quote(&tmp)));
            let _ = self.transport.exec(&cleanup, None).await;
            return Err(transfer_err(e.to_string()));
        }

        debug!(host = %self.host, path = %path, bytes = content.len(), "Uploaded file");
        Ok(())
    }

    /// 读取远程文件
    pub async fn download_content(&self, remote_path: &str) -> SyncResult<Vec<u8>> {
        let path = self.expand_remote_path(remote_path);
        let command = format!("cat {}", shell_quote(&path));
        let transfer_err = |reason: String| SyncError::Transfer {
            operation: "download",
            path: path.clone(),
            reason,
        };

        let output = self
            .transport
            .exec(&command, None)
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
        check_output(&command, &output).map_err(|e| transfer_err(e.to_string()))?;
        Ok(output.stdout)
    }

    /// 远程文件是否存在；检查失败视为不存在
    pub async fn file_exists(&self, remote_path: &str) -> bool {
        let path = self.expand_remote_path(remote_path);
        self.execute(&format!("test -f {}", shell_quote(&path)))
            .await
            .is_ok()
    }

    /// 重启 systemd 单元
    pub async fn restart_unit(&self, unit: &str) -> SyncResult<()> {
        let command = self.privileged(&format!("systemctl restart {}", shell_quote(unit)));
        self.execute(&command).await?;
        Ok(())
    }

    /// 查询 systemd 单元状态，查询失败视为未运行
    pub async fn query_unit_status(&self, unit: &str) -> (bool, String) {
        let command = format!("systemctl is-active {}", shell_quote(unit));
        match self.transport.exec(&command, None).await {
            Ok(output) => {
                let text = output.stdout_text().trim().to_string();
                let active = output.success() && text == "active";
                let text = if text.is_empty() {
                    "inactive".to_string()
                } else {
                    text
                };
                (active, text)
            }
            Err(e) => {
                warn!(host = %self.host, unit = %unit, error = %e, "Unit status query failed");
                (false, "unknown".to_string())
            }
        }
    }

    /// 在 compose 目录中重启容器组
    ///
    /// 先用 `docker compose`，失败后再试 `docker-compose`
    pub async fn restart_container_group(&self, dir: &str) -> SyncResult<()> {
        let dir = self.expand_remote_path(dir);
        let modern = self.compose_command(&dir, "docker compose restart");
        let modern_err = match self.execute(&modern).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        debug!(host = %self.host, error = %modern_err, "docker compose restart failed, trying docker-compose");
        let legacy = self.compose_command(&dir, "docker-compose restart");
        match self.execute(&legacy).await {
            Ok(_) => Ok(()),
            Err(_) => Err(modern_err),
        }
    }

    /// 查询容器组状态，返回 (是否全部运行, 描述)
    pub async fn query_container_group_status(&self, dir: &str) -> SyncResult<(bool, String)> {
        let dir = self.expand_remote_path(dir);
        let modern = self.compose_command(&dir, "docker compose ps --format json");
        let modern_result = self.execute(&modern).await;

        if let Ok(stdout) = &modern_result {
            let entries = parse_compose_json(stdout);
            if !entries.is_empty() {
                return Ok(summarize_entries(&entries));
            }
        }

        let legacy = self.compose_command(&dir, "docker-compose ps");
        match self.execute(&legacy).await {
            Ok(stdout) => Ok(summarize_legacy_table(&stdout)),
            Err(legacy_err) => match modern_result {
                // 新版命令可用但没有容器
                Ok(_) => Ok((false, "no containers".to_string())),
                Err(_) => Err(legacy_err),
            },
        }
    }

    fn compose_command(&self, dir: &str, compose: &str) -> String {
        format!("cd {} && {}", shell_quote(dir), self.privileged(compose))
    }
}

/// 非零退出转换为 Execution 错误
fn check_output(command: &str, output: &CommandOutput) -> SyncResult<()> {
    if output.success() {
        return Ok(());
    }
    Err(SyncError::Execution {
        command: command.to_string(),
        exit_info: output.exit_info(),
        stderr: output.stderr_text().trim().to_string(),
    })
}

fn parent_dir(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((dir, _)) => Some(dir),
    }
}

/// 单引号转义
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// 逐行解析 JSON 输出，无法解析的行跳过
///
/// 兼容旧版本一次输出整个数组的格式
fn parse_compose_json(stdout: &str) -> Vec<ComposeEntry> {
    let mut entries = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with('[') {
            match serde_json::from_str::<Vec<ComposeEntry>>(line) {
                Ok(list) => entries.extend(list),
                Err(e) => debug!(error = %e, "Skipping unparsable compose output"),
            }
            continue;
        }
        match serde_json::from_str::<ComposeEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => debug!(error = %e, "Skipping unparsable compose output"),
        }
    }
    entries
}

fn summarize_entries(entries: &[ComposeEntry]) -> (bool, String) {
    let running = entries.iter().filter(|e| e.state.eq_ignore_ascii_case("running")).count();
    let text = entries
        .iter()
        .map(|e| format!("{}: {}", e.name, e.state))
        .collect::<Vec<_>>()
        .join(", ");
    (running > 0 && running == entries.len(), text)
}

fn summarize_legacy_table(stdout: &str) -> (bool, String) {
    let rows: Vec<&str> = stdout
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .collect();
    // 没有分隔线时直接扫描全部输出
    let rows = if rows.is_empty() {
        stdout.lines().collect()
    } else {
        rows
    };

    let up = rows.iter().filter(|l| l.contains(" Up ")).count();
    if up > 0 {
        (true, format!("{} up", up))
    } else {
        (false, "not running".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ssh::mock::MockTransport;

    fn session(user: &str) -> (Arc<MockTransport>, RemoteSession) {
        let transport = Arc::new(MockTransport::new("vps.example.com"));
        let session = RemoteSession::new(transport.clone(), "vps.example.com", user);
        (transport, session)
    }

    #[test]
    fn test_expand_remote_path() {
        let (_, root) = session("root");
        assert_eq!(root.expand_remote_path("~/caddy/Caddyfile"), "/root/caddy/Caddyfile");
        assert_eq!(root.expand_remote_path("~"), "/root");

        let (_, deploy) = session("deploy");
        assert_eq!(
            deploy.expand_remote_path("~/rathole/client.toml"),
            "/home/deploy/rathole/client.toml"
        );
        assert_eq!(deploy.expand_remote_path("/etc/rathole.toml"), "/etc/rathole.toml");
        assert_eq!(deploy.expand_remote_path("~other/x"), "~other/x");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/rathole"), "'/etc/rathole'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_execute_nonzero_is_execution_error() {
        let (transport, session) = session("root");
        transport.on_exit("false", 1, "", "boom");

        let err = session.execute("false").await.unwrap_err();
        match err {
            SyncError::Execution { command, exit_info, stderr } => {
                assert_eq!(command, "false");
                assert_eq!(exit_info, "exit status 1");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_content_as_non_root_uses_sudo_and_rename() {
        let (transport, session) = session("deploy");
        session
            .upload_content(b"[server]\n", "~/rathole/server.toml")
            .await
            .unwrap();

        let commands = transport.commands();
        assert_eq!(commands[0], "sudo mkdir -p '/home/deploy/rathole'");
        assert!(commands[1].starts_with("sudo tee '/home/deploy/rathole/server.toml.rcm-"));
        assert!(commands[2].starts_with("sudo mv -f '/home/deploy/rathole/server.toml.rcm-"));
        assert!(commands[2].ends_with(" '/home/deploy/rathole/server.toml'"));

        let uploads = transport.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, b"[server]\n");
    }

    #[tokio::test]
    async fn test_upload_ignores_mkdir_failure() {
        let (transport, session) = session("root");
        transport.on_exit("mkdir -p", 1, "", "File exists");

        session
            .upload_content(b"x", "/etc/rathole/client.toml")
            .await
            .unwrap();
        assert!(transport.ran("mv -f"));
    }

    #[tokio::test]
    async fn test_upload_write_failure_is_transfer_error() {
        let (transport, session) = session("root");
        transport.on_exit("tee", 1, "", "Permission denied");

        let err = session
            .upload_content(b"x", "/etc/rathole/client.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transfer { operation: "upload", .. }));
        assert!(!transport.ran("mv -f"));
    }

    #[tokio::test]
    async fn test_download_and_file_exists() {
        let (transport, session) = session("root");
        transport.on("cat '/root/Caddyfile'", "example.com {\n}\n");
        transport.on_exit("test -f '/missing'", 1, "", "");

        let bytes = session.download_content("~/Caddyfile").await.unwrap();
        assert_eq!(bytes, b"example.com {\n}\n");
        assert!(session.file_exists("/root/Caddyfile").await);
        assert!(!session.file_exists("/missing").await);

        transport.on_exit("cat '/gone'", 1, "", "No such file");
        let err = session.download_content("/gone").await.unwrap_err();
        assert!(matches!(err, SyncError::Transfer { operation: "download", .. }));
    }

    #[tokio::test]
    async fn test_unit_restart_and_status() {
        let (transport, session) = session("deploy");
        transport.on("systemctl is-active 'rathole-client'", "active\n");

        session.restart_unit("rathole-client").await.unwrap();
        assert!(transport.ran("sudo systemctl restart 'rathole-client'"));
        assert_eq!(
            session.query_unit_status("rathole-client").await,
            (true, "active".to_string())
        );

        transport.on_exit("systemctl is-active 'rathole-client'", 3, "inactive\n", "");
        assert_eq!(
            session.query_unit_status("rathole-client").await,
            (false, "inactive".to_string())
        );
    }

    #[tokio::test]
    async fn test_container_group_restart_falls_back_to_legacy() {
        let (transport, session) = session("root");
        transport.on_exit("docker compose restart", 127, "", "docker: 'compose' is not a docker command");

        session.restart_container_group("/opt/caddy").await.unwrap();
        assert!(transport.ran("cd '/opt/caddy' && docker-compose restart"));
    }

    #[tokio::test]
    async fn test_container_group_restart_reports_modern_error() {
        let (transport, session) = session("root");
        transport.on_exit("docker compose restart", 1, "", "no configuration file provided");
        transport.on_exit("docker-compose restart", 127, "", "docker-compose: command not found");

        let err = session.restart_container_group("/opt/caddy").await.unwrap_err();
        assert!(err.to_string().contains("no configuration file provided"));
    }

    #[tokio::test]
    async fn test_container_group_status_json_lines() {
        let (transport, session) = session("root");
        transport.on(
            "docker compose ps --format json",
            "{\"Name\":\"caddy\",\"State\":\"running\"}\nnot json\n{\"Name\":\"db\",\"State\":\"running\"}\n",
        );

        let (running, text) = session.query_container_group_status("/opt/caddy").await.unwrap();
        assert!(running);
        assert_eq!(text, "caddy: running, db: running");
    }

    #[tokio::test]
    async fn test_container_group_status_state_case_insensitive() {
        let (transport, session) = session("root");
        transport.on(
            "docker compose ps --format json",
            "{\"Name\":\"caddy\",\"State\":\"Running\"}\n",
        );

        let (running, text) = session.query_container_group_status("/opt/caddy").await.unwrap();
        assert!(running);
        assert_eq!(text, "caddy: Running");
    }

    #[tokio::test]
    async fn test_container_group_status_json_array_with_exited() {
        let (transport, session) = session("root");
        transport.on(
            "docker compose ps --format json",
            "[{\"Name\":\"caddy\",\"State\":\"exited\"}]",
        );

        let (running, text) = session.query_container_group_status("/opt/caddy").await.unwrap();
        assert!(!running);
        assert_eq!(text, "caddy: exited");
    }

    #[tokio::test]
    async fn test_container_group_status_legacy_table() {
        let (transport, session) = session("root");
        transport.on_exit("docker compose ps", 1, "", "unknown flag: --format");
        transport.on(
            "docker-compose ps",
            "Name    Command    State    Ports\n--------------------------------\ncaddy   caddy run   Up      80/tcp\n",
        );

        let (running, text) = session.query_container_group_status("/opt/caddy").await.unwrap();
        assert!(running);
        assert_eq!(text, "1 up");
    }

    #[tokio::test]
    async fn test_container_group_status_both_dialects_fail() {
        let (transport, session) = session("root");
        transport.on_exit("docker compose ps", 1, "", "no such directory");
        transport.on_exit("docker-compose ps", 127, "", "command not found");

        assert!(session.query_container_group_status("/opt/caddy").await.is_err());
    }
}
