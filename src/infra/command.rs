//! 本地命令执行器
//!
//! 用于调用本机工具（如 1Password CLI），支持：
//! - 通过 stdin 传入内容
//! - 超时控制
//! - stdout/stderr 分离

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::error;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 写入 stdin 失败
    StdinFailed(std::io::Error),
    /// 命令超时
    Timeout,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::StdinFailed(e) => write!(f, "Failed to write command input: {}", e),
            CommandError::Timeout => write!(f, "Command timed out"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e)
            | CommandError::StdinFailed(e)
            | CommandError::WaitFailed(e) => Some(e),
            CommandError::Timeout => None,
        }
    }
}

impl CommandRunner {
    /// 执行命令并把 `input` 写入 stdin
    ///
    /// 写完后关闭 stdin，等待进程退出并收集输出。超时后进程会被终止。
    pub async fn run_with_input(
        program: &str,
        args: &[&str],
        input: &[u8],
        timeout: Duration,
    ) -> Result<Output, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await.map_err(CommandError::StdinFailed)?;
            // drop 关闭 stdin，让子进程读到 EOF
        }

        tokio::select! {
            result = child.wait_with_output() => {
                result.map_err(CommandError::WaitFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program = %program, "Command timed out after {:?}", timeout);
                Err(CommandError::Timeout)
            }
        }
    }
}
