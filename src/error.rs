//! 统一错误处理
//!
//! `SyncError` 覆盖连接、远程执行、文件传输、重启校验和解析失败。
//! 所有变体只持有字符串，便于克隆到任务结果矩阵中。

use thiserror::Error;

/// 同步流程错误类型
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// 建立 SSH 会话失败（拨号 / 认证 / 读取私钥）
    #[error("connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    /// 远程命令返回非零或通道传输失败
    #[error("run {command:?}: {exit_info} (stderr: {stderr})")]
    Execution {
        command: String,
        exit_info: String,
        stderr: String,
    },

    /// 上传 / 下载失败
    #[error("{operation} {path}: {reason}")]
    Transfer {
        operation: &'static str,
        path: String,
        reason: String,
    },

    /// 重启命令成功，但随后的状态查询未报告 active/running
    #[error("{target} on {host} is not running after restart (status: {status})")]
    Verification {
        target: String,
        host: String,
        status: String,
    },

    /// 本地文档无法读取
    #[error("read {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    /// 渲染配置失败
    #[error("render {artifact}: {reason}")]
    Render {
        artifact: &'static str,
        reason: String,
    },

    /// 配置缺失或无效
    #[error("config: {0}")]
    Config(String),
}

impl SyncError {
    pub fn connection(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// 错误分类名（用于日志字段）
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Connection { .. } => "connection",
            SyncError::Execution { .. } => "execution",
            SyncError::Transfer { .. } => "transfer",
            SyncError::Verification { .. } => "verification",
            SyncError::ParseFailure { .. } => "parse",
            SyncError::Render { .. } => "render",
            SyncError::Config(_) => "config",
        }
    }

    /// 根据原始错误文本给出简短提示
    ///
    /// 仅作展示用途，不影响控制流
    pub fn hint(&self) -> Option<&'static str> {
        hint_for(&self.to_string())
    }
}

/// 从错误文本中匹配常见问题
pub fn hint_for(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    if lower.contains("sudo") && lower.contains("password") {
        Some("Use passwordless sudo or connect as root")
    } else if lower.contains("could not be found") || lower.contains("not found") {
        Some("Service may not be installed")
    } else if lower.contains("permission denied") {
        Some("Check the SSH key and remote file permissions")
    } else if lower.contains("timed out") {
        Some("Host unreachable; check the address and firewall")
    } else {
        None
    }
}

/// 便捷类型别名
pub type SyncResult<T> = Result<T, SyncError>;
