//! SSH 客户端传输层
//!
//! 基于 russh：每条命令打开独立 channel，一个连接可并发执行多条命令

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tracing::{debug, info, warn};

use crate::config::HostTarget;
use crate::error::{SyncError, SyncResult};

/// 建立连接的超时
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 默认 SSH 端口
const DEFAULT_SSH_PORT: u16 = 22;

/// 远程命令输出
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// 退出码；channel 异常关闭时为 None
    pub exit_status: Option<u32>,
    /// 被信号终止时的信号名
    pub exit_signal: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// 退出信息描述
    pub fn exit_info(&self) -> String {
        match (&self.exit_status, &self.exit_signal) {
            (Some(code), _) => format!("exit status {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "channel closed without exit status".to_string(),
        }
    }
}

/// 一个已认证连接上的命令通道
#[async_trait]
pub trait Transport: Send + Sync {
    /// 在独立 channel 上执行命令，可选写入 stdin
    ///
    /// 非零退出码不是错误；只有传输失败才返回 Err
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> SyncResult<CommandOutput>;

    /// 底层连接是否已断开
    fn is_closed(&self) -> bool;

    /// 关闭连接
    async fn close(&self);
}

/// 建立新连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &HostTarget) -> SyncResult<Arc<dyn Transport>>;
}

/// russh 客户端回调
struct ClientHandler {
    host: String,
    port: u16,
    strict_host_key: bool,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.strict_host_key {
            return Ok(true);
        }

        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, "Host key not present in known_hosts");
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

/// 基于 russh 的连接器
pub struct SshConnector {
    dial_timeout: Duration,
}

impl SshConnector {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &HostTarget) -> SyncResult<Arc<dyn Transport>> {
        let (host, port) = split_host_port(&target.host);

        let key_pair = russh_keys::load_secret_key(&target.ssh_key, None).map_err(|e| {
            SyncError::connection(
                &target.host,
                format!("read key {}: {}", target.ssh_key.display(), e),
            )
        })?;

        if !target.strict_host_key {
            // 与原有行为一致：接受任意主机密钥
            warn!(host = %target.host, "Host key verification disabled, accepting any server key");
        }

        let handler = ClientHandler {
            host: host.clone(),
            port,
            strict_host_key: target.strict_host_key,
        };
        let config = Arc::new(client::Config::default());

        debug!(host = %host, port = port, user = %target.user, "Dialing SSH");

        let dial = async {
            let mut handle = client::connect(config, (host.as_str(), port), handler)
                .await
                .map_err(|e| SyncError::connection(&target.host, e))?;

            let authenticated = handle
                .authenticate_publickey(target.user.clone(), Arc::new(key_pair))
                .await
                .map_err(|e| SyncError::connection(&target.host, e))?;

            if !authenticated {
                return Err(SyncError::connection(
                    &target.host,
                    format!("public key authentication rejected for {}", target.user),
                ));
            }
            Ok::<_, SyncError>(handle)
        };

        let handle = tokio::time::timeout(self.dial_timeout, dial)
            .await
            .map_err(|_| {
                SyncError::connection(
                    &target.host,
                    format!("connection timed out after {:?}", self.dial_timeout),
                )
            })??;

        info!(host = %target.host, user = %target.user, "SSH session established");

        Ok(Arc::new(SshTransport {
            host: target.host.clone(),
            handle,
        }))
    }
}

/// 一个 russh 连接
pub struct SshTransport {
    host: String,
    handle: client::Handle<ClientHandler>,
}

impl SshTransport {
    fn transport_error(&self, command: &str, e: impl ToString) -> SyncError {
        SyncError::Execution {
            command: command.to_string(),
            exit_info: format!("transport failure on {}", self.host),
            stderr: e.to_string(),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> SyncResult<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.transport_error(command, e))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| self.transport_error(command, e))?;

        if let Some(input) = stdin {
            channel
                .data(input)
                .await
                .map_err(|e| self.transport_error(command, e))?;
            channel
                .eof()
                .await
                .map_err(|e| self.transport_error(command, e))?;
        }

        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    output.exit_signal = Some(format!("{:?}", signal_name))
                }
                _ => {}
            }
        }

        debug!(host = %self.host, command = %command, exit = %output.exit_info(), "Remote command finished");
        Ok(output)
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %self.host, error = %e, "SSH disconnect failed");
        }
    }
}

/// 拆分 `host[:port]` 或 `[ipv6][:port]`，缺省端口 22
///
/// 不带方括号的 IPv6 地址整体视为主机名
pub fn split_host_port(host: &str) -> (String, u16) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = match tail.strip_prefix(':') {
                Some(port) => match port.parse() {
                    Ok(port) => port,
                    Err(_) => return (host.to_string(), DEFAULT_SSH_PORT),
                },
                None if tail.is_empty() => DEFAULT_SSH_PORT,
                None => return (host.to_string(), DEFAULT_SSH_PORT),
            };
            return (addr.to_string(), port);
        }
    }

    if let Some((name, port)) = host.split_once(':') {
        if !port.contains(':') {
            if let Ok(port) = port.parse() {
                return (name.to_string(), port);
            }
        }
    }
    (host.to_string(), DEFAULT_SSH_PORT)
}
