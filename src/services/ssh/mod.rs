//! SSH 客户端模块
//!
//! 提供到远程机器的会话复用和远程操作

mod client;
mod pool;
mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{split_host_port, CommandOutput, Connector, SshConnector, Transport, DIAL_TIMEOUT};
pub use pool::{SessionKey, SessionPool};
pub use session::{shell_quote, RemoteSession};
