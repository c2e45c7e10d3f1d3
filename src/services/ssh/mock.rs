//! 测试用的脚本化传输层

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::client::{CommandOutput, Connector, Transport};
use crate::config::HostTarget;
use crate::error::{SyncError, SyncResult};

/// 命令匹配规则：命令包含 `pattern` 时返回 `output`
struct Rule {
    pattern: String,
    output: CommandOutput,
}

/// 按子串匹配返回预设输出的传输层
///
/// 未匹配的命令返回退出码 0 的空输出
#[derive(Default)]
pub struct MockTransport {
    host: String,
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    stdin: Mutex<Vec<(String, Vec<u8>)>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Default::default()
        }
    }

    /// 匹配命令返回 stdout 和退出码 0
    pub fn on(&self, pattern: &str, stdout: &str) {
        self.on_exit(pattern, 0, stdout, "");
    }

    /// 匹配命令返回指定退出码
    pub fn on_exit(&self, pattern: &str, code: u32, stdout: &str, stderr: &str) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            output: CommandOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                exit_status: Some(code),
                exit_signal: None,
            },
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }

    /// 写入 stdin 的内容，按命令记录
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.stdin.lock().unwrap().clone()
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> SyncResult<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(input) = stdin {
            self.stdin
                .lock()
                .unwrap()
                .push((command.to_string(), input.to_vec()));
        }

        let rules = self.rules.lock().unwrap();
        // 后注册的规则优先
        let output = rules
            .iter()
            .rev()
            .find(|r| command.contains(&r.pattern))
            .map(|r| r.output.clone())
            .unwrap_or(CommandOutput {
                exit_status: Some(0),
                ..Default::default()
            });
        Ok(output)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type Setup = Box<dyn Fn(&MockTransport) + Send + Sync>;

/// 记录拨号次数的连接器
#[derive(Default)]
pub struct MockConnector {
    dials: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    setup: Mutex<Vec<(String, Setup)>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对该主机的拨号返回连接错误
    pub fn fail_host(&self, host: &str) {
        self.failing.lock().unwrap().insert(host.to_string());
    }

    /// 为该主机新建的传输层注册规则
    pub fn configure(&self, host: &str, f: impl Fn(&MockTransport) + Send + Sync + 'static) {
        self.setup
            .lock()
            .unwrap()
            .push((host.to_string(), Box::new(f)));
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }

    /// 该主机最近一次创建的传输层
    pub fn transport_for(&self, host: &str) -> Option<Arc<MockTransport>> {
        self.transports()
            .into_iter()
            .rev()
            .find(|t| t.host() == host)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &HostTarget) -> SyncResult<Arc<dyn Transport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&target.host) {
            return Err(SyncError::connection(&target.host, "connection refused"));
        }

        let transport = Arc::new(MockTransport::new(&target.host));
        for (host, f) in self.setup.lock().unwrap().iter() {
            if host == &target.host {
                f(&transport);
            }
        }
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
