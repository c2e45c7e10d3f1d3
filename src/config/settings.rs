//! 配置文件加载
//!
//! 读取 YAML 配置，应用 `RCM_*` 环境变量覆盖，展开路径并校验必填项

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::secrets;
use crate::error::{SyncError, SyncResult};

/// 默认 SSH 用户
const DEFAULT_USER: &str = "root";
/// 默认 rathole 监听端口
const DEFAULT_BIND_PORT: u16 = 2333;

/// 根配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub rathole: RatholeConfig,
}

/// 本地路径
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// 本地 Caddyfile
    pub caddyfile: String,
    /// SSH 私钥目录（默认 ~/.ssh）
    pub ssh_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            caddyfile: String::new(),
            ssh_dir: "~/.ssh".to_string(),
        }
    }
}

/// VPS（rathole server + Caddy）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub user: String,
    pub ssh_key: String,
    /// 远程 rathole server.toml 路径
    pub rathole_config: String,
    /// 远程 Caddyfile 路径（可选）
    pub caddyfile: String,
    /// Caddy 的 docker compose 目录（可选）
    pub caddy_compose_dir: String,
    /// 是否校验 known_hosts
    pub strict_host_key: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: DEFAULT_USER.to_string(),
            ssh_key: String::new(),
            rathole_config: String::new(),
            caddyfile: String::new(),
            caddy_compose_dir: String::new(),
            strict_host_key: false,
        }
    }
}

/// 家庭机器（rathole client）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub user: String,
    pub ssh_key: String,
    /// 远程 rathole client.toml 路径
    pub rathole_config: String,
    pub strict_host_key: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: DEFAULT_USER.to_string(),
            ssh_key: String::new(),
            rathole_config: String::new(),
            strict_host_key: false,
        }
    }
}

/// rathole 参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RatholeConfig {
    pub bind_port: u16,
    pub token: String,
    pub server_private_key: String,
    pub server_public_key: String,
}

impl Default for RatholeConfig {
    fn default() -> Self {
        Self {
            bind_port: DEFAULT_BIND_PORT,
            token: String::new(),
            server_private_key: String::new(),
            server_public_key: String::new(),
        }
    }
}

/// 目标机器角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostRole {
    Server,
    Client,
}

impl HostRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostRole::Server => "server",
            HostRole::Client => "client",
        }
    }
}

/// 一台远程机器的连接参数
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostTarget {
    pub role: HostRole,
    pub host: String,
    pub user: String,
    pub ssh_key: PathBuf,
    pub strict_host_key: bool,
}

impl SyncConfig {
    /// 默认配置文件搜索路径
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("rcm").join("config.yaml"));
        }
        paths.push(PathBuf::from("config.yaml"));
        paths
    }

    /// 定位配置文件
    pub fn locate(explicit: Option<&Path>) -> SyncResult<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        Self::search_paths()
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| SyncError::config("no config file loaded (~/.config/rcm/config.yaml)"))
    }

    /// 从 YAML 文本解析（不做后处理）
    pub fn from_yaml(text: &str) -> SyncResult<Self> {
        serde_yaml::from_str(text).map_err(|e| SyncError::config(format!("failed to parse config: {}", e)))
    }

    /// 加载、解析、覆盖、解析密钥引用并校验
    pub async fn load(explicit: Option<&Path>) -> SyncResult<(Self, PathBuf)> {
        let path = Self::locate(explicit)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::config(format!("read {}: {}", path.display(), e)))?;

        let mut config = Self::from_yaml(&text)?;
        config.apply_env_overrides();
        secrets::resolve_refs(&mut config).await?;
        config.resolve_paths();
        config.validate()?;

        debug!(path = %path.display(), server = %config.server.host, client = %config.client.host, "Config loaded");
        Ok((config, path))
    }

    /// 应用 `RCM_*` 环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        let fields: [(&str, &mut String); 15] = [
            ("RCM_PATHS_CADDYFILE", &mut self.paths.caddyfile),
            ("RCM_PATHS_SSH_DIR", &mut self.paths.ssh_dir),
            ("RCM_SERVER_HOST", &mut self.server.host),
            ("RCM_SERVER_USER", &mut self.server.user),
            ("RCM_SERVER_SSH_KEY", &mut self.server.ssh_key),
            ("RCM_SERVER_RATHOLE_CONFIG", &mut self.server.rathole_config),
            ("RCM_SERVER_CADDYFILE", &mut self.server.caddyfile),
            ("RCM_SERVER_CADDY_COMPOSE_DIR", &mut self.server.caddy_compose_dir),
            ("RCM_CLIENT_HOST", &mut self.client.host),
            ("RCM_CLIENT_USER", &mut self.client.user),
            ("RCM_CLIENT_SSH_KEY", &mut self.client.ssh_key),
            ("RCM_CLIENT_RATHOLE_CONFIG", &mut self.client.rathole_config),
            ("RCM_RATHOLE_TOKEN", &mut self.rathole.token),
            ("RCM_RATHOLE_SERVER_PRIVATE_KEY", &mut self.rathole.server_private_key),
            ("RCM_RATHOLE_SERVER_PUBLIC_KEY", &mut self.rathole.server_public_key),
        ];

        for (var, field) in fields {
            if let Ok(value) = env::var(var) {
                *field = value;
            }
        }

        if let Ok(value) = env::var("RCM_RATHOLE_BIND_PORT") {
            match value.parse() {
                Ok(port) => self.rathole.bind_port = port,
                Err(_) => warn!(value = %value, "Ignoring invalid RCM_RATHOLE_BIND_PORT"),
            }
        }
    }

    /// 展开 `~` 并把裸文件名的私钥拼到 ssh_dir 下
    pub fn resolve_paths(&mut self) {
        self.paths.caddyfile = expand_path(&self.paths.caddyfile);
        self.paths.ssh_dir = expand_path(&self.paths.ssh_dir);
        self.server.ssh_key = resolve_ssh_key(&self.server.ssh_key, &self.paths.ssh_dir);
        self.client.ssh_key = resolve_ssh_key(&self.client.ssh_key, &self.paths.ssh_dir);
    }

    /// 校验必填项
    pub fn validate(&self) -> SyncResult<()> {
        if self.server.host.is_empty() {
            return Err(SyncError::config("server.host is required"));
        }
        if self.client.host.is_empty() {
            return Err(SyncError::config("client.host is required"));
        }
        Ok(())
    }

    /// 同步 / 列表命令需要本地 Caddyfile
    pub fn require_caddyfile(&self) -> SyncResult<&Path> {
        if self.paths.caddyfile.is_empty() {
            return Err(SyncError::config("paths.caddyfile is required"));
        }
        Ok(Path::new(&self.paths.caddyfile))
    }

    /// 获取某台机器的连接参数
    pub fn target(&self, role: HostRole) -> HostTarget {
        match role {
            HostRole::Server => HostTarget {
                role,
                host: self.server.host.clone(),
                user: self.server.user.clone(),
                ssh_key: PathBuf::from(&self.server.ssh_key),
                strict_host_key: self.server.strict_host_key,
            },
            HostRole::Client => HostTarget {
                role,
                host: self.client.host.clone(),
                user: self.client.user.clone(),
                ssh_key: PathBuf::from(&self.client.ssh_key),
                strict_host_key: self.client.strict_host_key,
            },
        }
    }

    /// 所有字符串字段的可变引用（用于密钥引用解析）
    pub(crate) fn string_fields_mut(&mut self) -> Vec<&mut String> {
        vec![
            &mut self.paths.caddyfile,
            &mut self.paths.ssh_dir,
            &mut self.server.host,
            &mut self.server.user,
            &mut self.server.ssh_key,
            &mut self.server.rathole_config,
            &mut self.server.caddyfile,
            &mut self.server.caddy_compose_dir,
            &mut self.client.host,
            &mut self.client.user,
            &mut self.client.ssh_key,
            &mut self.client.rathole_config,
            &mut self.rathole.token,
            &mut self.rathole.server_private_key,
            &mut self.rathole.server_public_key,
        ]
    }
}

/// 展开本地路径开头的 `~`
pub fn expand_path(path: &str) -> String {
    let Some(rest) = path.strip_prefix('~') else {
        return path.to_string();
    };
    match dirs::home_dir() {
        Some(home) => home
            .join(rest.trim_start_matches('/'))
            .to_string_lossy()
            .to_string(),
        None => path.to_string(),
    }
}

/// 私钥路径：`~` 或 `/` 开头视为完整路径，否则拼到 ssh_dir 下
fn resolve_ssh_key(key: &str, ssh_dir: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    if key.starts_with('~') || key.starts_with('/') {
        return expand_path(key);
    }
    Path::new(ssh_dir).join(key).to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
paths:
  caddyfile: /etc/caddy/Caddyfile
  ssh_dir: /keys
server:
  host: vps.example.com
  ssh_key: id_vps
  rathole_config: /etc/rathole/server.toml
  caddy_compose_dir: /opt/caddy
client:
  host: 192.168.1.50
  user: pi
  ssh_key: /abs/id_home
  rathole_config: ~/rathole/client.toml
rathole:
  token: secret
"#;

    #[test]
    fn test_defaults_applied() {
        let config = SyncConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.server.user, "root");
        assert_eq!(config.client.user, "pi");
        assert_eq!(config.rathole.bind_port, 2333);
        assert!(!config.server.strict_host_key);

        let empty = SyncConfig::from_yaml("{}").unwrap();
        assert_eq!(empty.paths.ssh_dir, "~/.ssh");
    }

    #[test]
    fn test_resolve_paths_joins_bare_key_names() {
        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.resolve_paths();
        assert_eq!(config.server.ssh_key, "/keys/id_vps");
        assert_eq!(config.client.ssh_key, "/abs/id_home");
        // 远程路径不在本地展开
        assert_eq!(config.client.rathole_config, "~/rathole/client.toml");
    }

    #[test]
    fn test_validate_requires_hosts() {
        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        assert!(config.validate().is_ok());

        config.client.host.clear();
        assert_eq!(
            config.validate().unwrap_err(),
            SyncError::config("client.host is required")
        );
    }

    #[test]
    fn test_target_for_role() {
        let config = SyncConfig::from_yaml(SAMPLE).unwrap();
        let target = config.target(HostRole::Client);
        assert_eq!(target.host, "192.168.1.50");
        assert_eq!(target.user, "pi");
        assert_eq!(target.role.as_str(), "client");
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/etc/caddy"), "/etc/caddy");
        assert_eq!(expand_path(""), "");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_path("~/Caddyfile"),
                home.join("Caddyfile").to_string_lossy()
            );
        }
    }

    #[test]
    fn test_env_override() {
        env::set_var("RCM_RATHOLE_BIND_PORT", "4444");
        let mut config = SyncConfig::from_yaml(SAMPLE).unwrap();
        config.apply_env_overrides();
        env::remove_var("RCM_RATHOLE_BIND_PORT");

        assert_eq!(config.rathole.bind_port, 4444);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let (config, loaded_from) = SyncConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded_from, path);
        assert_eq!(config.server.host, "vps.example.com");
        assert_eq!(config.require_caddyfile().unwrap(), Path::new("/etc/caddy/Caddyfile"));
    }
}
