//! rathole 配置渲染
//!
//! 根据服务列表生成 server.toml (VPS) 和 client.toml (家庭机器)

use crate::config::SyncConfig;
use crate::domain::ServiceRecord;
use crate::error::{SyncError, SyncResult};
use crate::services::ssh::split_host_port;

/// 两台机器的配置内容
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedArtifacts {
    pub server: String,
    pub client: String,
}

/// 配置渲染器
pub trait ArtifactRenderer: Send + Sync {
    /// 服务端配置
    fn render_server(&self, config: &SyncConfig, services: &[ServiceRecord]) -> SyncResult<String>;

    /// 客户端配置
    fn render_client(&self, config: &SyncConfig, services: &[ServiceRecord]) -> SyncResult<String>;
}

/// rathole TOML 渲染器
#[derive(Clone, Copy, Debug, Default)]
pub struct RatholeRenderer;

impl ArtifactRenderer for RatholeRenderer {
    fn render_server(&self, config: &SyncConfig, services: &[ServiceRecord]) -> SyncResult<String> {
        let rathole = &config.rathole;
        require_token(config, "server.toml")?;

        let mut out = String::new();
        out.push_str("[server]\n");
        out.push_str(&format!("bind_addr = {}\n", quote(&format!("0.0.0.0:{}", rathole.bind_port))));
        out.push_str(&format!("default_token = {}\n", quote(&rathole.token)));

        if !rathole.server_private_key.is_empty() {
            out.push_str("\n[server.transport]\n");
            out.push_str("type = \"noise\"\n");
            out.push_str("\n[server.transport.noise]\n");
            out.push_str(&format!("local_private_key = {}\n", quote(&rathole.server_private_key)));
        }

        for svc in services {
            out.push('\n');
            // 注释保留域名，方便在 VPS 上排查
            if !svc.domains.is_empty() {
                out.push_str(&format!("# {}\n", svc.domains_display()));
            }
            out.push_str(&format!("[server.services.{}]\n", svc.name));
            out.push_str(&format!(
                "bind_addr = {}\n",
                quote(&format!("0.0.0.0:{}", svc.remote_port))
            ));
        }

        Ok(out)
    }

    fn render_client(&self, config: &SyncConfig, services: &[ServiceRecord]) -> SyncResult<String> {
        let rathole = &config.rathole;
        require_token(config, "client.toml")?;
        if config.server.host.is_empty() {
            return Err(SyncError::Render {
                artifact: "client.toml",
                reason: "server.host is required".to_string(),
            });
        }
        let (server_host, _) = split_host_port(&config.server.host);
        let server_host = if server_host.contains(':') {
            format!("[{}]", server_host)
        } else {
            server_host
        };

        let mut out = String::new();
        out.push_str("[client]\n");
        out.push_str(&format!(
            "remote_addr = {}\n",
            quote(&format!("{}:{}", server_host, rathole.bind_port))
        ));
        out.push_str(&format!("default_token = {}\n", quote(&rathole.token)));

        if !rathole.server_public_key.is_empty() {
            out.push_str("\n[client.transport]\n");
            out.push_str("type = \"noise\"\n");
            out.push_str("\n[client.transport.noise]\n");
            out.push_str(&format!("remote_public_key = {}\n", quote(&rathole.server_public_key)));
        }

        for svc in services {
            out.push('\n');
            out.push_str(&format!("[client.services.{}]\n", svc.name));
            out.push_str(&format!("local_addr = {}\n", quote(&svc.local_addr)));
        }

        Ok(out)
    }
}

fn require_token(config: &SyncConfig, artifact: &'static str) -> SyncResult<()> {
    if config.rathole.token.is_empty() {
        return Err(SyncError::Render {
            artifact,
            reason: "rathole.token is required".to_string(),
        });
    }
    Ok(())
}

/// TOML 基本字符串
///
/// 控制字符必须转义，否则 rathole 无法加载配置
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if c.is_control() => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
