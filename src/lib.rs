//! rcm - Caddyfile → rathole 同步工具
//!
//! 从带注释的 Caddyfile 中提取服务，生成 rathole 配置，
//! 通过 SSH 上传到 VPS 和家庭机器并重启服务

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod parser;
pub mod services;
