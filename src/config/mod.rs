//! 配置模块
//!
//! 配置文件解析、环境变量覆盖与密钥引用解析

pub mod secrets;
pub mod settings;

pub use settings::{
    expand_path, ClientConfig, HostRole, HostTarget, PathsConfig, RatholeConfig, ServerConfig,
    SyncConfig,
};
