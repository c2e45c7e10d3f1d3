//! 同步服务模块
//!
//! 解析 Caddyfile，生成 rathole 配置，上传到两台机器并重启服务

pub mod pipeline;
pub mod stages;
pub mod state;

pub use pipeline::{SyncMode, SyncPipeline};
pub use stages::{CLIENT_UNIT, SERVER_UNIT};
pub use state::{ParsedServices, PipelineState, SyncPlan};
