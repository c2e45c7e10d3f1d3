//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod machine;
pub mod render;
pub mod ssh;
pub mod sync;
