//! 基础设施模块
//!
//! 封装本地进程调用

pub mod command;

pub use command::{CommandError, CommandRunner};
