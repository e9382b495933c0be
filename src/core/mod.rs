// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod config;
pub mod convert;
pub mod error;

use std::process;
use std::thread;

pub use types::*;
pub use clock::*;
pub use config::*;
pub use error::*;

/// 日志上下文：进程 ID + 线程 ID
pub fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
