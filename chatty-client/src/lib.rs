//! 终端聊天客户端核心
//!
//! - [`client`]: 会话协调（接收任务、输入任务、调度循环）
//! - [`input`]: 控制台命令读取

pub mod client;
pub mod input;

pub use client::{start, SessionEnd};
pub use input::{stdin_lines, InputReader, InputRequest};
