//! 聊天中继服务端核心
//!
//! - [`registry`]: 用户名 -> 连接句柄的注册表
//! - [`handler`]: 单连接协议状态机
//! - [`server`]: 接受连接的监听循环

pub mod handler;
pub mod registry;
pub mod server;

pub use handler::{ConnectionHandler, Peer};
pub use registry::{Registry, RegistryError};
pub use server::Relay;
