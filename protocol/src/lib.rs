//! 聊天中继共享协议库
//!
//! 包含:
//! - 消息类型定义 (ChatMessage, Action)
//! - 传输层抽象 (Transport trait)
//! - 帧编解码 (Codec)
//! - 连接封装 (Connection)
//! - 控制台输出串行化 (Console)

mod message;
mod constants;
mod transport;
mod codec;
mod connection;
mod console;
mod error;

pub use message::{Action, ChatMessage};
pub use constants::*;
pub use transport::{Transport, TransportListener, TransportConfig, TcpTransport, TcpListener};
pub use codec::{encode, FrameReader, FrameWriter};
pub use connection::Connection;
pub use console::{Console, ConsoleGuard};
pub use error::{ProtocolError, Result};
