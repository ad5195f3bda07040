//! 消息类型定义
//!
//! 双向只有一种消息 [`ChatMessage`]，`username` 的含义随 `action` 而变：
//! 客户端发出的 `Msg` 中表示目的用户，`Connect` 中表示自己的用户名。

use serde::{Deserialize, Serialize};

use crate::MAX_FRAME_SIZE;

/// bincode 编码中字符串内容以外的固定开销：两个 u64 长度前缀 + u32 变体索引
const ENVELOPE_SIZE: usize = 8 + 8 + 4;

/// 消息动作
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// 客户端 -> 服务端：注册用户名；服务端回复 `ok` 表示成功
    Connect,
    /// 双向：投递消息体
    Msg,
    /// 请求 / 返回在线用户列表
    List,
    /// 双向：正常关闭
    Disconnect,
    /// 服务端 -> 客户端：错误描述
    Error,
}

/// 聊天消息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub username: String,
    pub body: String,
    pub action: Action,
}

impl ChatMessage {
    pub fn new(action: Action, username: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            body: body.into(),
            action,
        }
    }

    /// 注册请求
    pub fn connect(username: impl Into<String>) -> Self {
        Self::new(Action::Connect, username, "")
    }

    /// 发往 `username` 的消息
    pub fn msg(username: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Action::Msg, username, body)
    }

    pub fn list(body: impl Into<String>) -> Self {
        Self::new(Action::List, "", body)
    }

    pub fn disconnect() -> Self {
        Self::new(Action::Disconnect, "", "")
    }

    pub fn error(body: impl Into<String>) -> Self {
        Self::new(Action::Error, "", body)
    }

    /// 截断消息体使整条消息能装进一帧，返回是否发生了截断
    ///
    /// 在字符边界截断；用户名本身不做处理。
    pub fn fit_to_frame(&mut self) -> bool {
        let limit = MAX_FRAME_SIZE.saturating_sub(ENVELOPE_SIZE + self.username.len());
        if self.body.len() <= limit {
            return false;
        }
        let mut end = limit;
        while !self.body.is_char_boundary(end) {
            end -= 1;
        }
        self.body.truncate(end);
        true
    }
}
