//! 单个连接的协议状态机
//!
//! `AwaitHandshake -> Registered -> Closed`。每个连接一个任务，
//! 与其它连接共享的只有注册表。

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    Action, ChatMessage, Console, FrameReader, FrameWriter, TcpTransport, Transport,
    CONNECT_OK, EMPTY_ROSTER, MAX_USERNAME_LEN, ROSTER_HEADER,
};
use tokio::io::AsyncWrite;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::registry::{Registry, RegistryError};

/// 注册表中的连接句柄
///
/// 写端由互斥锁保护：多个发送者同时发往同一目的地时串行，
/// 不同目的地之间互不影响。
pub struct Peer {
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
}

impl Peer {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(FrameWriter::new(writer)),
        }
    }

    pub async fn send(&self, msg: &ChatMessage) -> protocol::Result<()> {
        self.writer.lock().await.send(msg).await
    }

    pub async fn close(&self) -> protocol::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

/// 连接状态
enum State {
    AwaitHandshake,
    Registered { username: String },
    Closed,
}

/// 连接处理器
pub struct ConnectionHandler<W> {
    reader: FrameReader<OwnedReadHalf>,
    peer: Arc<Peer>,
    peer_addr: SocketAddr,
    registry: Arc<Registry<Peer>>,
    console: Arc<Console<W>>,
}

impl<W: AsyncWrite + Unpin + Send> ConnectionHandler<W> {
    pub fn new(
        transport: TcpTransport,
        registry: Arc<Registry<Peer>>,
        console: Arc<Console<W>>,
    ) -> Self {
        let peer_addr = transport.peer_addr();
        let (reader, writer) = transport.split();
        Self {
            reader: FrameReader::new(reader),
            peer: Arc::new(Peer::new(writer)),
            peer_addr,
            registry,
            console,
        }
    }

    /// 运行状态机直到 `Closed`
    pub async fn run(mut self) {
        let mut state = State::AwaitHandshake;
        loop {
            state = match state {
                State::AwaitHandshake => self.handshake().await,
                State::Registered { username } => self.serve_one(username).await,
                State::Closed => break,
            };
        }
        debug!("Handler for {} finished", self.peer_addr);
    }

    async fn handshake(&mut self) -> State {
        let msg = match self.reader.recv::<ChatMessage>().await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Handshake read from {} failed: {}", self.peer_addr, e);
                return State::Closed;
            }
        };

        if msg.action != Action::Connect {
            warn!("{} sent {:?} before CONNECT", self.peer_addr, msg.action);
            self.reply(ChatMessage::error("Protocol Error")).await;
            return State::Closed;
        }

        let username = msg.username;
        if username.len() > MAX_USERNAME_LEN {
            debug!("Rejected oversized username from {}", self.peer_addr);
            self.reply(ChatMessage::error(format!(
                "Username too long (max {MAX_USERNAME_LEN} bytes). Please choose a different one"
            )))
            .await;
            return State::Closed;
        }

        match self
            .registry
            .try_register(&username, Arc::clone(&self.peer))
            .await
        {
            Ok(()) => {
                self.reply(ChatMessage::new(Action::Connect, username.as_str(), CONNECT_OK))
                    .await;
                debug!("User {} registered from {}", username, self.peer_addr);
                self.announce(&format!("new connection accepted. user: {username}"))
                    .await;
                State::Registered { username }
            }
            Err(RegistryError::Duplicate(_)) => {
                debug!("Rejected duplicate username {} from {}", username, self.peer_addr);
                let body =
                    format!("Username {username} not available. Please choose a different one");
                self.reply(ChatMessage::new(Action::Error, username, body))
                    .await;
                State::Closed
            }
        }
    }

    /// 处理一条来自已注册客户端的消息
    async fn serve_one(&mut self, username: String) -> State {
        let msg = match self.reader.recv::<ChatMessage>().await {
            Ok(msg) => msg,
            Err(e) => {
                if e.is_closed() {
                    debug!("User {} closed the connection", username);
                } else {
                    warn!("Error receiving from {}: {}", username, e);
                }
                self.deregister(&username).await;
                return State::Closed;
            }
        };

        match msg.action {
            Action::Msg => {
                self.forward(&username, msg).await;
                State::Registered { username }
            }
            Action::List => {
                let roster = self.roster(&username).await;
                self.reply(ChatMessage::list(roster)).await;
                State::Registered { username }
            }
            Action::Disconnect => {
                self.deregister(&username).await;
                self.reply(ChatMessage::disconnect()).await;
                State::Closed
            }
            Action::Connect | Action::Error => {
                warn!("User {} sent invalid action {:?}", username, msg.action);
                self.reply(ChatMessage::error("invalid purpose. Disconnecting."))
                    .await;
                if let Err(e) = self.peer.close().await {
                    debug!("Failed to close connection of {}: {}", username, e);
                }
                self.deregister(&username).await;
                State::Closed
            }
        }
    }

    /// 转发给 `msg.username`；目的用户不在线时回复错误，注册表不变
    async fn forward(&self, sender: &str, msg: ChatMessage) {
        let dest = msg.username.clone();
        match self.registry.lookup(&dest).await {
            Some(target) => {
                debug!("Forwarding message from {} to {}", sender, dest);
                if let Err(e) = target.send(&msg).await {
                    warn!("Failed to forward message from {} to {}: {}", sender, dest, e);
                }
            }
            None => {
                self.reply(ChatMessage::error(format!("{dest} is not currently connected")))
                    .await;
            }
        }
    }

    async fn roster(&self, username: &str) -> String {
        let others = self.registry.list_others(username).await;
        if others.is_empty() {
            return format!("{ROSTER_HEADER}{EMPTY_ROSTER}");
        }
        let mut roster = ROSTER_HEADER.to_string();
        for name in others {
            roster.push('\n');
            roster.push_str(&name);
        }
        roster
    }

    async fn deregister(&self, username: &str) {
        self.registry.remove(username).await;
        debug!("User {} deregistered", username);
        self.announce(&format!("{username} disconnected.")).await;
    }

    /// 回复当前客户端；过长的消息体被截断，保证回复总能发出
    async fn reply(&self, mut msg: ChatMessage) {
        if msg.fit_to_frame() {
            debug!("Truncated {:?} reply to {}", msg.action, self.peer_addr);
        }
        if let Err(e) = self.peer.send(&msg).await {
            debug!("Failed to reply to {}: {}", self.peer_addr, e);
        }
    }

    async fn announce(&self, text: &str) {
        if let Err(e) = self.console.print(text).await {
            warn!("Failed to write to console: {}", e);
        }
    }
}
