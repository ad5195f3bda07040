//! 聊天客户端核心实现
//!
//! 三个并发单元：
//! - 接收任务：从服务器逐条解码消息交给调度循环，失败时发出一次“断开”信号
//! - 输入任务：读取控制台命令，把请求交给调度循环
//! - 调度循环：每次只处理一个就绪事件，所有对服务器的发送都在这里完成
//!
//! 交接通道容量为 1。退出前总是先关闭输入源并等待所有任务结束。

use std::sync::Arc;

use protocol::{
    Action, ChatMessage, Connection, Console, FrameReader, FrameWriter, ProtocolError,
    TcpTransport, Transport, TransportConfig,
};
use tokio::io::AsyncWrite;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::input::{closed, InputReader, InputRequest, HELP};

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 未能进入会话（用户名为空、无法连接或被服务器拒绝）
    NotStarted,
    /// 服务器确认断开
    Disconnected,
    /// 与服务器的连接丢失
    ConnectionLost,
}

impl SessionEnd {
    /// 只有服务器确认的断开才算正常退出
    pub fn is_clean(&self) -> bool {
        matches!(self, SessionEnd::Disconnected)
    }
}

/// 连接服务器、注册用户名，成功后运行会话直到结束
pub async fn start<W>(
    username: &str,
    addr: &str,
    console: Arc<Console<W>>,
    lines: mpsc::Receiver<String>,
) -> SessionEnd
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    if username.is_empty() {
        show(&console, "Please provide a non empty username").await;
        return SessionEnd::NotStarted;
    }

    let transport = match TcpTransport::connect(addr, &TransportConfig::default()).await {
        Ok(transport) => transport,
        Err(e) => {
            show(&console, &format!("unable to connect to server: {e}")).await;
            return SessionEnd::NotStarted;
        }
    };
    let mut conn = Connection::new(transport);

    let reply = match register(&mut conn, username).await {
        Ok(reply) => reply,
        Err(e) => {
            show(&console, &format!("ERROR: {e}")).await;
            return SessionEnd::NotStarted;
        }
    };
    show(&console, "connected to server").await;

    if reply.action == Action::Error {
        show(&console, &format!("ERROR: {}", reply.body)).await;
        if let Err(e) = conn.close().await {
            debug!("Failed to close rejected connection: {}", e);
        }
        return SessionEnd::NotStarted;
    }

    info!("Joined relay at {} as {}", addr, username);
    show(
        &console,
        &format!(
            "Welcome to the chatty app! A terminal based chat application.\n\
             You can see the available commands by typing \"{HELP}\""
        ),
    )
    .await;

    let (reader, writer) = conn.split();
    Session {
        username: username.to_string(),
        reader,
        writer,
        console,
        lines,
    }
    .run()
    .await
}

async fn register(
    conn: &mut Connection<OwnedReadHalf, OwnedWriteHalf>,
    username: &str,
) -> protocol::Result<ChatMessage> {
    conn.send(&ChatMessage::connect(username)).await?;
    conn.recv().await
}

/// 已注册的会话
struct Session<W> {
    username: String,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    console: Arc<Console<W>>,
    lines: mpsc::Receiver<String>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Session<W> {
    async fn run(self) -> SessionEnd {
        let Session {
            username,
            reader,
            mut writer,
            console,
            lines,
        } = self;

        let (close_tx, close_rx) = watch::channel(false);
        let (input_tx, mut input_rx) = mpsc::channel::<InputRequest>(1);
        let (net_tx, mut net_rx) = mpsc::channel::<ChatMessage>(1);
        let (lost_tx, mut lost_rx) = oneshot::channel::<()>();

        let workers = Workers {
            close_tx,
            receiver: tokio::spawn(receive(reader, net_tx, lost_tx, close_rx.clone())),
            input: tokio::spawn(
                InputReader::new(lines, input_tx, Arc::clone(&console), close_rx).run(),
            ),
        };

        // 已收到的服务器消息优先于随后的断开信号
        loop {
            tokio::select! {
                biased;

                Some(msg) = net_rx.recv() => match msg.action {
                    Action::Msg | Action::List => show(&console, &msg.body).await,
                    Action::Error => show(&console, &format!("error: {}", msg.body)).await,
                    Action::Disconnect => {
                        workers.close();
                        show(&console, "Disconnecting").await;
                        if let Err(e) = writer.shutdown().await {
                            debug!("Failed to close relay connection: {}", e);
                        }
                        workers.join().await;
                        return SessionEnd::Disconnected;
                    }
                    Action::Connect => debug!("Ignoring unexpected CONNECT from relay"),
                },

                _ = &mut lost_rx => {
                    // 先关闭输入源，释放可能被撰写中的提示占用的控制台
                    workers.close();
                    show(&console, "Connection lost. Exiting").await;
                    workers.join().await;
                    return SessionEnd::ConnectionLost;
                }

                Some(request) = input_rx.recv() => {
                    let msg = match request {
                        InputRequest::Msg { to, body } => {
                            ChatMessage::msg(to, format!("{username}: {body}"))
                        }
                        InputRequest::List => ChatMessage::list(""),
                        InputRequest::Disconnect => ChatMessage::disconnect(),
                    };
                    if let Err(e) = writer.send(&msg).await {
                        warn!("Failed to send {:?} to relay: {}", msg.action, e);
                    }
                }
            }
        }
    }
}

/// 正在运行的后台任务
struct Workers {
    close_tx: watch::Sender<bool>,
    receiver: JoinHandle<()>,
    input: JoinHandle<std::io::Result<()>>,
}

impl Workers {
    /// 请求所有任务退出；输入任务随即停止读取输入源
    fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// 关闭输入源并等待所有任务退出
    async fn join(self) {
        self.close();

        if let Err(e) = self.receiver.await {
            warn!("Receiver task failed: {}", e);
        }
        match self.input.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Input reader failed: {}", e),
            Err(e) => warn!("Input task failed: {}", e),
        }
        debug!("All session workers finished");
    }
}

/// 接收任务
async fn receive(
    mut reader: FrameReader<OwnedReadHalf>,
    net_tx: mpsc::Sender<ChatMessage>,
    lost_tx: oneshot::Sender<()>,
    mut closing: watch::Receiver<bool>,
) {
    let error: ProtocolError = loop {
        let result = tokio::select! {
            _ = closed(&mut closing) => return,
            result = reader.recv::<ChatMessage>() => result,
        };
        match result {
            Ok(msg) => {
                tokio::select! {
                    _ = closed(&mut closing) => return,
                    sent = net_tx.send(msg) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => break e,
        }
    };

    debug!("Relay connection failed: {}", error);
    let _ = lost_tx.send(());
}

async fn show<W: AsyncWrite + Unpin>(console: &Console<W>, text: &str) {
    if let Err(e) = console.print(text).await {
        warn!("Failed to write to console: {}", e);
    }
}
