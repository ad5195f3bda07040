//! 中继服务器：接受连接并为每个连接启动一个处理任务

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{Console, TcpListener, TcpTransport, TransportListener};
use tokio::io::{AsyncWrite, Stdout};
use tracing::{error, info, warn};

use crate::handler::{ConnectionHandler, Peer};
use crate::registry::Registry;

/// 聊天中继服务器
///
/// 连接数不设上限，每个连接一个任务；接受循环从不等待处理任务。
pub struct Relay<W = Stdout> {
    listener: TcpListener,
    registry: Arc<Registry<Peer>>,
    console: Arc<Console<W>>,
}

impl Relay<Stdout> {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_console(listener, Arc::new(Console::stdout()))
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Relay<W> {
    pub fn with_console(listener: TcpListener, console: Arc<Console<W>>) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            console,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry<Peer>> {
        Arc::clone(&self.registry)
    }

    /// 运行直到收到 Ctrl+C
    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// 运行直到 `shutdown` 完成；只停止接受新连接，已有连接继续由各自任务处理
    pub async fn run_until<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!("Server listening on {}", addr);
        self.console.print(&format!("Listening on {addr}")).await?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(transport) => self.spawn_handler(transport),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_handler(&self, transport: TcpTransport) {
        let handler = ConnectionHandler::new(
            transport,
            Arc::clone(&self.registry),
            Arc::clone(&self.console),
        );
        tokio::spawn(handler.run());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use protocol::{
        Action, ChatMessage, Connection, TcpTransport, Transport, TransportConfig,
        MAX_USERNAME_LEN, ROSTER_HEADER,
    };
    use tokio::io::{AsyncWriteExt, Sink};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    type Conn = Connection<OwnedReadHalf, OwnedWriteHalf>;

    struct TestRelay {
        addr: SocketAddr,
        registry: Arc<Registry<Peer>>,
        shutdown_tx: oneshot::Sender<()>,
        task: JoinHandle<anyhow::Result<()>>,
    }

    async fn start_relay() -> TestRelay {
        let console: Arc<Console<Sink>> = Arc::new(Console::new(tokio::io::sink()));
        start_relay_with(console).await
    }

    async fn start_relay_with<W>(console: Arc<Console<W>>) -> TestRelay
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Relay::with_console(listener, console);
        let addr = relay.local_addr().unwrap();
        let registry = relay.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            relay
                .run_until(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        TestRelay {
            addr,
            registry,
            shutdown_tx,
            task,
        }
    }

    async fn open(addr: SocketAddr) -> Conn {
        let transport = TcpTransport::connect(&addr.to_string(), &TransportConfig::default())
            .await
            .unwrap();
        Connection::new(transport)
    }

    async fn recv(conn: &mut Conn) -> ChatMessage {
        timeout(WAIT, conn.recv()).await.unwrap().unwrap()
    }

    async fn join(addr: SocketAddr, username: &str) -> Conn {
        let mut conn = open(addr).await;
        conn.send(&ChatMessage::connect(username)).await.unwrap();
        let reply = recv(&mut conn).await;
        assert_eq!(reply, ChatMessage::new(Action::Connect, username, "ok"));
        conn
    }

    /// 等待对端关闭连接
    async fn expect_closed(conn: &mut Conn) {
        let result = timeout(WAIT, conn.recv()).await.unwrap();
        assert!(result.is_err(), "expected closed connection, got {result:?}");
    }

    async fn wait_until_absent(registry: &Registry<Peer>, username: &str) {
        timeout(WAIT, async {
            while registry.contains(username).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn roster_names(body: &str) -> Vec<String> {
        body.strip_prefix(ROSTER_HEADER)
            .unwrap()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_list_returns_other_users() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;
        let _bob = join(relay.addr, "bob").await;

        alice.send(&ChatMessage::list("")).await.unwrap();
        let reply = recv(&mut alice).await;
        assert_eq!(reply.action, Action::List);
        assert_eq!(roster_names(&reply.body), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_list_contains_every_other_user_once() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;
        let mut others = Vec::new();
        for name in ["erin", "bob", "carol", "dave"] {
            others.push(join(relay.addr, name).await);
        }

        alice.send(&ChatMessage::list("")).await.unwrap();
        let names = roster_names(&recv(&mut alice).await.body);
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(names.len(), 4);
        assert_eq!(unique.len(), 4);
        assert!(!names.contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn test_list_when_alone() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;

        alice.send(&ChatMessage::list("")).await.unwrap();
        let reply = recv(&mut alice).await;
        assert_eq!(reply.body, "List of connected clients: (None)");
    }

    #[tokio::test]
    async fn test_message_delivered_to_destination() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;
        let mut bob = join(relay.addr, "bob").await;

        alice
            .send(&ChatMessage::msg("bob", "alice: hi bob"))
            .await
            .unwrap();
        assert_eq!(recv(&mut bob).await, ChatMessage::msg("bob", "alice: hi bob"));

        bob.send(&ChatMessage::msg("alice", "bob: hey")).await.unwrap();
        assert_eq!(recv(&mut alice).await.body, "bob: hey");
    }

    #[tokio::test]
    async fn test_message_to_unknown_user() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;

        alice
            .send(&ChatMessage::msg("carol", "alice: anyone?"))
            .await
            .unwrap();
        let reply = recv(&mut alice).await;
        assert_eq!(reply.action, Action::Error);
        assert_eq!(reply.body, "carol is not currently connected");
        assert_eq!(relay.registry.len().await, 1);

        // 连接仍然可用
        alice.send(&ChatMessage::list("")).await.unwrap();
        assert_eq!(recv(&mut alice).await.action, Action::List);
    }

    #[tokio::test]
    async fn test_disconnect_deregisters_and_replies() {
        let relay = start_relay().await;
        let _alice = join(relay.addr, "alice").await;
        let mut bob = join(relay.addr, "bob").await;

        bob.send(&ChatMessage::disconnect()).await.unwrap();
        assert_eq!(recv(&mut bob).await.action, Action::Disconnect);
        assert!(!relay.registry.contains("bob").await);
        assert!(relay.registry.contains("alice").await);
        expect_closed(&mut bob).await;

        // 用户名可以立即被其它连接使用
        let _bob_again = join(relay.addr, "bob").await;
    }

    #[tokio::test]
    async fn test_transport_loss_frees_username() {
        let relay = start_relay().await;
        let alice = join(relay.addr, "alice").await;
        drop(alice);

        wait_until_absent(&relay.registry, "alice").await;
        let _alice_again = join(relay.addr, "alice").await;
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_connect() {
        let relay = start_relay().await;

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let addr = relay.addr;
                tokio::spawn(async move {
                    let mut conn = open(addr).await;
                    conn.send(&ChatMessage::connect("dave")).await.unwrap();
                    let reply = recv(&mut conn).await;
                    (reply, conn)
                })
            })
            .collect();

        let mut replies = Vec::new();
        let mut conns = Vec::new();
        for attempt in attempts {
            let (reply, conn) = attempt.await.unwrap();
            replies.push(reply);
            conns.push(conn);
        }

        let ok = replies
            .iter()
            .filter(|r| r.action == Action::Connect && r.body == "ok")
            .count();
        let errors: Vec<_> = replies.iter().filter(|r| r.action == Action::Error).collect();
        assert_eq!(ok, 1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].body.contains("dave"));
        assert!(errors[0].body.contains("not available"));
        assert_eq!(relay.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_connection_is_closed() {
        let relay = start_relay().await;
        let _first = join(relay.addr, "dave").await;

        let mut second = open(relay.addr).await;
        second.send(&ChatMessage::connect("dave")).await.unwrap();
        let reply = recv(&mut second).await;
        assert_eq!(
            reply.body,
            "Username dave not available. Please choose a different one"
        );
        expect_closed(&mut second).await;
    }

    #[tokio::test]
    async fn test_first_message_must_be_connect() {
        let relay = start_relay().await;
        let mut conn = open(relay.addr).await;

        conn.send(&ChatMessage::list("")).await.unwrap();
        let reply = recv(&mut conn).await;
        assert_eq!(reply.action, Action::Error);
        assert_eq!(reply.body, "Protocol Error");
        expect_closed(&mut conn).await;
        assert!(relay.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_action_while_registered() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;

        alice.send(&ChatMessage::connect("alice")).await.unwrap();
        let reply = recv(&mut alice).await;
        assert_eq!(reply.action, Action::Error);
        assert_eq!(reply.body, "invalid purpose. Disconnecting.");
        expect_closed(&mut alice).await;
        wait_until_absent(&relay.registry, "alice").await;
    }

    #[tokio::test]
    async fn test_broken_connection_does_not_affect_others() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;

        let mut garbage = tokio::net::TcpStream::connect(relay.addr).await.unwrap();
        garbage.write_all(&[0xff; 16]).await.unwrap();
        drop(garbage);

        alice.send(&ChatMessage::list("")).await.unwrap();
        assert_eq!(recv(&mut alice).await.action, Action::List);
        let _bob = join(relay.addr, "bob").await;
    }

    #[tokio::test]
    async fn test_oversized_unknown_destination_gets_one_error() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;

        let dest = "x".repeat(8150);
        alice.send(&ChatMessage::msg(dest.as_str(), "hi")).await.unwrap();
        let reply = recv(&mut alice).await;
        assert_eq!(reply.action, Action::Error);
        assert!(reply.body.starts_with(&dest[..100]));
        assert_eq!(relay.registry.len().await, 1);

        // 只有一条错误，下一条回复就是 LIST
        alice.send(&ChatMessage::list("")).await.unwrap();
        assert_eq!(recv(&mut alice).await.action, Action::List);
    }

    #[tokio::test]
    async fn test_username_length_limit() {
        let relay = start_relay().await;

        let mut conn = open(relay.addr).await;
        conn.send(&ChatMessage::connect("a".repeat(MAX_USERNAME_LEN + 1)))
            .await
            .unwrap();
        let reply = recv(&mut conn).await;
        assert_eq!(reply.action, Action::Error);
        assert!(reply.body.contains("too long"));
        expect_closed(&mut conn).await;
        assert!(relay.registry.is_empty().await);

        let _longest = join(relay.addr, &"a".repeat(MAX_USERNAME_LEN)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_to_same_destination() {
        const SENDERS: usize = 4;
        const PER_SENDER: usize = 50;

        let relay = start_relay().await;
        let mut bob = join(relay.addr, "bob").await;
        let mut carol = join(relay.addr, "carol").await;
        let mut senders = Vec::new();
        for i in 0..SENDERS {
            senders.push(join(relay.addr, &format!("sender{i}")).await);
        }

        let tasks: Vec<_> = senders
            .into_iter()
            .enumerate()
            .map(|(i, mut conn)| {
                tokio::spawn(async move {
                    for j in 0..PER_SENDER {
                        let body = format!("sender{i}: {j}");
                        conn.send(&ChatMessage::msg("bob", body.as_str())).await.unwrap();
                        conn.send(&ChatMessage::msg("carol", body)).await.unwrap();
                    }
                    conn
                })
            })
            .collect();

        for dest in [&mut bob, &mut carol] {
            // 每个发送者的消息按发送顺序到达，且每一帧都完整
            let mut next = [0usize; SENDERS];
            for _ in 0..SENDERS * PER_SENDER {
                let msg = recv(dest).await;
                assert_eq!(msg.action, Action::Msg);
                let (sender, seq) = msg.body.split_once(": ").unwrap();
                let i: usize = sender.strip_prefix("sender").unwrap().parse().unwrap();
                let j: usize = seq.parse().unwrap();
                assert_eq!(j, next[i]);
                next[i] += 1;
            }
            assert_eq!(next, [PER_SENDER; SENDERS]);
        }

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_console_notices_printed_once() {
        let console = Arc::new(Console::new(Vec::new()));
        let relay = start_relay_with(Arc::clone(&console)).await;

        let mut alice = join(relay.addr, "alice").await;
        alice.send(&ChatMessage::disconnect()).await.unwrap();
        assert_eq!(recv(&mut alice).await.action, Action::Disconnect);
        expect_closed(&mut alice).await;

        relay.shutdown_tx.send(()).unwrap();
        timeout(WAIT, relay.task).await.unwrap().unwrap().unwrap();
        // 处理任务退出后才会释放控制台
        timeout(WAIT, async {
            while Arc::strong_count(&console) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let console = Arc::try_unwrap(console).ok().unwrap();
        let out = String::from_utf8(console.into_inner()).unwrap();
        assert!(out.starts_with("Listening on 127.0.0.1:"));
        assert_eq!(out.matches("new connection accepted. user: alice\n").count(), 1);
        assert_eq!(out.matches("alice disconnected.\n").count(), 1);
    }

    #[tokio::test]
    async fn test_run_until_stops_accepting() {
        let relay = start_relay().await;
        let mut alice = join(relay.addr, "alice").await;

        relay.shutdown_tx.send(()).unwrap();
        timeout(WAIT, relay.task).await.unwrap().unwrap().unwrap();

        // 已建立的连接继续由其任务处理
        alice.send(&ChatMessage::list("")).await.unwrap();
        assert_eq!(recv(&mut alice).await.action, Action::List);
    }
}
