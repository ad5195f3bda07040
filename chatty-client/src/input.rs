//! 控制台输入读取
//!
//! 输入源是一个按行的通道：正式运行时由专门的阻塞线程读取标准输入，
//! 测试中直接向通道写入。

use std::io::BufRead;
use std::sync::Arc;

use protocol::{Console, PROMPT};
use tokio::io::{self, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// 发送消息
pub const SEND_MSG: &str = "!s";
/// 列出其他在线用户
pub const LIST: &str = "!l";
/// 退出
pub const QUIT: &str = "!q";
/// 撰写消息时取消
pub const CANCEL: &str = "!c";
/// 帮助
pub const HELP: &str = "!h";

/// 输入读取器交给调度循环的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRequest {
    Msg { to: String, body: String },
    List,
    Disconnect,
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Send,
    List,
    Quit,
    Help,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    /// 精确匹配，区分大小写
    fn parse(token: &'a str) -> Self {
        match token {
            SEND_MSG => Command::Send,
            LIST => Command::List,
            QUIT => Command::Quit,
            HELP => Command::Help,
            other => Command::Unknown(other),
        }
    }
}

pub fn help_text() -> String {
    format!(
        "List of commands:\n\
         {SEND_MSG}\tsend a message\n\
         {LIST}\tget the list of other connected clients\n\
         {QUIT}\tquit the app\n\
         {CANCEL}\tcancel a message (while writing one)\n\
         {HELP}\tget help"
    )
}

/// 在独立线程中逐行读取标准输入
///
/// 接收端被丢弃后，线程在下一行输入到来时退出。
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("Stdin reader finished");
    });
    rx
}

/// 等待关闭请求；发送端被丢弃同样视为关闭
pub(crate) async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closing| *closing).await;
}

/// 输入读取器
pub struct InputReader<W> {
    lines: mpsc::Receiver<String>,
    requests: mpsc::Sender<InputRequest>,
    console: Arc<Console<W>>,
    closing: watch::Receiver<bool>,
}

impl<W: AsyncWrite + Unpin + Send> InputReader<W> {
    pub fn new(
        lines: mpsc::Receiver<String>,
        requests: mpsc::Sender<InputRequest>,
        console: Arc<Console<W>>,
        closing: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lines,
            requests,
            console,
            closing,
        }
    }

    /// 读取命令直到退出、输入结束或收到关闭请求
    pub async fn run(mut self) -> io::Result<()> {
        self.console.lock().await.write(PROMPT).await?;

        while let Some(line) = self.next_line().await {
            match Command::parse(&line) {
                Command::Send => {
                    if let Some(request) = self.compose().await? {
                        if !self.hand_off(request).await {
                            break;
                        }
                    }
                }
                Command::List => {
                    if !self.hand_off(InputRequest::List).await {
                        break;
                    }
                }
                Command::Quit => {
                    self.hand_off(InputRequest::Disconnect).await;
                    break;
                }
                Command::Help => {
                    self.console.print(&help_text()).await?;
                    continue;
                }
                Command::Unknown(token) => {
                    let warning = format!(
                        "{token} is not a valid command. Type \"{HELP}\" to see the list of valid commands"
                    );
                    self.console.print(&warning).await?;
                    continue;
                }
            }
            self.console.lock().await.write(PROMPT).await?;
        }

        debug!("Input reader finished");
        Ok(())
    }

    /// 询问目的用户和消息内容；取消或关闭时返回 `None`
    ///
    /// 整个过程独占控制台，收到的消息会在撰写完成后才打印。
    async fn compose(&mut self) -> io::Result<Option<InputRequest>> {
        let console = Arc::clone(&self.console);
        let mut console = console.lock().await;

        console.write("Enter destination username: ").await?;
        let Some(to) = self.next_line().await else {
            return Ok(None);
        };
        if to == CANCEL {
            console.write("message cancelled\n").await?;
            return Ok(None);
        }

        console.write("Enter message to send: ").await?;
        let Some(body) = self.next_line().await else {
            return Ok(None);
        };
        if body == CANCEL {
            console.write("message cancelled\n").await?;
            return Ok(None);
        }

        Ok(Some(InputRequest::Msg { to, body }))
    }

    async fn next_line(&mut self) -> Option<String> {
        tokio::select! {
            _ = closed(&mut self.closing) => None,
            line = self.lines.recv() => line,
        }
    }

    /// 交给调度循环，等待其接收；关闭时放弃并返回 false
    async fn hand_off(&mut self, request: InputRequest) -> bool {
        tokio::select! {
            _ = closed(&mut self.closing) => false,
            sent = self.requests.send(request) => sent.is_ok(),
        }
    }
}
