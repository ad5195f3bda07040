//! 控制台输出串行化
//!
//! 所有写控制台（客户端）或本地日志（服务端）的任务共享同一个 [`Console`]，
//! 一个“打印若干行 + 重新打印提示符”的单元在持锁期间完成，不会与其它单元交错。

use tokio::io::{self, AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::{Mutex, MutexGuard};

/// 串行化的控制台
pub struct Console<W = Stdout> {
    out: Mutex<W>,
    prompt: Option<&'static str>,
}

impl Console<Stdout> {
    /// 标准输出，不带提示符
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> Console<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            prompt: None,
        }
    }

    /// 每次打印后都重新输出 `prompt`
    pub fn with_prompt(out: W, prompt: &'static str) -> Self {
        Self {
            out: Mutex::new(out),
            prompt: Some(prompt),
        }
    }

    /// 独占控制台，直到返回的 guard 被释放
    pub async fn lock(&self) -> ConsoleGuard<'_, W> {
        ConsoleGuard {
            out: self.out.lock().await,
            prompt: self.prompt,
        }
    }

    /// 以一个不可分割的单元打印 `text`
    pub async fn print(&self, text: &str) -> io::Result<()> {
        self.lock().await.print(text).await
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

/// 控制台独占访问
pub struct ConsoleGuard<'a, W> {
    out: MutexGuard<'a, W>,
    prompt: Option<&'static str>,
}

impl<W: AsyncWrite + Unpin> ConsoleGuard<'_, W> {
    /// 打印一行（可含换行），随后补上提示符
    pub async fn print(&mut self, text: &str) -> io::Result<()> {
        let unit = match self.prompt {
            Some(prompt) => format!("\r{text}\n{prompt}"),
            None => format!("{text}\n"),
        };
        self.write(&unit).await
    }

    /// 原样输出，不换行也不补提示符
    pub async fn write(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await
    }
}
