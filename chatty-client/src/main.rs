//! 聊天室客户端
//!
//! 终端客户端：连接中继服务器后通过 `!s` `!l` `!q` `!c` `!h` 命令交互

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use chatty_client::{start, stdin_lines};
use clap::Parser;
use protocol::{Console, DEFAULT_PORT, PROMPT};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal chat client", long_about = None)]
struct Args {
    /// 注册使用的用户名
    username: String,

    /// 服务器地址
    #[arg(long, default_value = "127.0.0.1")]
    addr: String,

    /// 服务器端口
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() -> Result<ExitCode> {
    // 日志写到 stderr，避免打乱控制台
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.addr, args.port);

    let rt = Runtime::new()?;
    let end = rt.block_on(async {
        let console = Arc::new(Console::with_prompt(tokio::io::stdout(), PROMPT));
        start(&args.username, &addr, console, stdin_lines()).await
    });
    // 标准输入线程可能仍阻塞在读取上，随进程退出即可
    drop(rt);

    Ok(if end.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
