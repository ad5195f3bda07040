//! 聊天中继服务端
//!
//! 基于 Tokio 的异步 TCP 服务器：按用户名登记客户端并在它们之间转发消息。

use anyhow::{Context, Result};
use chatty_relay::Relay;
use clap::Parser;
use protocol::{TcpListener, TransportListener};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal chat relay", long_about = None)]
struct Args {
    /// 监听地址，端口为 0 时由系统分配
    #[arg(long, default_value = DEFAULT_ADDR)]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("chatty_relay=debug".parse()?)
                .add_directive("protocol=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Chat relay starting on {}", args.listen);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    Relay::new(listener).run().await
}
