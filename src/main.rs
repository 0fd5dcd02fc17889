//! PTY Bridge CLI 入口点
//!
//! 每个客户端会话对应一个独立的伪终端和子进程。
//! 主要功能：
//! - 通过 stdin/stdout 或 TCP 进行 JSON-RPC 2.0 通信
//! - 会话连接时启动配置的命令，断开时终止子进程
//! - 后台转发所有 PTY 的输出
//!
//! 用法：
//!   pty-bridge                                   # stdio，启动默认 shell
//!   pty-bridge --transport tcp --port 5000       # 每个 TCP 连接一个会话
//!   pty-bridge --command bash --cmd-args='--norc'

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pty_bridge::pty::{CommandVector, LaunchConfig, PtyManager};
use pty_bridge::rpc::{NotificationSender, RpcServer};

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// 通过 stdin/stdout，会话由请求中的 session_id 区分
    Stdio,
    /// 监听 TCP，每个连接一个会话
    Tcp,
}

/// pty-bridge command-line arguments
#[derive(Parser)]
#[command(name = "pty-bridge")]
#[command(about = "Bridge remote clients to interactive shells over per-session PTYs")]
#[command(version)]
struct Args {
    /// Transport to serve JSON-RPC on
    #[arg(long, value_enum, default_value = "stdio")]
    transport: Transport,

    /// Host to bind to (tcp transport)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (tcp transport)
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Command to run in each session (defaults to $SHELL)
    #[arg(long)]
    command: Option<String>,

    /// Arguments for the command, split like a POSIX shell
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    cmd_args: String,

    /// Working directory for spawned commands
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志系统，输出到 stderr 避免干扰 JSON-RPC 通信
    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let command = CommandVector::from_cli(args.command.clone(), &args.cmd_args)
        .context("无效的命令参数")?;
    let config = LaunchConfig::new(command).with_cwd(args.cwd.clone());
    tracing::info!("PTY Bridge 启动，命令: {}", config.command.display());

    let (notification_sender, notification_rx) = NotificationSender::channel();
    let manager = PtyManager::new(config, notification_sender.clone())
        .context("初始化 PTY 管理器失败")?;
    let forwarder = manager
        .start_forwarder()
        .context("启动输出转发器失败")?;
    let server = Arc::new(RpcServer::new(
        manager.clone(),
        notification_sender,
        notification_rx,
    ));

    let interrupted = tokio::select! {
        result = serve(server, &args) => {
            if let Err(e) = &result {
                tracing::error!("服务器错误: {:#}", e);
            }
            result.map(|_| false)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("收到 Ctrl-C，关闭所有会话");
            Ok(true)
        }
    };

    manager.shutdown().await;
    forwarder.stop().await;

    if let Ok(true) = interrupted {
        // stdin 读取线程不会自行结束，直接退出进程
        std::process::exit(0);
    }
    interrupted.map(|_| ())
}

async fn serve(server: Arc<RpcServer>, args: &Args) -> anyhow::Result<()> {
    match args.transport {
        Transport::Stdio => server.run_stdio().await,
        Transport::Tcp => {
            let addr = format!("{}:{}", args.host, args.port);
            server.run_tcp(&addr).await.with_context(|| format!("TCP 服务器 {} 失败", addr))
        }
    }
}
