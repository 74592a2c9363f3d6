// sshmux - 对单台主机执行一次状态采集，或打开交互终端
//
// 用法: sshmux <user@host> [port] [--shell]
// 密码从环境变量 SSHMUX_SECRET 读取，或使用 SSHMUX_KEY 指定私钥文件

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sshmux::models::settings::{Settings, TerminalSettings};
use sshmux::services::{fetch_stats, storage, ShellEvent, TerminalInput, TerminalService};
use sshmux::ssh::{AuthMethod, Credentials, SshConfig, SshError, SshManager};

const USAGE: &str = "用法: sshmux <user@host> [port] [--shell]";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug sshmux u@h
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false) // 不显示 target（模块路径）
        .init();

    let mut args = std::env::args().skip(1);
    let target = args.next().context(USAGE)?;
    let Some((username, host)) = target.split_once('@') else {
        bail!("目标格式应为 user@host: {}", target);
    };

    let settings: Settings = storage::load_settings()?;
    let mut connection = settings.connection.clone();
    let mut shell = false;
    for arg in args {
        if arg == "--shell" {
            shell = true;
        } else {
            connection.port = arg.parse().with_context(|| format!("无效端口: {}", arg))?;
        }
    }

    let credentials = Credentials::new(
        host,
        username,
        std::env::var("SSHMUX_SECRET").unwrap_or_default(),
    );
    let mut config = SshConfig::from_credentials(&credentials, &connection);
    if let Ok(key_path) = std::env::var("SSHMUX_KEY") {
        config.auth = AuthMethod::PublicKey {
            key_path: PathBuf::from(key_path),
            passphrase: std::env::var("SSHMUX_PASSPHRASE").ok(),
        };
    }

    let manager = Arc::new(SshManager::with_settings(connection));

    let result = if shell {
        run_shell(manager.clone(), &settings.terminal, &credentials, config).await
    } else {
        run_stats(&manager, &credentials, config).await
    };
    manager.release_all(&credentials.identity()).await;

    result.with_context(|| format!("{} 操作失败", target))
}

async fn run_stats(manager: &SshManager, credentials: &Credentials, config: SshConfig) -> Result<()> {
    let identity = credentials.identity_for("stats");
    let snapshot: Result<_, SshError> = async {
        let conn = manager.acquire_with(&identity, config).await?;
        fetch_stats(&conn).await
    }
    .await;
    let snapshot = snapshot?;

    info!("[Main] Stats collected for {}", identity);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// 按行读取 stdin 写入远端 Shell，远端输出直接打印
async fn run_shell(
    manager: Arc<SshManager>,
    terminal: &TerminalSettings,
    credentials: &Credentials,
    config: SshConfig,
) -> Result<()> {
    let identity = credentials.identity_for("shell");
    // 先用完整配置建立连接，输出流随后复用同一个会话
    manager.acquire_with(&identity, config).await?;

    let service = Arc::new(TerminalService::new(manager, terminal.pty_request()));
    let mut events = service.open_shell_stream(&identity, credentials).await;

    // stdin 读取会阻塞，放在独立线程
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    let input = tokio::spawn({
        let service = service.clone();
        let identity = identity.clone();
        async move {
            while let Some(line) = line_rx.recv().await {
                let input = TerminalInput::Data {
                    identity: identity.clone(),
                    data: format!("{}\n", line),
                };
                if let Err(e) = service.send_input(input).await {
                    warn!("[Main] Failed to send input: {}", e);
                    break;
                }
            }
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = loop {
        match events.next().await {
            Some(ShellEvent::Output(text)) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            Some(ShellEvent::Exit(reason)) => {
                info!("[Main] Shell exited: {}", reason);
                break Ok(());
            }
            Some(ShellEvent::Error(message)) => break Err(anyhow::anyhow!("终端出错: {}", message)),
            None => break Ok(()),
        }
    };

    input.abort();
    outcome
}
