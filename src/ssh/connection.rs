// 连接与通道复用
//
// Transport: 一条已认证的 SSH 传输，可在其上并发打开多个通道
// Connector: 负责建立 Transport（握手 + 认证）
// Connection: 注册表持有的连接条目，缓存唯一的交互 Shell

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::config::SshConfig;
use super::error::SshError;
use super::session::{CommandOutput, PtyRequest, TerminalChannel};

/// 已认证的传输层
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 打开新的交互 Shell 通道
    async fn open_shell(&self, pty: &PtyRequest) -> Result<TerminalChannel, SshError>;

    /// 在独立通道上执行一条命令，等待输出读尽
    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// 打开 SFTP 子系统（调用方负责关闭）
    async fn open_sftp(&self) -> Result<SftpSession, SshError>;

    fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<(), SshError>;
}

/// 连接建立器
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn connect(&self, config: &SshConfig) -> Result<Self::Transport, SshError>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 握手进行中
    Establishing,
    /// 可用
    Ready,
    /// 已关闭（注册表中不保留该状态的条目）
    Closed,
}

/// 注册表中的连接
/// 调用方只借用 `Arc<Connection>`，关闭只能通过注册表完成
pub struct Connection<T: Transport> {
    identity: String,
    transport: T,
    /// 缓存的交互 Shell；锁同时串行化并发的 open_shell
    shell: Mutex<Option<Arc<TerminalChannel>>>,
    last_active: parking_lot::Mutex<Instant>,
    closed: AtomicBool,
}

impl<T: Transport> Connection<T> {
    pub fn new(identity: String, transport: T) -> Self {
        Self {
            identity,
            transport,
            shell: Mutex::new(None),
            last_active: parking_lot::Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 刷新最后活动时间
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn state(&self) -> ConnectionState {
        if !self.closed.load(Ordering::Relaxed) && self.transport.is_alive() {
            ConnectionState::Ready
        } else {
            ConnectionState::Closed
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn ensure_ready(&self) -> Result<(), SshError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(SshError::ChannelFailed(format!(
                "Connection {} is closed",
                self.identity
            )))
        }
    }

    /// 获取交互 Shell
    /// 缓存的 Shell 仍可写时直接复用，只有失效时才打开新的
    pub async fn open_shell(&self, pty: &PtyRequest) -> Result<Arc<TerminalChannel>, SshError> {
        self.ensure_ready()?;
        self.touch();

        let mut cached = self.shell.lock().await;
        if let Some(shell) = cached.as_ref() {
            if shell.is_writable() {
                return Ok(shell.clone());
            }
            debug!(
                "[SSH] Cached shell for {} is no longer writable, reopening",
                self.identity
            );
        }

        let shell = Arc::new(
            self.transport
                .open_shell(pty)
                .await
                .map_err(into_channel_failed)?,
        );
        *cached = Some(shell.clone());
        info!("[SSH] Shell cached for {}", self.identity);
        Ok(shell)
    }

    /// 当前缓存的 Shell（不打开新通道）
    pub async fn cached_shell(&self) -> Option<Arc<TerminalChannel>> {
        self.shell.lock().await.clone()
    }

    /// 执行单次命令，返回完整输出
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.ensure_ready()?;
        self.touch();
        self.transport
            .exec(command)
            .await
            .map_err(into_channel_failed)
    }

    /// 执行单次命令，返回 stdout + stderr 合并文本（不检查退出码）
    pub async fn exec_combined(&self, command: &str) -> Result<String, SshError> {
        Ok(self.exec(command).await?.combined())
    }

    /// 打开 SFTP 子系统，调用方在单次操作后关闭
    pub async fn open_sftp(&self) -> Result<SftpSession, SshError> {
        self.ensure_ready()?;
        self.touch();
        self.transport
            .open_sftp()
            .await
            .map_err(into_channel_failed)
    }

    /// 关闭 Shell 与传输层，错误只记录不返回
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(shell) = self.shell.lock().await.take() {
            shell.close();
        }
        if let Err(e) = self.transport.close().await {
            debug!("[SSH] Ignoring close error for {}: {}", self.identity, e);
        }
        info!("[SSH] Connection {} closed", self.identity);
    }
}

/// 通道层错误统一为 ChannelFailed，远端操作错误保持原样
fn into_channel_failed(e: SshError) -> SshError {
    match e {
        SshError::ChannelFailed(_) | SshError::RemoteOperationFailed(_) => e,
        other => SshError::ChannelFailed(other.to_string()),
    }
}
