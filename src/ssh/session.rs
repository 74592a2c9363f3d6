// SSH 会话管理
// 连接成功后的会话对象，提供多通道支持

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Transport;
use super::error::SshError;
use super::handler::SshClientHandler;
use super::output_buffer::{self, EventReceiver, DEFAULT_MAX_BUFFERED_BYTES};

/// PTY 请求参数
#[derive(Clone, Debug)]
pub struct PtyRequest {
    /// 终端类型
    pub term: String,
    /// 列数
    pub col_width: u32,
    /// 行数
    pub row_height: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            col_width: 80,
            row_height: 24,
        }
    }
}

/// SSH 会话（连接成功后）
/// 内部持有 Handle，支持并发打开多个通道
pub struct SshSession {
    /// 会话标签（用于日志）
    id: String,
    /// 共享的 russh Handle
    handle: Arc<Handle<SshClientHandler>>,
    /// 连接状态
    is_connected: AtomicBool,
}

impl SshSession {
    pub fn new(id: String, handle: Arc<Handle<SshClientHandler>>) -> Self {
        Self {
            id,
            handle,
            is_connected: AtomicBool::new(true),
        }
    }

    /// 标记会话断开
    fn mark_disconnected(&self) {
        self.is_connected.store(false, Ordering::Relaxed);
    }

    fn ensure_alive(&self) -> Result<(), SshError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SshError::Disconnected(format!(
                "Session {} is disconnected",
                self.id
            )))
        }
    }

    async fn open_channel(&self) -> Result<russh::Channel<Msg>, SshError> {
        self.ensure_alive()?;
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelFailed(format!("Failed to open channel: {}", e)))
    }

    /// 打开执行通道（单次命令，不缓存）
    pub async fn open_exec(&self) -> Result<ExecChannel, SshError> {
        let channel = self.open_channel().await?;
        Ok(ExecChannel::new(channel))
    }
}

#[async_trait]
impl Transport for SshSession {
    async fn open_shell(&self, pty: &PtyRequest) -> Result<TerminalChannel, SshError> {
        let channel = self.open_channel().await?;

        channel
            .request_pty(
                false,
                &pty.term,
                pty.col_width,
                pty.row_height,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelFailed(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelFailed(format!("Shell request failed: {}", e)))?;

        info!("[SSH] Interactive shell started for session {}", self.id);
        Ok(TerminalChannel::spawn(channel, self.id.clone()))
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let exec = self.open_exec().await?;
        exec.exec(command).await
    }

    async fn open_sftp(&self) -> Result<SftpSession, SshError> {
        let channel = self.open_channel().await?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                SshError::ChannelFailed(format!("Failed to request sftp subsystem: {}", e))
            })?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ChannelFailed(format!("Failed to create SFTP session: {}", e)))
    }

    fn is_alive(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed) && !self.handle.is_closed()
    }

    async fn close(&self) -> Result<(), SshError> {
        self.mark_disconnected();
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(SshError::from)
    }
}

// 使用 russh::client::Msg 作为消息类型
type RusshChannel = russh::Channel<Msg>;

/// 发往 Shell 通道的命令
#[derive(Debug)]
pub enum ShellCommand {
    /// 用户输入，原样转发
    Data(Vec<u8>),
    /// 终端尺寸变化
    Resize { cols: u32, rows: u32 },
    /// 主动关闭
    Close,
}

/// Shell 通道产生的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// 一次远端数据投递
    Data(Vec<u8>),
    /// 通道关闭（终止事件）
    Exit(String),
    /// 通道或传输层出错（终止事件）
    Error(String),
}

/// 终端通道
///
/// 底层 russh Channel 由一个独立任务持有：写入和 resize 通过命令队列发送，
/// 远端输出进入事件队列。读写互不持锁，所以等待输出时仍可 resize。
/// 事件队列同一时刻只允许一个消费者，新的订阅会让旧的订阅结束。
/// 无人订阅期间输出留在队列中，超过 `DEFAULT_MAX_BUFFERED_BYTES` 后丢弃最早的数据块。
pub struct TerminalChannel {
    cmd_tx: mpsc::UnboundedSender<ShellCommand>,
    events: Arc<Mutex<EventReceiver>>,
    writable: Arc<AtomicBool>,
    consumer: parking_lot::Mutex<CancellationToken>,
}

impl TerminalChannel {
    /// 由命令/事件队列组装通道
    /// `writable` 由通道持有方在通道结束时置为 false
    pub fn from_parts(
        cmd_tx: mpsc::UnboundedSender<ShellCommand>,
        event_rx: EventReceiver,
        writable: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cmd_tx,
            events: Arc::new(Mutex::new(event_rx)),
            writable,
            consumer: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    /// 启动通道持有任务
    fn spawn(mut channel: RusshChannel, session_id: String) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ShellCommand>();
        let (event_tx, event_rx) = output_buffer::channel(DEFAULT_MAX_BUFFERED_BYTES);
        let writable = Arc::new(AtomicBool::new(true));
        let writable_flag = writable.clone();

        tokio::spawn(async move {
            let mut exit_status: Option<u32> = None;
            let mut eof = false;

            let terminal = loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                break ChannelEvent::Error(format!("Failed to send data to channel: {}", e));
                            }
                        }
                        Some(ShellCommand::Resize { cols, rows }) => {
                            debug!("[Terminal] Resize {}x{} for session {}", cols, rows, session_id);
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                warn!("[Terminal] Failed to resize PTY: {}", e);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break ChannelEvent::Exit("closed by client".to_string());
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            event_tx.send(ChannelEvent::Data(data.to_vec()));
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            event_tx.send(ChannelEvent::Data(data.to_vec()));
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::Eof) => {
                            eof = true;
                        }
                        Some(ChannelMsg::Close) => {
                            break ChannelEvent::Exit(exit_reason(exit_status));
                        }
                        Some(_) => {}
                        None => {
                            break if eof || exit_status.is_some() {
                                ChannelEvent::Exit(exit_reason(exit_status))
                            } else {
                                ChannelEvent::Error("connection lost".to_string())
                            };
                        }
                    }
                }
            };

            writable_flag.store(false, Ordering::Relaxed);
            info!("[Terminal] Shell for session {} ended: {:?}", session_id, terminal);
            event_tx.send(terminal);
        });

        Self::from_parts(cmd_tx, event_rx, writable)
    }

    /// 通道是否仍可写入
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed) && !self.cmd_tx.is_closed()
    }

    fn send(&self, cmd: ShellCommand) -> Result<(), SshError> {
        if !self.is_writable() {
            return Err(SshError::ChannelFailed(
                "Shell channel is no longer writable".to_string(),
            ));
        }
        self.cmd_tx.send(cmd).map_err(|_| {
            self.writable.store(false, Ordering::Relaxed);
            SshError::ChannelFailed("Shell channel is no longer writable".to_string())
        })
    }

    /// 写入数据到终端
    pub fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.send(ShellCommand::Data(data.to_vec()))
    }

    /// 调整终端大小
    pub fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.send(ShellCommand::Resize { cols, rows })
    }

    /// 关闭通道（已关闭时忽略）
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ShellCommand::Close);
    }

    /// 订阅输出事件，取代当前的订阅者
    pub async fn subscribe(&self) -> ShellSubscription {
        let token = CancellationToken::new();
        {
            let mut current = self.consumer.lock();
            current.cancel();
            *current = token.clone();
        }
        let events = self.events.clone().lock_owned().await;
        debug!(
            "[Terminal] Subscriber attached with {} buffered bytes",
            events.buffered_bytes()
        );
        ShellSubscription { events, token }
    }
}

fn exit_reason(exit_status: Option<u32>) -> String {
    match exit_status {
        Some(status) => format!("exit status {}", status),
        None => "channel closed".to_string(),
    }
}

/// Shell 输出的独占订阅
/// drop 即取消订阅，通道本身保持不变
pub struct ShellSubscription {
    events: OwnedMutexGuard<EventReceiver>,
    token: CancellationToken,
}

impl ShellSubscription {
    /// 下一个事件；返回 None 表示已被新的订阅者取代
    pub async fn next(&mut self) -> Option<ChannelEvent> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = self.events.recv() => Some(
                event.unwrap_or_else(|| ChannelEvent::Exit("channel closed".to_string())),
            ),
        }
    }
}

/// 执行通道（单个非交互命令）
pub struct ExecChannel {
    channel: Mutex<RusshChannel>,
}

impl ExecChannel {
    fn new(channel: RusshChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// 执行命令并等待输出读尽、通道关闭
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.channel.lock().await;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelFailed(e.to_string()))?;

        let mut collector = OutputCollector::default();
        loop {
            match channel.wait().await {
                Some(msg) => {
                    if collector.push(msg) {
                        break;
                    }
                }
                None => break,
            }
        }

        Ok(collector.finish())
    }
}

/// 累积 exec 通道消息
/// Eof 之后仍可能收到 ExitStatus，所以只在 Close 时结束
#[derive(Default)]
struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<u32>,
}

impl OutputCollector {
    /// 返回 true 表示通道已关闭
    fn push(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.stdout.extend_from_slice(&data);
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 {
                    self.stderr.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_code = Some(exit_status);
            }
            ChannelMsg::Close => return true,
            _ => {}
        }
        false
    }

    fn finish(self) -> CommandOutput {
        CommandOutput {
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code: self.exit_code.unwrap_or(0),
        }
    }
}

/// 命令输出
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: Vec<u8>,
    /// 标准错误
    pub stderr: Vec<u8>,
    /// 退出码
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// stdout 在前，stderr 在后
    pub fn combined(&self) -> String {
        let mut text = self.stdout_string();
        text.push_str(&self.stderr_string());
        text
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
