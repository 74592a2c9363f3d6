// SSH 错误类型定义

use thiserror::Error;

/// SSH 错误类型
///
/// 对外只暴露三类结果：`ConnectionFailed`、`ChannelFailed`、`RemoteOperationFailed`。
/// 其余变体由连接建立器内部产生，注册表在交给等待者之前统一折叠为 `ConnectionFailed`。
#[derive(Debug, Error)]
pub enum SshError {
    /// 握手/认证/超时失败（同一批并发等待者共享同一个原因）
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// 连接正常但通道无法打开或已不可写
    #[error("Channel failed: {0}")]
    ChannelFailed(String),

    /// 远程命令或文件操作本身返回错误（保留远端原始消息）
    #[error("Remote operation failed: {0}")]
    RemoteOperationFailed(String),

    /// 调用方传入的数据无法使用（如非法 base64）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO 错误（网络连接等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误
    #[error("Key error: {0}")]
    Key(String),

    /// 连接超时
    #[error("Connection timeout after {0}s")]
    Timeout(u64),

    /// 会话已断开
    #[error("Session disconnected: {0}")]
    Disconnected(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol(e.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for SshError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        SshError::RemoteOperationFailed(e.to_string())
    }
}
