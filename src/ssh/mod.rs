// SSH 连接模块
//
// 模块结构:
// - config: 连接配置 (SshConfig, AuthMethod, Credentials)
// - error: 错误类型 (SshError)
// - handler: russh Handler 实现
// - client: 连接建立器 (SshConnector)
// - session: russh 会话与通道 (SshSession, TerminalChannel, ExecChannel)
// - output_buffer: Shell 输出缓冲（有字节上限）
// - connection: 通道复用 (Transport, Connector, Connection)
// - manager: 连接注册表 (SshManager)

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod manager;
pub mod output_buffer;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

// 公开导出
pub use client::SshConnector;
pub use config::{AuthMethod, Credentials, KeepaliveConfig, SshConfig};
pub use connection::{Connection, ConnectionState, Connector, Transport};
pub use error::SshError;
pub use manager::SshManager;
pub use session::{
    ChannelEvent, CommandOutput, ExecChannel, PtyRequest, ShellSubscription, SshSession,
    TerminalChannel,
};
