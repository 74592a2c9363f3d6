// Settings 配置数据结构

use serde::{Deserialize, Serialize};

// ======================== 主配置结构 ========================

/// 连接层设置（持久化用）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub terminal: TerminalSettings,
}

// ======================== 连接设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    // SSH
    pub port: u16,
    /// 握手超时上限
    pub connection_timeout_secs: u64,
    /// 0 表示关闭心跳
    pub keepalive_interval_secs: u64,
    pub keepalive_max: u32,
    /// 注册表中就绪连接的上限，0 表示不限制
    pub max_connections: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: 22,
            connection_timeout_secs: 15,
            keepalive_interval_secs: 60,
            keepalive_max: 3,
            max_connections: 64,
        }
    }
}

// ======================== 终端设置 ========================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

impl TerminalSettings {
    pub fn pty_request(&self) -> crate::ssh::PtyRequest {
        crate::ssh::PtyRequest {
            term: self.term.clone(),
            col_width: self.cols,
            row_height: self.rows,
        }
    }
}
