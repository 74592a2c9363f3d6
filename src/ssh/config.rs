// SSH 连接配置

use std::path::PathBuf;
use std::time::Duration;

use crate::models::settings::ConnectionSettings;

/// 调用方提供的登录凭据
/// 只在内存中流转，不做任何持久化
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// 默认的会话标识 `<user>@<host>`
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// 带用途前缀的会话标识 `<purpose>_<user>@<host>`
    /// 不同用途（文件浏览、状态采集）使用不同标识可以避免通道争用
    pub fn identity_for(&self, purpose: &str) -> String {
        format!("{}_{}", purpose, self.identity())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// SSH 连接配置
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// 目标主机
    pub host: String,
    /// 端口
    pub port: u16,
    /// 用户名
    pub username: String,
    /// 认证方式
    pub auth: AuthMethod,
    /// 握手超时（秒）
    pub connect_timeout: u64,
    /// 心跳配置
    pub keepalive: KeepaliveConfig,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password(String::new()),
            connect_timeout: 15,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl SshConfig {
    /// 由凭据和连接设置构建配置
    pub fn from_credentials(credentials: &Credentials, settings: &ConnectionSettings) -> Self {
        Self {
            host: credentials.host.clone(),
            port: settings.port,
            username: credentials.username.clone(),
            auth: AuthMethod::Password(credentials.secret.clone()),
            connect_timeout: settings.connection_timeout_secs,
            keepalive: KeepaliveConfig {
                enabled: settings.keepalive_interval_secs > 0,
                interval: settings.keepalive_interval_secs,
                max_retries: settings.keepalive_max,
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// 构建 russh 配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // 心跳开启时不设置不活动超时，避免空闲 Shell 被本端主动断开
        if self.keepalive.enabled {
            config.keepalive_interval = Some(Duration::from_secs(self.keepalive.interval));
            config.keepalive_max = self.keepalive.max_retries as usize;
        } else {
            config.inactivity_timeout = None;
        }
        config
    }
}

/// 认证方式
#[derive(Clone)]
pub enum AuthMethod {
    /// 密码认证
    Password(String),
    /// 公钥认证
    PublicKey {
        /// 私钥文件路径
        key_path: PathBuf,
        /// 私钥密码（如果有）
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PublicKey { key_path, .. } => f
                .debug_struct("PublicKey")
                .field("key_path", key_path)
                .finish(),
        }
    }
}

/// 心跳配置
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔（秒）
    pub interval: u64,
    /// 最大重试次数
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 60,
            max_retries: 3,
        }
    }
}
