// SSH 客户端核心实现

use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::{AuthMethod, SshConfig};
use super::connection::Connector;
use super::error::SshError;
use super::handler::SshClientHandler;
use super::session::SshSession;

/// SSH 连接建立器
/// 完成 TCP 连接、SSH 握手和认证，返回 SshSession
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }

    /// 执行连接（异步）
    /// TCP 连接、握手、认证共享同一个超时上限
    async fn establish(&self, config: &SshConfig) -> Result<SshSession, SshError> {
        let label = format!("{}@{}:{}", config.username, config.host, config.port);
        info!("[SSH] Starting SSH connection to {}", label);

        // 解析地址
        let addr = format!("{}:{}", config.host, config.port);
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Config(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::Config("No valid address found".to_string()))?;

        debug!("[SSH] Connecting to {}...", socket_addr);
        let tcp_stream = TcpStream::connect(socket_addr).await?;
        debug!("[SSH] TCP connection established");

        let russh_config = Arc::new(config.to_russh_config());
        let handler = SshClientHandler::new(config.host.clone());

        let mut handle = russh::client::connect_stream(russh_config, tcp_stream, handler)
            .await
            .map_err(SshError::from)?;
        debug!("[SSH] SSH handshake completed");

        debug!("[SSH] Authenticating as '{}'...", config.username);
        self.authenticate(config, &mut handle).await?;

        info!("[SSH] SSH connection to {} established", label);
        Ok(SshSession::new(label, Arc::new(handle)))
    }

    /// 执行认证
    async fn authenticate(
        &self,
        config: &SshConfig,
        handle: &mut Handle<SshClientHandler>,
    ) -> Result<(), SshError> {
        use russh::client::AuthResult;

        let (auth_result, method) = match &config.auth {
            AuthMethod::Password(password) => {
                debug!("[SSH] Using password authentication");
                let result = handle
                    .authenticate_password(&config.username, password)
                    .await
                    .map_err(SshError::from)?;
                (result, "Password")
            }
            AuthMethod::PublicKey {
                key_path,
                passphrase,
            } => {
                debug!("[SSH] Using public key authentication: {:?}", key_path);
                let key = load_private_key(key_path, passphrase.as_deref()).await?;
                let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
                let result = handle
                    .authenticate_publickey(&config.username, key_with_alg)
                    .await
                    .map_err(SshError::from)?;
                (result, "Public key")
            }
        };

        match auth_result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                partial_success: true,
                ..
            } => Err(SshError::Auth(
                "Partial authentication - additional auth required".to_string(),
            )),
            AuthResult::Failure {
                remaining_methods, ..
            } => Err(SshError::Auth(format!(
                "{} authentication failed. Server suggests: {:?}",
                method, remaining_methods
            ))),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Transport = SshSession;

    async fn connect(&self, config: &SshConfig) -> Result<SshSession, SshError> {
        timeout(config.connect_timeout(), self.establish(config))
            .await
            .map_err(|_| SshError::Timeout(config.connect_timeout))?
    }
}

/// 加载私钥文件
async fn load_private_key(
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<russh::keys::PrivateKey, SshError> {
    let key_data = tokio::fs::read(key_path)
        .await
        .map_err(|e| SshError::Key(format!("Failed to read key file: {}", e)))?;

    russh::keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
        .map_err(|e| SshError::Key(format!("Failed to decode key: {}", e)))
}
