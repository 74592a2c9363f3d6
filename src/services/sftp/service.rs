// 文件浏览服务 - 封装 russh-sftp 客户端
//
// 每个操作单独打开一个 SFTP 通道，只做一次远程调用，完成后关闭通道

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::models::sftp::{format_permissions, join_path, FileContent, FileKind, RemoteFileEntry};
use crate::ssh::connection::{Connection, Transport};
use crate::ssh::error::SshError;

/// 二进制判断只检查开头这么多字节
const BINARY_SAMPLE_LEN: usize = 8000;

/// 文件浏览器
/// 借用注册表中的连接，不负责连接的生命周期
pub struct FileBrowser<T: Transport> {
    conn: Arc<Connection<T>>,
}

impl<T: Transport> FileBrowser<T> {
    pub fn new(conn: Arc<Connection<T>>) -> Self {
        Self { conn }
    }

    /// 获取用户主目录
    pub async fn home_dir(&self) -> Result<String, SshError> {
        let sftp = self.conn.open_sftp().await?;
        let path = match sftp.canonicalize(".").await {
            Ok(path) => {
                debug!("[SFTP] Home directory: {}", path);
                path
            }
            Err(e) => {
                error!("[SFTP] Failed to get home directory: {}", e);
                // 回退到根目录
                "/".to_string()
            }
        };
        close_sftp(sftp).await;
        Ok(path)
    }

    /// 读取目录内容（目录在前，同类按名称排序）
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteFileEntry>, SshError> {
        debug!("[SFTP] Reading directory: {}", path);
        let sftp = self.conn.open_sftp().await?;

        let result = sftp
            .read_dir(path)
            .await
            .map_err(|e| remote_error(format!("Failed to read directory {}", path), e))
            .map(|dir| {
                let mut entries: Vec<RemoteFileEntry> = dir
                    .filter(|entry| {
                        let name = entry.file_name();
                        name != "." && name != ".."
                    })
                    .map(|entry| entry_from_attrs(path, &entry.file_name(), &entry.metadata()))
                    .collect();
                sort_entries(&mut entries);
                entries
            });

        close_sftp(sftp).await;
        if let Ok(entries) = &result {
            debug!("[SFTP] Read {} entries from {}", entries.len(), path);
        }
        result
    }

    /// 创建空文件或目录
    pub async fn create(&self, path: &str, kind: FileKind) -> Result<(), SshError> {
        info!("[SFTP] Creating {:?}: {}", kind, path);
        let sftp = self.conn.open_sftp().await?;

        let result = match kind {
            FileKind::Directory => sftp
                .create_dir(path)
                .await
                .map_err(|e| remote_error(format!("Failed to create directory {}", path), e)),
            FileKind::File => match sftp.create(path).await {
                Ok(mut file) => file
                    .shutdown()
                    .await
                    .map_err(|e| remote_error(format!("Failed to create file {}", path), e)),
                Err(e) => Err(remote_error(format!("Failed to create file {}", path), e)),
            },
        };

        close_sftp(sftp).await;
        result
    }

    /// 删除文件或目录
    ///
    /// 目录通过 exec 执行 `rm -rf` 递归删除，文件使用 SFTP unlink
    pub async fn delete(&self, path: &str, kind: FileKind) -> Result<(), SshError> {
        info!("[SFTP] Removing {:?}: {}", kind, path);

        match kind {
            FileKind::Directory => {
                let output = self
                    .conn
                    .exec(&format!("rm -rf -- {}", shell_quote(path)))
                    .await?;
                if output.is_success() {
                    Ok(())
                } else {
                    Err(SshError::RemoteOperationFailed(format!(
                        "Failed to remove directory {}: {}",
                        path,
                        output.stderr_string().trim()
                    )))
                }
            }
            FileKind::File => {
                let sftp = self.conn.open_sftp().await?;
                let result = sftp
                    .remove_file(path)
                    .await
                    .map_err(|e| remote_error(format!("Failed to remove file {}", path), e));
                close_sftp(sftp).await;
                result
            }
        }
    }

    /// 重命名文件或目录
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        info!("[SFTP] Renaming {} -> {}", from, to);
        let sftp = self.conn.open_sftp().await?;
        let result = sftp
            .rename(from, to)
            .await
            .map_err(|e| remote_error(format!("Failed to rename {} to {}", from, to), e));
        close_sftp(sftp).await;
        result
    }

    /// 上传文件到 `dir/name`，内容为 base64
    pub async fn upload(&self, dir: &str, name: &str, content_base64: &str) -> Result<(), SshError> {
        let data = BASE64
            .decode(content_base64.trim())
            .map_err(|e| SshError::InvalidInput(format!("Invalid base64 content: {}", e)))?;
        let path = join_path(dir, name);
        info!("[SFTP] Uploading {} bytes to {}", data.len(), path);
        self.write_bytes(&path, &data).await
    }

    /// 读取文件内容
    ///
    /// 判为二进制时返回 base64，否则返回文本。判断只是启发式的：
    /// 开头不含控制字节的二进制格式会被当作文本
    pub async fn read(&self, path: &str) -> Result<FileContent, SshError> {
        debug!("[SFTP] Reading file: {}", path);
        let sftp = self.conn.open_sftp().await?;

        let result = match sftp.open(path).await {
            Ok(mut file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)
                    .await
                    .map(|_| data)
                    .map_err(|e| remote_error(format!("Failed to read file {}", path), e))
            }
            Err(e) => Err(remote_error(format!("Failed to open file {}", path), e)),
        };

        close_sftp(sftp).await;
        let data = result?;
        debug!("[SFTP] Read {} bytes from {}", data.len(), path);
        Ok(encode_content(&data))
    }

    /// 覆盖写入文本内容
    pub async fn write(&self, path: &str, content: &str) -> Result<(), SshError> {
        info!("[SFTP] Writing {} bytes to {}", content.len(), path);
        self.write_bytes(path, content.as_bytes()).await
    }

    async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<(), SshError> {
        let sftp = self.conn.open_sftp().await?;

        let result = match sftp.create(path).await {
            Ok(mut file) => {
                let written = match file.write_all(data).await {
                    Ok(()) => file.shutdown().await,
                    Err(e) => Err(e),
                };
                written.map_err(|e| remote_error(format!("Failed to write file {}", path), e))
            }
            Err(e) => Err(remote_error(format!("Failed to open file {}", path), e)),
        };

        close_sftp(sftp).await;
        result
    }
}

async fn close_sftp(sftp: SftpSession) {
    if let Err(e) = sftp.close().await {
        debug!("[SFTP] Ignoring close error: {}", e);
    }
}

fn remote_error(context: String, e: impl std::fmt::Display) -> SshError {
    SshError::RemoteOperationFailed(format!("{}: {}", context, e))
}

/// 由目录条目属性构造 RemoteFileEntry
fn entry_from_attrs(dir: &str, name: &str, attrs: &FileAttributes) -> RemoteFileEntry {
    let kind = if attrs.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    };

    RemoteFileEntry {
        name: name.to_string(),
        path: join_path(dir, name),
        kind,
        size: attrs.size.unwrap_or(0),
        modified: attrs
            .mtime
            .and_then(|mtime| DateTime::from_timestamp(i64::from(mtime), 0)),
        permissions: format_permissions(kind, attrs.permissions.unwrap_or(0)),
    }
}

fn sort_entries(entries: &mut [RemoteFileEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// 用单引号包裹，内部单引号转义为 `'\''`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// 控制字节启发式：出现文本中少见的控制字节即判为二进制
fn looks_binary(data: &[u8]) -> bool {
    data.iter()
        .take(BINARY_SAMPLE_LEN)
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0E..=0x1F))
}

fn encode_content(data: &[u8]) -> FileContent {
    if looks_binary(data) {
        FileContent {
            content: BASE64.encode(data),
            is_binary: true,
        }
    } else {
        FileContent {
            content: String::from_utf8_lossy(data).into_owned(),
            is_binary: false,
        }
    }
}
