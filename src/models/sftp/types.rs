// SFTP 基础数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 文件类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// 普通文件（符号链接等非目录类型也归为文件）
    #[default]
    File,
    /// 目录
    Directory,
}

/// 远程文件条目
/// 由目录列表临时构建，不持久化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    /// 文件名
    pub name: String,
    /// 完整路径
    pub path: String,
    /// 文件类型
    pub kind: FileKind,
    /// 文件大小（字节）
    pub size: u64,
    /// 修改时间
    pub modified: Option<DateTime<Utc>>,
    /// 权限字符串（如 drwxr-xr-x）
    pub permissions: String,
}

impl RemoteFileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// 读取文件的结果
///
/// `is_binary` 来自控制字节启发式判断，并不保证准确：
/// 判为二进制时 `content` 为 base64，否则为原始文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub content: String,
    pub is_binary: bool,
}

/// 格式化权限字符串（如 rwxr-xr-x）
pub fn format_permissions(kind: FileKind, perms: u32) -> String {
    let mut s = String::with_capacity(10);

    s.push(match kind {
        FileKind::Directory => 'd',
        FileKind::File => '-',
    });

    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}

/// 连接路径
pub fn join_path(base: &str, name: &str) -> String {
    if base == "/" || base.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}
