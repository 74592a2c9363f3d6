// SFTP 数据模型

pub mod types;

pub use types::{format_permissions, join_path, FileContent, FileKind, RemoteFileEntry};
