// 数据模型模块

pub mod monitor;
pub mod settings;
pub mod sftp;

pub use monitor::{DomainInfo, ManagedProcessInfo, ProcessInfo, SystemStatsSnapshot};
pub use settings::{ConnectionSettings, Settings, TerminalSettings};
pub use sftp::{FileContent, FileKind, RemoteFileEntry};
