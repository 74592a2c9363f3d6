// 后端服务模块

pub mod monitor;
pub mod sftp;
pub mod storage;
pub mod terminal;

pub use monitor::fetch_stats;
pub use sftp::FileBrowser;
pub use terminal::{ShellEvent, ShellStream, TerminalInput, TerminalService};
