// Monitor 监控数据模型

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// 状态快照（每次请求解析一次，不缓存）
// ============================================================================

/// 一次组合探测命令解析出的系统状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatsSnapshot {
    /// CPU 使用率，如 "12.5%"
    pub cpu: String,
    /// 内存使用率（远端原样输出）
    pub memory: String,
    /// 根分区使用率，如 "10%"
    pub storage: String,
    /// 负载，如 "0.1, 0.2, 0.3"
    pub load_avg: String,
    /// 运行时间，如 "up 3 days"
    pub uptime: String,
    pub processes: Vec<ProcessInfo>,
    pub domains: Vec<DomainInfo>,
    pub pm2_processes: Vec<ManagedProcessInfo>,
    /// pid -> 监听端口（去重）
    pub ports: BTreeMap<u32, Vec<u16>>,
}

/// 进程信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub user: String,
    pub pid: String,
    pub cpu: String,
    pub mem: String,
    /// 命令的可执行文件名
    pub command: String,
}

/// 某个站点配置文件中声明的域名
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// 配置文件路径
    pub file: String,
    pub domains: Vec<String>,
}

// ============================================================================
// 进程管理器（pm2）条目
// 只保留下列字段，其余字段在解析时丢弃
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedProcessInfo {
    pub name: String,
    pub pid: u32,
    pub pm_id: u32,
    pub monit: ProcessMonit,
    pub pm2_env: ManagedProcessEnv,
    /// 由端口表按 pid 关联
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMonit {
    /// 字节
    pub memory: u64,
    pub cpu: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedProcessEnv {
    pub status: String,
    pub pm_uptime: u64,
    pub restart_time: u32,
    pub unstable_restarts: u32,
    pub cwd: String,
    pub exec_mode: String,
    pub pm_exec_path: String,
    pub node_version: String,
    pub version: String,
}
