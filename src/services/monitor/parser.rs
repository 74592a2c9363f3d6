// 组合探测输出解析
//
// 纯函数，不做 I/O。任意一段缺失或格式异常时该段取默认值，其余段照常解析。

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::script::{
    MARKERS, MARKER_DOMAINS, MARKER_PM2, MARKER_PORTS, MARKER_PROCESSES, MARKER_STATS,
    PREFIX_CPU, PREFIX_DISK, PREFIX_MEM, PREFIX_UPTIME,
};
use crate::models::monitor::{
    DomainInfo, ManagedProcessEnv, ManagedProcessInfo, ProcessInfo, ProcessMonit,
    SystemStatsSnapshot,
};

/// 端口表的两种格式，按顺序尝试，先匹配者生效
/// - ss：`LISTEN 0 128 0.0.0.0:3000 ... users:(("node",pid=100,fd=20))`
/// - netstat：`tcp 0 0 0.0.0.0:3000 0.0.0.0:* LISTEN 100/node`
static PORT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r":(\d+)\s.*pid=(\d+)", r":(\d+)\s.*LISTEN\s+(\d+)/"]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// 进程表每行至少需要的字段数
const PROCESS_FIELDS: usize = 5;

/// 声明域名的指令关键字
const DOMAIN_DIRECTIVES: [&str; 3] = ["server_name", "ServerName", "ServerAlias"];

/// 解析一次组合探测的完整输出
pub fn parse_stats(raw: &str) -> SystemStatsSnapshot {
    let stats = section(raw, MARKER_STATS).unwrap_or_default();
    let (uptime, load_avg) = parse_uptime(metric(stats, PREFIX_UPTIME).unwrap_or_default());

    let ports = parse_ports(section(raw, MARKER_PORTS).unwrap_or_default());
    let mut pm2_processes = parse_pm2(section(raw, MARKER_PM2).unwrap_or_default());
    attach_ports(&mut pm2_processes, &ports);

    SystemStatsSnapshot {
        cpu: format!("{}%", metric(stats, PREFIX_CPU).unwrap_or("0")),
        memory: metric(stats, PREFIX_MEM).unwrap_or("0").to_string(),
        storage: metric(stats, PREFIX_DISK).unwrap_or("0%").to_string(),
        load_avg,
        uptime,
        processes: parse_processes(section(raw, MARKER_PROCESSES).unwrap_or_default()),
        domains: parse_domains(section(raw, MARKER_DOMAINS).unwrap_or_default()),
        pm2_processes,
        ports,
    }
}

/// 取出某个标记之后、下一个已出现标记之前的文本
///
/// 后续标记全部缺失时一直取到文本末尾
pub fn section<'a>(raw: &'a str, marker: &str) -> Option<&'a str> {
    let Some(start) = raw.find(marker).map(|pos| pos + marker.len()) else {
        debug!("[Monitor] Section marker {} missing", marker);
        return None;
    };
    let rest = &raw[start..];

    let later = MARKERS
        .iter()
        .position(|m| *m == marker)
        .map(|index| &MARKERS[index + 1..])
        .unwrap_or_default();
    let following = later
        .iter()
        .filter_map(|m| rest.find(m))
        .min()
        .unwrap_or(rest.len());

    Some(&rest[..following])
}

/// 按行前缀提取指标值，前缀不存在或值为空时返回 None
fn metric<'a>(section: &'a str, prefix: &str) -> Option<&'a str> {
    section
        .lines()
        .find_map(|line| line.trim().strip_prefix(prefix))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// `up 3 days, load average: 0.1, 0.2, 0.3` -> ("up 3 days", "0.1, 0.2, 0.3")
fn parse_uptime(value: &str) -> (String, String) {
    match value.split_once("load average:") {
        Some((uptime, load)) => (
            uptime.trim().trim_end_matches(',').trim().to_string(),
            load.trim().to_string(),
        ),
        None => (value.trim().to_string(), String::new()),
    }
}

/// 进程表：`user|pid|cpu|mem|command`
fn parse_processes(section: &str) -> Vec<ProcessInfo> {
    section
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            if fields.len() < PROCESS_FIELDS {
                debug!("[Monitor] Dropping malformed process line: {}", line);
                return None;
            }

            let executable = fields[4].split_whitespace().next().unwrap_or_default();
            Some(ProcessInfo {
                user: fields[0].to_string(),
                pid: fields[1].to_string(),
                cpu: format!("{}%", fields[2]),
                mem: format!("{}%", fields[3]),
                command: base_name(executable).to_string(),
            })
        })
        .collect()
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// 站点配置：`path:content`，同一文件内的域名按首次出现顺序去重
fn parse_domains(section: &str) -> Vec<DomainInfo> {
    let mut result: Vec<DomainInfo> = Vec::new();

    for line in section.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((file, content)) = line.split_once(':') else {
            continue;
        };
        let content = content.trim();
        if content.starts_with('#') {
            continue;
        }

        // 只接受以指令开头的行，`$server_name` 之类的变量引用不算
        let mut tokens = content.split_whitespace();
        if !tokens
            .next()
            .is_some_and(|directive| DOMAIN_DIRECTIVES.contains(&directive))
        {
            continue;
        }

        let names: Vec<&str> = tokens
            .map(|token| token.trim_end_matches(';'))
            .filter(|token| !token.is_empty() && *token != "_" && !token.contains('*'))
            .collect();
        if names.is_empty() {
            continue;
        }

        let index = match result.iter().position(|d| d.file == file) {
            Some(index) => index,
            None => {
                result.push(DomainInfo {
                    file: file.to_string(),
                    domains: Vec::new(),
                });
                result.len() - 1
            }
        };

        let entry = &mut result[index];
        for name in names {
            if !entry.domains.iter().any(|d| d == name) {
                entry.domains.push(name.to_string());
            }
        }
    }

    result
}

/// 进程管理器 JSON 列表，解析失败返回空列表
///
/// pm2 启动守护进程时会先打印 `[PM2] ...` 提示行，因此从每个 `[` 依次尝试，
/// 第一个能完整解析为数组的位置生效
fn parse_pm2(section: &str) -> Vec<ManagedProcessInfo> {
    let Some(end) = section.rfind(']') else {
        return Vec::new();
    };

    let items = section
        .match_indices('[')
        .map(|(start, _)| start)
        .take_while(|start| *start < end)
        .find_map(|start| match serde_json::from_str::<Value>(&section[start..=end]) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        });

    match items {
        Some(items) => items.iter().map(prune_managed_process).collect(),
        None => {
            warn!("[Monitor] No process manager list found in output");
            Vec::new()
        }
    }
}

/// 只保留固定字段，其余全部丢弃
fn prune_managed_process(item: &Value) -> ManagedProcessInfo {
    let env = &item["pm2_env"];
    // 超出 u32 范围的值按缺失处理
    let as_u32 = |v: &Value| v.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0);
    let as_string = |v: &Value| v.as_str().unwrap_or("").to_string();

    ManagedProcessInfo {
        name: as_string(&item["name"]),
        pid: as_u32(&item["pid"]),
        pm_id: as_u32(&item["pm_id"]),
        monit: ProcessMonit {
            memory: item["monit"]["memory"].as_u64().unwrap_or(0),
            cpu: item["monit"]["cpu"].as_f64().unwrap_or(0.0),
        },
        pm2_env: ManagedProcessEnv {
            status: as_string(&env["status"]),
            pm_uptime: env["pm_uptime"].as_u64().unwrap_or(0),
            restart_time: as_u32(&env["restart_time"]),
            unstable_restarts: as_u32(&env["unstable_restarts"]),
            cwd: env["pm_cwd"]
                .as_str()
                .or_else(|| env["cwd"].as_str())
                .unwrap_or("")
                .to_string(),
            exec_mode: as_string(&env["exec_mode"]),
            pm_exec_path: as_string(&env["pm_exec_path"]),
            node_version: as_string(&env["node_version"]),
            version: as_string(&env["version"]),
        },
        ports: Vec::new(),
    }
}

/// 端口表：每行先试 ss 格式，再试 netstat 格式
fn parse_ports(section: &str) -> BTreeMap<u32, Vec<u16>> {
    let mut ports: BTreeMap<u32, Vec<u16>> = BTreeMap::new();

    for line in section.lines() {
        let Some(caps) = PORT_PATTERNS.iter().find_map(|re| re.captures(line)) else {
            continue;
        };

        let (Ok(port), Ok(pid)) = (caps[1].parse::<u16>(), caps[2].parse::<u32>()) else {
            continue;
        };

        let entry = ports.entry(pid).or_default();
        if !entry.contains(&port) {
            entry.push(port);
        }
    }

    ports
}

fn attach_ports(processes: &mut [ManagedProcessInfo], ports: &BTreeMap<u32, Vec<u16>>) {
    for process in processes {
        if let Some(list) = ports.get(&process.pid) {
            process.ports = list.clone();
        }
    }
}
