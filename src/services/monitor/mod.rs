// Monitor 后端服务
// 使用一次 exec 执行组合探测脚本，解析为系统状态快照

mod parser;
mod script;

pub use parser::{parse_stats, section};
pub use script::{MARKERS, STATS_SCRIPT};

use tracing::{debug, info, trace};

use crate::models::monitor::SystemStatsSnapshot;
use crate::ssh::connection::{Connection, Transport};
use crate::ssh::error::SshError;

/// 获取一次系统状态
///
/// 只有通道层错误会返回 Err；脚本中个别探测失败时对应字段取默认值
pub async fn fetch_stats<T: Transport>(
    conn: &Connection<T>,
) -> Result<SystemStatsSnapshot, SshError> {
    debug!("[Monitor] Fetching stats for {}", conn.identity());

    let raw = conn.exec_combined(STATS_SCRIPT).await?;
    trace!("[Monitor] Raw stats output: {}", raw);

    let snapshot = parse_stats(&raw);
    info!(
        "[Monitor] Stats for {}: cpu={} mem={} disk={} processes={}",
        conn.identity(),
        snapshot.cpu,
        snapshot.memory,
        snapshot.storage,
        snapshot.processes.len()
    );
    Ok(snapshot)
}
