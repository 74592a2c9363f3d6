// SSH 连接注册表
//
// 会话标识 -> 连接 的唯一映射。同一标识的并发 acquire 合并为一次握手：
// 第一个调用方放入 Establishing 占位条目，后来者等待同一个共享结果。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::client::SshConnector;
use super::config::{Credentials, SshConfig};
use super::connection::{Connection, ConnectionState, Connector, Transport};
use super::error::SshError;
use crate::models::settings::ConnectionSettings;

/// 进行中的握手，所有等待者共享同一个结果
type EstablishFuture<T> = Shared<BoxFuture<'static, Result<Arc<Connection<T>>, String>>>;

enum Entry<T: Transport> {
    Establishing {
        /// 区分同一标识先后发起的握手，释放后迟到的结果不会被登记
        epoch: u64,
        future: EstablishFuture<T>,
    },
    Ready(Arc<Connection<T>>),
}

struct Registry<T: Transport> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    next_epoch: AtomicU64,
}

impl<T: Transport> Registry<T> {
    fn is_current(entries: &HashMap<String, Entry<T>>, identity: &str, epoch: u64) -> bool {
        matches!(
            entries.get(identity),
            Some(Entry::Establishing { epoch: current, .. }) if *current == epoch
        )
    }
}

/// SSH 管理器
/// 进程内只创建一个，以引用方式传给各个使用方
pub struct SshManager<C: Connector = SshConnector> {
    connector: Arc<C>,
    settings: ConnectionSettings,
    registry: Arc<Registry<C::Transport>>,
}

impl SshManager<SshConnector> {
    /// 使用 russh 连接器创建管理器
    pub fn with_settings(settings: ConnectionSettings) -> Self {
        Self::new(Arc::new(SshConnector::new()), settings)
    }
}

impl<C: Connector> SshManager<C> {
    pub fn new(connector: Arc<C>, settings: ConnectionSettings) -> Self {
        Self {
            connector,
            settings,
            registry: Arc::new(Registry {
                entries: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// 获取连接（按需建立）
    pub async fn acquire(
        &self,
        identity: &str,
        credentials: &Credentials,
    ) -> Result<Arc<Connection<C::Transport>>, SshError> {
        let config = SshConfig::from_credentials(credentials, &self.settings);
        self.acquire_with(identity, config).await
    }

    /// 使用完整配置获取连接
    ///
    /// - 已有可用连接：刷新活动时间后直接返回
    /// - 已有进行中的握手：等待同一个结果
    /// - 否则发起新握手；失败时移除条目，所有等待者收到同一个 `ConnectionFailed`
    pub async fn acquire_with(
        &self,
        identity: &str,
        config: SshConfig,
    ) -> Result<Arc<Connection<C::Transport>>, SshError> {
        let future = {
            let mut entries = self.registry.entries.lock();

            let in_flight = match entries.get(identity) {
                Some(Entry::Ready(conn)) if conn.is_ready() => {
                    conn.touch();
                    return Ok(conn.clone());
                }
                Some(Entry::Establishing { future, .. }) => Some(future.clone()),
                _ => None,
            };

            match in_flight {
                Some(future) => {
                    debug!("[SSH Manager] Joining in-flight connection for {}", identity);
                    future
                }
                None => {
                    if let Some(Entry::Ready(stale)) = entries.remove(identity) {
                        info!("[SSH Manager] Dropping stale connection {}", identity);
                        close_in_background(stale);
                    }

                    let epoch = self.registry.next_epoch.fetch_add(1, Ordering::Relaxed);
                    let future = self.spawn_establish(identity.to_string(), config, epoch);
                    entries.insert(
                        identity.to_string(),
                        Entry::Establishing {
                            epoch,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await.map_err(SshError::ConnectionFailed)
    }

    /// 在独立任务中握手，调用方取消等待不会中断握手
    fn spawn_establish(
        &self,
        identity: String,
        config: SshConfig,
        epoch: u64,
    ) -> EstablishFuture<C::Transport> {
        let connector = self.connector.clone();
        let registry = self.registry.clone();
        let max_connections = self.settings.max_connections;

        let task = tokio::spawn(async move {
            info!("[SSH Manager] Establishing connection {}", identity);

            match connector.connect(&config).await {
                Ok(transport) => {
                    let conn = Arc::new(Connection::new(identity.clone(), transport));

                    let (installed, evicted) = {
                        let mut entries = registry.entries.lock();
                        if Registry::is_current(&entries, &identity, epoch) {
                            entries.insert(identity.clone(), Entry::Ready(conn.clone()));
                            (true, evict_idle(&mut entries, max_connections, &identity))
                        } else {
                            (false, Vec::new())
                        }
                    };

                    for victim in evicted {
                        info!(
                            "[SSH Manager] Evicting least recently active connection {}",
                            victim.identity()
                        );
                        victim.close().await;
                    }

                    if installed {
                        info!("[SSH Manager] Connection {} ready", identity);
                        Ok(conn)
                    } else {
                        info!(
                            "[SSH Manager] Connection {} was released during establishment",
                            identity
                        );
                        conn.close().await;
                        Err("Connection released during establishment".to_string())
                    }
                }
                Err(e) => {
                    warn!("[SSH Manager] Failed to connect {}: {}", identity, e);
                    let mut entries = registry.entries.lock();
                    if Registry::is_current(&entries, &identity, epoch) {
                        entries.remove(&identity);
                    }
                    Err(e.to_string())
                }
            }
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(format!("Connection task aborted: {}", e)))
        }
        .boxed()
        .shared()
    }

    /// 获取已就绪的连接（不建立新连接）
    pub fn get(&self, identity: &str) -> Option<Arc<Connection<C::Transport>>> {
        match self.lock_live().get(identity) {
            Some(Entry::Ready(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    /// 查询连接状态；不在注册表中返回 None
    pub fn state(&self, identity: &str) -> Option<ConnectionState> {
        match self.lock_live().get(identity)? {
            Entry::Establishing { .. } => Some(ConnectionState::Establishing),
            Entry::Ready(conn) => Some(conn.state()),
        }
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_live().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock_live().len()
    }

    /// 加锁并移除传输已断开的就绪条目，被移除的连接在后台关闭
    fn lock_live(&self) -> parking_lot::MutexGuard<'_, HashMap<String, Entry<C::Transport>>> {
        let mut entries = self.registry.entries.lock();
        let dead: Vec<String> = entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Ready(conn) if !conn.is_ready() => Some(id.clone()),
                _ => None,
            })
            .collect();

        for identity in dead {
            if let Some(Entry::Ready(conn)) = entries.remove(&identity) {
                info!("[SSH Manager] Removing closed connection {}", identity);
                close_in_background(conn);
            }
        }
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关闭并移除单个会话
    pub async fn release_session(&self, identity: &str) -> bool {
        let removed = self.registry.entries.lock().remove(identity);
        match removed {
            Some(entry) => {
                close_entry(identity, entry).await;
                true
            }
            None => false,
        }
    }

    /// 关闭并移除所有标识包含 `pattern` 的会话，返回移除数量
    /// 关闭是尽力而为的，传输层错误被忽略
    pub async fn release_all(&self, pattern: &str) -> usize {
        let removed: Vec<(String, Entry<C::Transport>)> = {
            let mut entries = self.registry.entries.lock();
            let matched: Vec<String> = entries
                .keys()
                .filter(|id| id.contains(pattern))
                .cloned()
                .collect();
            matched
                .into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = removed.len();
        for (identity, entry) in removed {
            close_entry(&identity, entry).await;
        }

        if count > 0 {
            info!(
                "[SSH Manager] Released {} session(s) matching '{}'",
                count, pattern
            );
        }
        count
    }
}

async fn close_entry<T: Transport>(identity: &str, entry: Entry<T>) {
    match entry {
        Entry::Ready(conn) => conn.close().await,
        // 握手任务完成时发现条目已不存在，会自行关闭传输
        Entry::Establishing { .. } => {
            debug!("[SSH Manager] Abandoned in-flight connection {}", identity);
        }
    }
}

/// 尽力关闭；没有运行时的情况下只丢弃引用
fn close_in_background<T: Transport>(conn: Arc<Connection<T>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { conn.close().await });
        }
        Err(_) => debug!(
            "[SSH Manager] No runtime to close {}, dropping it",
            conn.identity()
        ),
    }
}

/// 就绪连接超过上限时，移除最久未活动的连接（不含刚登记的 `keep`）
fn evict_idle<T: Transport>(
    entries: &mut HashMap<String, Entry<T>>,
    max_connections: usize,
    keep: &str,
) -> Vec<Arc<Connection<T>>> {
    let mut evicted = Vec::new();
    if max_connections == 0 {
        return evicted;
    }

    loop {
        let ready: Vec<(&String, Instant)> = entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                Entry::Ready(conn) => Some((id, conn.last_active())),
                Entry::Establishing { .. } => None,
            })
            .collect();

        if ready.len() <= max_connections {
            break;
        }

        let victim = ready
            .iter()
            .filter(|(id, _)| id.as_str() != keep)
            .min_by_key(|(_, last_active)| *last_active)
            .map(|(id, _)| (*id).clone());

        match victim {
            Some(id) => {
                if let Some(Entry::Ready(conn)) = entries.remove(&id) {
                    evicted.push(conn);
                }
            }
            None => break,
        }
    }

    evicted
}
