// 终端输出转发服务
//
// 输出方向：Shell 通道事件 -> 有序事件流（供 SSE 等单向长连接消费）
// 输入方向：按键与尺寸变化经 send_input 旁路写入，不经过事件流

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ssh::client::SshConnector;
use crate::ssh::config::Credentials;
use crate::ssh::connection::Connector;
use crate::ssh::error::SshError;
use crate::ssh::manager::SshManager;
use crate::ssh::session::{ChannelEvent, PtyRequest, ShellSubscription, TerminalChannel};

/// 对外的终端事件流
pub type ShellStream = BoxStream<'static, ShellEvent>;

/// 终端事件
/// 序列化为 `{"type": "output", "data": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ShellEvent {
    /// 一次远端输出
    Output(String),
    /// 通道关闭，之后不再有事件
    Exit(String),
    /// 通道或连接出错，之后不再有事件
    Error(String),
}

/// 终端输入（按键或尺寸变化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TerminalInput {
    /// 原样转发的按键数据
    Data { identity: String, data: String },
    /// 终端尺寸变化
    Resize {
        identity: String,
        cols: u32,
        rows: u32,
    },
}

impl TerminalInput {
    pub fn identity(&self) -> &str {
        match self {
            TerminalInput::Data { identity, .. } | TerminalInput::Resize { identity, .. } => {
                identity
            }
        }
    }
}

/// 终端服务
pub struct TerminalService<C: Connector = SshConnector> {
    manager: Arc<SshManager<C>>,
    pty: PtyRequest,
}

impl<C: Connector> TerminalService<C> {
    pub fn new(manager: Arc<SshManager<C>>, pty: PtyRequest) -> Self {
        Self { manager, pty }
    }

    /// 打开（或重新附着到）某个会话的 Shell 输出流
    ///
    /// 连接或通道失败时返回只含一个 Error 事件的流。
    /// 流被丢弃只会取消订阅，Shell 仍缓存在连接上供下次附着。
    pub async fn open_shell_stream(&self, identity: &str, credentials: &Credentials) -> ShellStream {
        match self.attach(identity, credentials).await {
            Ok(shell) => {
                info!("[Terminal] Attaching output stream to {}", identity);
                // 首次 poll 时才订阅，取代旧订阅者
                stream::once(async move { shell.subscribe().await })
                    .flat_map(relay)
                    .boxed()
            }
            Err(e) => {
                warn!("[Terminal] Failed to open shell for {}: {}", identity, e);
                stream::once(async move { ShellEvent::Error(e.to_string()) }).boxed()
            }
        }
    }

    async fn attach(
        &self,
        identity: &str,
        credentials: &Credentials,
    ) -> Result<Arc<TerminalChannel>, SshError> {
        let conn = self.manager.acquire(identity, credentials).await?;
        conn.open_shell(&self.pty).await
    }

    /// 写入按键或调整尺寸
    ///
    /// 会话没有可写的 Shell 时返回 ChannelFailed，调用方应重新建立连接
    pub async fn send_input(&self, input: TerminalInput) -> Result<(), SshError> {
        let shell = self.live_shell(input.identity()).await?;
        match input {
            TerminalInput::Data { data, .. } => shell.write(data.as_bytes()),
            TerminalInput::Resize {
                identity,
                cols,
                rows,
            } => {
                debug!("[Terminal] Resize {} to {}x{}", identity, cols, rows);
                shell.resize(cols, rows)
            }
        }
    }

    async fn live_shell(&self, identity: &str) -> Result<Arc<TerminalChannel>, SshError> {
        let conn = self.manager.get(identity).ok_or_else(|| {
            SshError::ChannelFailed(format!("No active connection for {}", identity))
        })?;
        conn.touch();

        match conn.cached_shell().await {
            Some(shell) if shell.is_writable() => Ok(shell),
            _ => Err(SshError::ChannelFailed(format!(
                "No writable shell for {}",
                identity
            ))),
        }
    }
}

/// 把一个订阅转成事件流
///
/// 每次远端数据投递至多产生一个 Output 事件；Exit 或 Error 之后流结束；
/// 被新订阅者取代时直接结束，不产生终止事件
pub fn relay(subscription: ShellSubscription) -> ShellStream {
    stream::unfold(
        Some((subscription, Utf8Decoder::default())),
        |state| async move {
            let (mut subscription, mut decoder) = state?;
            loop {
                let event = match subscription.next().await? {
                    ChannelEvent::Data(bytes) => {
                        let text = decoder.decode(&bytes);
                        if text.is_empty() {
                            continue;
                        }
                        return Some((ShellEvent::Output(text), Some((subscription, decoder))));
                    }
                    ChannelEvent::Exit(reason) => ShellEvent::Exit(reason),
                    ChannelEvent::Error(message) => ShellEvent::Error(message),
                };
                return Some((event, None));
            }
        },
    )
    .boxed()
}

/// 增量 UTF-8 解码
/// 被拆到两次投递中的多字节字符留到下一次一起输出，非法字节替换为 U+FFFD
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // 末尾是不完整的字符
                            self.pending.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::ConnectionSettings;
    use crate::ssh::mock::MockConnector;
    use crate::ssh::session::ShellCommand;

    fn creds() -> Credentials {
        Credentials::new("h", "u", "secret")
    }

    fn service(connector: &Arc<MockConnector>) -> TerminalService<MockConnector> {
        let manager = Arc::new(SshManager::new(
            connector.clone(),
            ConnectionSettings::default(),
        ));
        TerminalService::new(manager, PtyRequest::default())
    }

    #[tokio::test]
    async fn test_stream_relays_output_then_exit() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);

        let stream = service.open_shell_stream("u@h", &creds()).await;
        let remote = connector.transport(0);
        remote.emit(0, ChannelEvent::Data(b"hello".to_vec()));
        remote.emit(0, ChannelEvent::Data(b" world".to_vec()));
        remote.emit(0, ChannelEvent::Exit("exit status 0".to_string()));
        remote.emit(0, ChannelEvent::Data(b"after exit".to_vec()));

        let events: Vec<ShellEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                ShellEvent::Output("hello".to_string()),
                ShellEvent::Output(" world".to_string()),
                ShellEvent::Exit("exit status 0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_failure_yields_single_error_event() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_with("auth rejected");
        let service = service(&connector);

        let events: Vec<ShellEvent> = service
            .open_shell_stream("u@h", &creds())
            .await
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ShellEvent::Error(msg) if msg.contains("auth rejected")));
    }

    #[tokio::test]
    async fn test_channel_error_terminates_stream() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);

        let stream = service.open_shell_stream("u@h", &creds()).await;
        let remote = connector.transport(0);
        remote.emit(0, ChannelEvent::Data(b"$ ".to_vec()));
        remote.emit(0, ChannelEvent::Error("connection lost".to_string()));

        let events: Vec<ShellEvent> = stream.collect().await;
        assert_eq!(
            events.last(),
            Some(&ShellEvent::Error("connection lost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_split_multibyte_character_emitted_whole() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);

        let mut stream = service.open_shell_stream("u@h", &creds()).await;
        let remote = connector.transport(0);
        // "你" = E4 BD A0
        remote.emit(0, ChannelEvent::Data(vec![b'>', 0xE4, 0xBD]));
        remote.emit(0, ChannelEvent::Data(vec![0xA0, b'!']));

        assert_eq!(stream.next().await, Some(ShellEvent::Output(">".to_string())));
        assert_eq!(
            stream.next().await,
            Some(ShellEvent::Output("你!".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dropped_stream_keeps_shell_for_reattach() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);

        let mut first = service.open_shell_stream("u@h", &creds()).await;
        let remote = connector.transport(0);
        remote.emit(0, ChannelEvent::Data(b"one".to_vec()));
        assert_eq!(first.next().await, Some(ShellEvent::Output("one".to_string())));
        drop(first);

        // 无人订阅期间的输出留给下一个订阅者
        remote.emit(0, ChannelEvent::Data(b"two".to_vec()));

        let mut second = service.open_shell_stream("u@h", &creds()).await;
        assert_eq!(second.next().await, Some(ShellEvent::Output("two".to_string())));
        assert_eq!(remote.shells_opened(), 1);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_new_stream_takes_over_previous_consumer() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);

        let mut first = service.open_shell_stream("u@h", &creds()).await;
        let remote = connector.transport(0);
        remote.emit(0, ChannelEvent::Data(b"a".to_vec()));
        assert_eq!(first.next().await, Some(ShellEvent::Output("a".to_string())));

        let mut second = service.open_shell_stream("u@h", &creds()).await;
        let pending = tokio::spawn(async move { second.next().await });

        // 旧流结束且不产生终止事件
        assert_eq!(first.next().await, None);

        remote.emit(0, ChannelEvent::Data(b"b".to_vec()));
        assert_eq!(
            pending.await.unwrap(),
            Some(ShellEvent::Output("b".to_string()))
        );
    }

    #[tokio::test]
    async fn test_send_input_forwards_data_and_resize() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);
        let _stream = service.open_shell_stream("u@h", &creds()).await;

        service
            .send_input(TerminalInput::Data {
                identity: "u@h".to_string(),
                data: "ls -la\r".to_string(),
            })
            .await
            .unwrap();
        service
            .send_input(TerminalInput::Resize {
                identity: "u@h".to_string(),
                cols: 120,
                rows: 40,
            })
            .await
            .unwrap();

        let commands = connector.transport(0).drain_commands(0);
        assert!(matches!(&commands[0], ShellCommand::Data(d) if d == b"ls -la\r"));
        assert!(matches!(
            commands[1],
            ShellCommand::Resize { cols: 120, rows: 40 }
        ));
    }

    #[tokio::test]
    async fn test_send_input_to_dead_shell_is_channel_failed() {
        let connector = Arc::new(MockConnector::new());
        let service = service(&connector);

        let missing = service
            .send_input(TerminalInput::Data {
                identity: "u@h".to_string(),
                data: "x".to_string(),
            })
            .await;
        assert!(matches!(missing, Err(SshError::ChannelFailed(_))));

        let _stream = service.open_shell_stream("u@h", &creds()).await;
        connector.transport(0).kill_shell(0);

        let dead = service
            .send_input(TerminalInput::Data {
                identity: "u@h".to_string(),
                data: "x".to_string(),
            })
            .await;
        assert!(matches!(dead, Err(SshError::ChannelFailed(_))));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&ShellEvent::Output("hi".to_string())).unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi"}"#);

        let input: TerminalInput =
            serde_json::from_str(r#"{"identity":"u@h","cols":100,"rows":30}"#).unwrap();
        assert_eq!(
            input,
            TerminalInput::Resize {
                identity: "u@h".to_string(),
                cols: 100,
                rows: 30,
            }
        );
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xE4]), "");
        assert_eq!(decoder.decode(&[0xBD, 0xA0]), "你");
    }
}
