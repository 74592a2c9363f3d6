// Shell 输出缓冲队列
//
// 没有订阅者时远端输出仍会持续到达（比如页面关闭后仍在运行的 `tail -f`）。
// 队列按数据字节数计入上限，超出后从最早的数据块开始丢弃，终止事件不会被丢弃。

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::session::ChannelEvent;

/// 默认最多缓存 1 MiB 未读输出
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 1024 * 1024;

struct QueueState {
    events: VecDeque<ChannelEvent>,
    /// 队列中数据块的总字节数
    bytes: usize,
    /// 因超出上限丢弃的数据块数
    dropped: u64,
    closed: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_bytes: usize,
}

/// 创建一对发送端/接收端
pub fn channel(max_bytes: usize) -> (EventSender, EventReceiver) {
    let queue = Arc::new(Queue {
        state: Mutex::new(QueueState {
            events: VecDeque::new(),
            bytes: 0,
            dropped: 0,
            closed: false,
        }),
        notify: Notify::new(),
        max_bytes,
    });
    (EventSender(queue.clone()), EventReceiver(queue))
}

/// 通道持有方使用的发送端，drop 后接收端读完剩余事件即结束
pub struct EventSender(Arc<Queue>);

impl EventSender {
    pub fn send(&self, event: ChannelEvent) {
        {
            let mut state = self.0.state.lock();
            if let ChannelEvent::Data(data) = &event {
                state.bytes += data.len();
            }
            state.events.push_back(event);

            // 至少保留最新的一个事件
            while state.bytes > self.0.max_bytes && state.events.len() > 1 {
                let Some(ChannelEvent::Data(oldest)) = state.events.front() else {
                    break;
                };
                let len = oldest.len();
                state.events.pop_front();
                state.bytes -= len;
                state.dropped += 1;
                if state.dropped == 1 || state.dropped % 1000 == 0 {
                    debug!(
                        "[Terminal] Output buffer full, dropped {} chunk(s)",
                        state.dropped
                    );
                }
            }
        }
        self.0.notify.notify_one();
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        self.0.state.lock().closed = true;
        self.0.notify.notify_one();
    }
}

pub struct EventReceiver(Arc<Queue>);

impl EventReceiver {
    /// 下一个事件；发送端已关闭且队列读空时返回 None
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            let closed = self.0.state.lock().closed;
            if closed {
                return None;
            }
            self.0.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        let mut state = self.0.state.lock();
        let event = state.events.pop_front()?;
        if let ChannelEvent::Data(data) = &event {
            state.bytes -= data.len();
        }
        Some(event)
    }

    /// 当前缓存的数据字节数
    pub fn buffered_bytes(&self) -> usize {
        self.0.state.lock().bytes
    }
}
