//! 外发调度器 - 分组限速队列与后台投递 worker
//!
//! 每个分组一条 FIFO 队列；入队对调用方完全非阻塞。单个后台 worker
//! 每拍扫描所有分组：秒级计数窗口到期则重置，然后在限额内弹出消息、
//! 逐条经 Sender 投递并写审计行。发送发生在锁外，一个分组的失败
//! 不会影响其他分组的队列。

use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::audit::{AuditLog, DeliveryRecord};
use super::sender::Sender;

/// 待投递消息
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub group: String,
    pub link: String,
    pub state: String,
    pub template: String,
    pub recipient_id: String,
    pub recipient: String,
    pub text: String,
}

/// 秒级限速窗口
const RATE_WINDOW: Duration = Duration::from_secs(1);

struct GroupQueue {
    queue: VecDeque<QueuedMessage>,
    window_started: Instant,
    sent_in_window: u32,
}

impl GroupQueue {
    fn new(now: Instant) -> Self {
        Self {
            queue: VecDeque::new(),
            window_started: now,
            sent_in_window: 0,
        }
    }
}

/// 外发调度器
pub struct Dispatcher {
    queues: Mutex<HashMap<String, GroupQueue>>,
    rate_limit: u32,
    tick: Duration,
    sender: Arc<dyn Sender>,
    audit: Arc<AuditLog>,
}

impl Dispatcher {
    pub fn new(
        rate_limit: u32,
        tick: Duration,
        sender: Arc<dyn Sender>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            rate_limit,
            tick,
            sender,
            audit,
        }
    }

    /// 入队；不阻塞、不等待投递
    pub fn enqueue(&self, message: QueuedMessage) {
        let mut queues = self.queues.lock().expect("dispatcher poisoned");
        let queue = queues
            .entry(message.group.clone())
            .or_insert_with(|| GroupQueue::new(Instant::now()));
        queue.queue.push_back(message);
    }

    /// 某分组当前积压的消息数
    pub fn pending(&self, group: &str) -> usize {
        let queues = self.queues.lock().expect("dispatcher poisoned");
        queues.get(group).map_or(0, |q| q.queue.len())
    }

    /// 启动后台投递 worker
    pub fn spawn_worker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.tick).await;
                self.drain_once().await;
            }
        })
    }

    /// 执行一拍投递：限额内弹出各分组消息并逐条发送
    pub async fn drain_once(&self) {
        let batch = self.pop_batch();
        for message in batch {
            self.deliver(message).await;
        }
    }

    /// 锁内弹出本拍可发送的消息；锁不跨越任何 I/O
    fn pop_batch(&self) -> Vec<QueuedMessage> {
        let mut queues = self.queues.lock().expect("dispatcher poisoned");
        let now = Instant::now();
        let mut batch = Vec::new();

        for queue in queues.values_mut() {
            if now.duration_since(queue.window_started) >= RATE_WINDOW {
                queue.window_started = now;
                queue.sent_in_window = 0;
            }
            while queue.sent_in_window < self.rate_limit {
                match queue.queue.pop_front() {
                    Some(message) => {
                        queue.sent_in_window += 1;
                        batch.push(message);
                    }
                    None => break,
                }
            }
        }
        batch
    }

    async fn deliver(&self, message: QueuedMessage) {
        let sender = Arc::clone(&self.sender);
        let recipient_id = message.recipient_id.clone();
        let text = message.text.clone();

        let result = tokio::task::spawn_blocking(move || sender.send(&recipient_id, &text)).await;

        let outcome = match result {
            Ok(Ok(send_result)) => {
                if !send_result.delivered() {
                    warn!(
                        group = %message.group,
                        recipient = %message.recipient,
                        outcome = send_result.outcome(),
                        "Message not delivered"
                    );
                } else {
                    debug!(
                        group = %message.group,
                        link = %message.link,
                        recipient = %message.recipient,
                        "Message delivered"
                    );
                }
                send_result.outcome().to_string()
            }
            Ok(Err(e)) => {
                error!(group = %message.group, recipient = %message.recipient, error = %e, "Send failed");
                "failed".to_string()
            }
            Err(e) => {
                error!(group = %message.group, error = %e, "Send task panicked");
                "failed".to_string()
            }
        };

        // 审计是 fire-and-forget：写入失败不影响后续投递
        if let Err(e) = self.record_audit(&message, &outcome) {
            debug!(error = %e, "Failed to write delivery audit row");
        }
    }

    fn record_audit(&self, message: &QueuedMessage, outcome: &str) -> Result<()> {
        self.audit.record(&DeliveryRecord {
            ts: Utc::now(),
            group: message.group.clone(),
            link: message.link.clone(),
            state: message.state.clone(),
            recipient: message.recipient.clone(),
            template: message.template.clone(),
            outcome: outcome.to_string(),
        })
    }
}
