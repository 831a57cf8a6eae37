//! Rate-limited delivery tests for the dispatcher

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::advance;

use netwatch_monitor::{AuditLog, Dispatcher, QueuedMessage, SendResult, Sender};

/// Sender that records delivery order
struct RecordingSender {
    sent: Mutex<Vec<String>>,
}

impl RecordingSender {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl Sender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, _recipient_id: &str, text: &str) -> anyhow::Result<SendResult> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(SendResult::Sent { id: None })
    }
}

/// Sender that fails for one group's recipients
struct FlakySender {
    failing_prefix: String,
    attempts: Mutex<Vec<(String, bool)>>,
}

impl FlakySender {
    fn new(failing_prefix: &str) -> Self {
        Self {
            failing_prefix: failing_prefix.to_string(),
            attempts: Mutex::new(Vec::new()),
        }
    }
}

impl Sender for FlakySender {
    fn name(&self) -> &str {
        "flaky"
    }

    fn send(&self, recipient_id: &str, _text: &str) -> anyhow::Result<SendResult> {
        let fails = recipient_id.starts_with(&self.failing_prefix);
        self.attempts
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), !fails));
        if fails {
            Ok(SendResult::Failed("connection reset".to_string()))
        } else {
            Ok(SendResult::Sent { id: None })
        }
    }
}

fn message(group: &str, seq: usize) -> QueuedMessage {
    QueuedMessage {
        group: group.to_string(),
        link: "PRIVATE-ALICIA".to_string(),
        state: "DOWN".to_string(),
        template: "DOWN".to_string(),
        recipient_id: format!("{}-rcpt-{}", group, seq),
        recipient: format!("recipient-{}", seq),
        text: format!("msg-{}", seq),
    }
}

fn dispatcher(sender: Arc<dyn Sender>, audit: Arc<AuditLog>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        5,
        Duration::from_millis(100),
        sender,
        audit,
    ))
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_five_per_second_in_fifo_order() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    let sender = Arc::new(RecordingSender::new());
    let dispatcher = dispatcher(sender.clone(), Arc::clone(&audit));

    for seq in 0..20 {
        dispatcher.enqueue(message("G1", seq));
    }
    assert_eq!(dispatcher.pending("G1"), 20);

    // First second: exactly the rate limit goes out
    dispatcher.drain_once().await;
    assert_eq!(sender.sent().len(), 5);
    // Re-draining within the same second sends nothing more
    dispatcher.drain_once().await;
    assert_eq!(sender.sent().len(), 5);
    assert_eq!(dispatcher.pending("G1"), 15);

    // Subsequent seconds drain the rest, preserving FIFO order
    for _ in 0..3 {
        advance(Duration::from_secs(1)).await;
        dispatcher.drain_once().await;
    }
    let sent = sender.sent();
    assert_eq!(sent.len(), 20);
    let expected: Vec<String> = (0..20).map(|i| format!("msg-{}", i)).collect();
    assert_eq!(sent, expected);
    assert_eq!(dispatcher.pending("G1"), 0);

    // Every attempt produced an audit row
    assert_eq!(audit.recent(100).unwrap().len(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_group_queues_are_isolated() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    // Every G1 recipient fails; G2 must be unaffected
    let sender = Arc::new(FlakySender::new("G1"));
    let dispatcher = dispatcher(sender.clone(), Arc::clone(&audit));

    for seq in 0..3 {
        dispatcher.enqueue(message("G1", seq));
        dispatcher.enqueue(message("G2", seq));
    }
    dispatcher.drain_once().await;

    let rows = audit.recent(100).unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(
        rows.iter()
            .filter(|r| r.group == "G2" && r.outcome == "sent")
            .count(),
        3
    );
    assert_eq!(
        rows.iter()
            .filter(|r| r.group == "G1" && r.outcome == "failed")
            .count(),
        3
    );
    assert_eq!(dispatcher.pending("G1"), 0);
    assert_eq!(dispatcher.pending("G2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_each_group_has_its_own_rate_budget() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    let sender = Arc::new(RecordingSender::new());
    let dispatcher = dispatcher(sender.clone(), Arc::clone(&audit));

    for seq in 0..8 {
        dispatcher.enqueue(message("G1", seq));
        dispatcher.enqueue(message("G2", seq));
    }
    dispatcher.drain_once().await;

    // 5 per group in the same second, not 5 total
    assert_eq!(sender.sent().len(), 10);
    assert_eq!(dispatcher.pending("G1"), 3);
    assert_eq!(dispatcher.pending("G2"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_background_worker_drains_queue() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    let sender = Arc::new(RecordingSender::new());
    let dispatcher = dispatcher(sender.clone(), Arc::clone(&audit));

    let worker = Arc::clone(&dispatcher).spawn_worker();
    for seq in 0..7 {
        dispatcher.enqueue(message("G1", seq));
    }

    // Two worker windows are enough for 7 messages at 5/s
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(sender.sent().len(), 7);
    worker.abort();
}
