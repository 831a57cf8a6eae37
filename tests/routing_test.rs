//! Template selection and routing through the full pipeline

use std::sync::Arc;
use std::time::Duration;
use tokio::time::advance;

use netwatch_monitor::{
    AuditLog, BillingStatus, InMemoryDirectory, InMemoryTemplateStore, Monitor, MonitorConfig,
    RawLink, Recipient, SendResult, Sender,
};

struct NullSender;

impl Sender for NullSender {
    fn name(&self) -> &str {
        "null"
    }

    fn send(&self, _recipient_id: &str, _text: &str) -> anyhow::Result<SendResult> {
        Ok(SendResult::Sent { id: None })
    }
}

fn recipient(name: &str, link: &str, group: &str, billing: BillingStatus) -> Recipient {
    Recipient {
        name: name.to_string(),
        messenger_id: format!("mid-{}", name),
        connection_name: link.to_string(),
        group_name: group.to_string(),
        billing_status: billing,
    }
}

fn link(name: &str, status: &str) -> RawLink {
    RawLink {
        name: name.to_string(),
        status: status.to_string(),
    }
}

fn monitor_with(
    recipients: Vec<Recipient>,
    templates: InMemoryTemplateStore,
    audit: Arc<AuditLog>,
) -> Monitor {
    Monitor::new(
        MonitorConfig::default(),
        Arc::new(InMemoryDirectory::new(recipients)),
        Arc::new(templates),
        Arc::new(NullSender),
        audit,
    )
}

#[tokio::test(start_paused = true)]
async fn test_bare_state_template_selected_when_specific_ones_missing() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    // Only the bare DOWN template exists; every more specific candidate is absent
    let templates = InMemoryTemplateStore::with_entries(&[("DOWN", "generic outage notice")]);
    let monitor = monitor_with(
        vec![recipient(
            "alicia",
            "PRIVATE-ALICIA",
            "G1",
            BillingStatus::Active,
        )],
        templates,
        Arc::clone(&audit),
    );
    let mut poller = monitor.poller_for("G1");
    let dispatcher = monitor.dispatcher();

    poller.apply_scan(vec![link("PRIVATE-ALICIA", "up")]);
    advance(Duration::from_secs(10)).await;
    poller.apply_scan(vec![link("PRIVATE-ALICIA", "down")]);
    advance(Duration::from_secs(100)).await;

    dispatcher.drain_once().await;
    let rows = audit.recent(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].template, "DOWN");
}

#[tokio::test(start_paused = true)]
async fn test_group_specific_template_beats_bare_state() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    let templates = InMemoryTemplateStore::with_entries(&[
        ("G1-DOWN", "group outage notice"),
        ("DOWN", "generic outage notice"),
    ]);
    let monitor = monitor_with(
        vec![recipient(
            "alicia",
            "PRIVATE-ALICIA",
            "G1",
            BillingStatus::Active,
        )],
        templates,
        Arc::clone(&audit),
    );
    let mut poller = monitor.poller_for("G1");
    let dispatcher = monitor.dispatcher();

    poller.apply_scan(vec![link("PRIVATE-ALICIA", "up")]);
    advance(Duration::from_secs(10)).await;
    poller.apply_scan(vec![link("PRIVATE-ALICIA", "down")]);
    advance(Duration::from_secs(100)).await;

    dispatcher.drain_once().await;
    let rows = audit.recent(10).unwrap();
    assert_eq!(rows[0].template, "G1-DOWN");
}

#[tokio::test(start_paused = true)]
async fn test_missing_template_auto_created_and_reused() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    let templates = InMemoryTemplateStore::new();
    let monitor = monitor_with(
        vec![recipient(
            "alicia",
            "PRIVATE-ALICIA",
            "G1",
            BillingStatus::Active,
        )],
        templates,
        Arc::clone(&audit),
    );
    let mut poller = monitor.poller_for("G1");
    let dispatcher = monitor.dispatcher();

    // First DOWN: template auto-created under the most specific title
    poller.apply_scan(vec![link("PRIVATE-ALICIA", "up")]);
    advance(Duration::from_secs(10)).await;
    poller.apply_scan(vec![link("PRIVATE-ALICIA", "down")]);
    advance(Duration::from_secs(100)).await;
    dispatcher.drain_once().await;

    // Bounce back up, then DOWN again later: the created template is reused
    advance(Duration::from_secs(100)).await;
    poller.apply_scan(vec![link("PRIVATE-ALICIA", "up")]);
    advance(Duration::from_secs(200)).await;
    poller.apply_scan(vec![link("PRIVATE-ALICIA", "down")]);
    advance(Duration::from_secs(200)).await;
    dispatcher.drain_once().await;

    let rows = audit.recent(10).unwrap();
    let down_rows: Vec<_> = rows.iter().filter(|r| r.state == "DOWN").collect();
    assert_eq!(down_rows.len(), 2);
    for row in down_rows {
        assert_eq!(row.template, "PRIVATE-ALICIA-G1-DOWN");
    }
}

#[tokio::test(start_paused = true)]
async fn test_isp_outage_broadcasts_to_whole_group() {
    let audit_dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::with_path(audit_dir.path().join("deliveries.jsonl")));
    let monitor = monitor_with(
        vec![
            recipient("alicia", "PRIVATE-ALICIA", "G1", BillingStatus::Active),
            recipient("bob", "PRIVATE-BOB", "G1", BillingStatus::Active),
            recipient("carol", "PRIVATE-CAROL", "G1", BillingStatus::Cutoff),
            recipient("ops", "ADMIN", "G1", BillingStatus::Active),
        ],
        InMemoryTemplateStore::new(),
        Arc::clone(&audit),
    );
    let mut poller = monitor.poller_for("G1");
    let dispatcher = monitor.dispatcher();

    poller.apply_scan(vec![
        link("ISP-PLDT", "up"),
        link("PRIVATE-ALICIA", "up"),
        link("PRIVATE-BOB", "up"),
        link("PRIVATE-CAROL", "up"),
    ]);
    advance(Duration::from_secs(10)).await;
    poller.apply_scan(vec![
        link("ISP-PLDT", "down"),
        link("PRIVATE-ALICIA", "up"),
        link("PRIVATE-BOB", "up"),
        link("PRIVATE-CAROL", "up"),
    ]);
    advance(Duration::from_secs(100)).await;
    dispatcher.drain_once().await;

    // Cutoff subscribers are excluded; everyone else plus the admin is notified
    let rows = audit.recent(10).unwrap();
    let mut recipients: Vec<String> = rows.iter().map(|r| r.recipient.clone()).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["alicia", "bob", "ops"]);
    assert!(rows.iter().all(|r| r.link == "ISP-PLDT" && r.state == "DOWN"));
}
