//! Netwatch Monitor - 链路可达性监控与订户通知分发引擎

pub mod config;
pub mod debounce;
pub mod engine;
pub mod flap;
pub mod notify;
pub mod poller;
pub mod router;
pub mod state;

pub use config::{load_router_map, MonitorConfig, Settings};
pub use debounce::StabilityScheduler;
pub use engine::{build_router_clients, data_dir, load_directory, load_templates, Monitor, MonitorHandles};
pub use flap::{FlapDetector, FlipOutcome};
pub use poller::Poller;

pub use notify::{
    AdminDedupeCache, AuditLog, BillingStatus, ConsoleSender, DedupeKey, DeliveryRecord,
    Dispatcher, FileDirectory, FileTemplateStore, InMemoryDirectory, InMemoryTemplateStore,
    MessengerConfig, MessengerSender, NoticeKind, NotificationRouter, Outbound, QueuedMessage,
    Recipient, RecipientDirectory, SendResult, Sender, Template, TemplateStore,
};
pub use router::{RawLink, RestClientConfig, RouterClient, RouterOsRestClient};
pub use state::{
    normalize_link_name, Applied, EffectiveState, LinkKey, LinkRecord, LinkStateStore,
    ObservedState, Role,
};
