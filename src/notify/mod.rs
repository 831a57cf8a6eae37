//! 通知层 - 路由解析、限速外发、去重与审计
//!
//! # 设计目标
//! 1. 能力边界清晰：`Sender`、`TemplateStore`、`RecipientDirectory` 都是 trait，
//!    外部协作方（计费系统、HTTP 层）只依赖这些接口投递已解析的消息
//! 2. 非阻塞：路由解析后入队即返回，投递由后台 worker 完成
//! 3. 分组隔离：一个分组的投递失败不影响其他分组

pub mod audit;
pub mod dedupe;
pub mod dispatcher;
pub mod recipient;
pub mod router;
pub mod sender;
pub mod template;

pub use audit::{AuditLog, DeliveryRecord};
pub use dedupe::{AdminDedupeCache, DedupeKey};
pub use dispatcher::{Dispatcher, QueuedMessage};
pub use recipient::{BillingStatus, FileDirectory, InMemoryDirectory, Recipient, RecipientDirectory};
pub use router::{NoticeKind, NotificationRouter, Outbound};
pub use sender::{ConsoleSender, MessengerConfig, MessengerSender, SendResult, Sender};
pub use template::{FileTemplateStore, InMemoryTemplateStore, Template, TemplateStore};
