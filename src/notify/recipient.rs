//! 接收者目录 - 订户记录与查询能力
//!
//! 订户的 CRUD 属于外部协作方；这里只定义查询 trait 与两种轻量实现：
//! JSON 文件目录（独立部署用）和内存目录（测试与 send-test 用）。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::state::{normalize_link_name, Role};

/// 计费状态；影响通知资格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BillingStatus {
    Active,
    Unpaid,
    Limited,
    Cutoff,
}

impl BillingStatus {
    /// 是否处于完全阻断的计费状态
    pub fn is_blocked(&self) -> bool {
        matches!(self, BillingStatus::Cutoff | BillingStatus::Limited)
    }
}

/// 订户记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    /// 显示名
    pub name: String,
    /// Messenger 接收者 ID
    pub messenger_id: String,
    /// 绑定的链路名（规范化后）
    pub connection_name: String,
    /// 所属分组
    pub group_name: String,
    /// 计费状态
    #[serde(default = "default_billing")]
    pub billing_status: BillingStatus,
}

fn default_billing() -> BillingStatus {
    BillingStatus::Active
}

impl Recipient {
    /// 是否为管理员接收者
    pub fn is_admin(&self) -> bool {
        Role::of(&self.connection_name) == Role::Admin
    }
}

/// 接收者查询能力
pub trait RecipientDirectory: Send + Sync {
    /// 某分组的全部订户（含管理员）
    fn list_group(&self, group: &str) -> Vec<Recipient>;

    /// 链路名精确匹配的订户
    fn list_by_link(&self, group: &str, link_name: &str) -> Vec<Recipient>;
}

/// 内存目录
pub struct InMemoryDirectory {
    recipients: Mutex<Vec<Recipient>>,
}

impl InMemoryDirectory {
    pub fn new(mut recipients: Vec<Recipient>) -> Self {
        for r in &mut recipients {
            r.connection_name = normalize_link_name(&r.connection_name);
        }
        Self {
            recipients: Mutex::new(recipients),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn insert(&self, mut recipient: Recipient) {
        recipient.connection_name = normalize_link_name(&recipient.connection_name);
        self.recipients
            .lock()
            .expect("directory poisoned")
            .push(recipient);
    }
}

impl RecipientDirectory for InMemoryDirectory {
    fn list_group(&self, group: &str) -> Vec<Recipient> {
        self.recipients
            .lock()
            .expect("directory poisoned")
            .iter()
            .filter(|r| r.group_name == group)
            .cloned()
            .collect()
    }

    fn list_by_link(&self, group: &str, link_name: &str) -> Vec<Recipient> {
        let wanted = normalize_link_name(link_name);
        self.recipients
            .lock()
            .expect("directory poisoned")
            .iter()
            .filter(|r| r.group_name == group && r.connection_name == wanted)
            .cloned()
            .collect()
    }
}

/// JSON 文件目录
///
/// 文件是一个 `Recipient` 数组；加载时统一规范化链路名。
pub struct FileDirectory {
    inner: InMemoryDirectory,
}

impl FileDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipient file {}", path.display()))?;
        let recipients: Vec<Recipient> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid recipient file {}", path.display()))?;
        Ok(Self {
            inner: InMemoryDirectory::new(recipients),
        })
    }
}

impl RecipientDirectory for FileDirectory {
    fn list_group(&self, group: &str) -> Vec<Recipient> {
        self.inner.list_group(group)
    }

    fn list_by_link(&self, group: &str, link_name: &str) -> Vec<Recipient> {
        self.inner.list_by_link(group, link_name)
    }
}
