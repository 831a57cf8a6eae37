//! 通知路由 - 解析一次状态转换应当通知谁、用哪份文案
//!
//! 按链路名前缀分三类路由：
//! - ISP：广播给分组内全部订户（已断线或 Cutoff 的除外），管理员拿到
//!   带位置后缀的第三人称变体，不做镜像去重；
//! - PRIVATE / VENDO：只发给链路名精确匹配的订户，另镜像一份给同分组
//!   的管理员，镜像受去重缓存约束；
//! - 其他前缀：泛化兜底，只发匹配订户，不做镜像。
//!
//! 欠费订户是否收到断线/抖动通知由 `notify_blocked` 策略开关决定。

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dedupe::{AdminDedupeCache, DedupeKey};
use super::recipient::{BillingStatus, Recipient, RecipientDirectory};
use super::template::{
    default_content, lookup_candidates, spike_candidates, unpaid_spike_candidates, Template,
    TemplateStore,
};
use crate::state::{LinkKey, LinkStateStore, ObservedState, Role};

/// 通知类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// 稳定态的普通通知
    Stable(ObservedState),
    /// 抖动升级通知
    SpikeDown,
    /// 抖动恢复通知
    SpikeUp,
}

impl NoticeKind {
    /// 审计与去重用的状态标签
    pub fn state_label(&self) -> &'static str {
        match self {
            NoticeKind::Stable(s) => s.as_str(),
            NoticeKind::SpikeDown => "SPIKE-DOWN",
            NoticeKind::SpikeUp => "SPIKE-UP",
        }
    }

    /// 通知成功后写入 `last_notified` 的状态
    pub fn notified_state(&self) -> ObservedState {
        match self {
            NoticeKind::Stable(s) => *s,
            NoticeKind::SpikeDown => ObservedState::Down,
            NoticeKind::SpikeUp => ObservedState::Up,
        }
    }

    fn is_spike(&self) -> bool {
        matches!(self, NoticeKind::SpikeDown | NoticeKind::SpikeUp)
    }
}

/// 一条已解析的待发通知
#[derive(Debug, Clone)]
pub struct Outbound {
    pub recipient: Recipient,
    pub text: String,
    pub template: String,
}

/// 通知路由器
pub struct NotificationRouter {
    templates: Arc<dyn TemplateStore>,
    directory: Arc<dyn RecipientDirectory>,
    dedupe: Arc<AdminDedupeCache>,
    store: Arc<LinkStateStore>,
    /// 分组 → 场地位置（管理员 ISP 变体的后缀）
    locations: HashMap<String, String>,
    /// 是否向 Cutoff/Limited 订户发送断线/抖动通知（策略钩子）
    notify_blocked: bool,
}

impl NotificationRouter {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        directory: Arc<dyn RecipientDirectory>,
        dedupe: Arc<AdminDedupeCache>,
        store: Arc<LinkStateStore>,
        locations: HashMap<String, String>,
        notify_blocked: bool,
    ) -> Self {
        Self {
            templates,
            directory,
            dedupe,
            store,
            locations,
            notify_blocked,
        }
    }

    /// 解析 `(链路, 类别)` 对应的接收者与文案
    pub fn resolve(&self, key: &LinkKey, kind: NoticeKind) -> Result<Vec<Outbound>> {
        // UNKNOWN 是合法转换但从不外发
        if kind == NoticeKind::Stable(ObservedState::Unknown) {
            return Ok(Vec::new());
        }

        let role = key.role();
        let template = self.template_for(key, role, kind)?;

        let out = match role {
            Role::Isp => self.broadcast(key, &template),
            Role::Private | Role::Vendo => self.unicast(key, role, kind, &template),
            Role::Admin | Role::Other => self.fallback(key, kind, &template),
        };
        Ok(out)
    }

    /// 接收者资格策略（唯一的策略判定点）
    fn eligible(&self, recipient: &Recipient) -> bool {
        !recipient.billing_status.is_blocked() || self.notify_blocked
    }

    /// ISP 广播：分组内全员，已断线和 Cutoff 除外；不做去重
    fn broadcast(&self, key: &LinkKey, template: &Template) -> Vec<Outbound> {
        let location = self.locations.get(&key.group).map(|s| s.as_str());
        let mut out = Vec::new();

        for recipient in self.directory.list_group(&key.group) {
            if recipient.billing_status == BillingStatus::Cutoff {
                debug!(recipient = %recipient.name, "Skipping cutoff subscriber in broadcast");
                continue;
            }
            if !recipient.is_admin() {
                let rkey = LinkKey::new(&key.group, &recipient.connection_name);
                if self.store.observed(&rkey) == Some(ObservedState::Down) {
                    debug!(recipient = %recipient.name, "Skipping subscriber whose own link is down");
                    continue;
                }
            }
            let text = if recipient.is_admin() {
                admin_variant(Role::Isp, &key.name, &template.content, location)
            } else {
                template.content.clone()
            };
            out.push(Outbound {
                recipient,
                text,
                template: template.title.clone(),
            });
        }
        out
    }

    /// PRIVATE/VENDO 单播 + 管理员镜像
    fn unicast(
        &self,
        key: &LinkKey,
        role: Role,
        kind: NoticeKind,
        template: &Template,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();

        for recipient in self.directory.list_by_link(&key.group, &key.name) {
            if !self.eligible(&recipient) {
                debug!(recipient = %recipient.name, "Skipping blocked subscriber");
                continue;
            }
            // 欠费订户的抖动通知优先使用 UNPAID 专用文案
            let tpl = if kind.is_spike() && recipient.billing_status.is_blocked() {
                self.unpaid_spike_template(role, kind)
                    .unwrap_or_else(|| template.clone())
            } else {
                template.clone()
            };
            out.push(Outbound {
                recipient,
                text: tpl.content.clone(),
                template: tpl.title,
            });
        }

        let dedupe_key = DedupeKey {
            group: key.group.clone(),
            role,
            link: key.name.clone(),
            state: kind.state_label().to_string(),
        };
        if self.dedupe.should_send(&dedupe_key, Instant::now()) {
            for admin in self.directory.list_by_link(&key.group, "ADMIN") {
                out.push(Outbound {
                    recipient: admin,
                    text: admin_variant(role, &key.name, &template.content, None),
                    template: template.title.clone(),
                });
            }
        }
        out
    }

    /// 未知前缀：只发匹配订户，不做镜像
    fn fallback(&self, key: &LinkKey, _kind: NoticeKind, template: &Template) -> Vec<Outbound> {
        self.directory
            .list_by_link(&key.group, &key.name)
            .into_iter()
            .filter(|r| self.eligible(r))
            .map(|recipient| Outbound {
                recipient,
                text: template.content.clone(),
                template: template.title.clone(),
            })
            .collect()
    }

    /// 选定文案；全部候选缺失时生成默认文案并持久化到最具体标题下
    fn template_for(&self, key: &LinkKey, role: Role, kind: NoticeKind) -> Result<Template> {
        let label = kind.state_label();
        let candidates = match kind {
            NoticeKind::Stable(_) => lookup_candidates(key, label),
            // SPIKE 标题按 UP/DOWN 方向归类，例如 PRIVATE-SPIKE-DOWN
            NoticeKind::SpikeDown | NoticeKind::SpikeUp => {
                spike_candidates(role, kind.notified_state().as_str())
            }
        };
        if let Some(found) = self.templates.find(&candidates) {
            return Ok(found);
        }

        let title = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| label.to_string());
        let content = default_content(role, label);
        warn!(template = %title, "Template not found, creating it automatically");
        if let Err(e) = self.templates.create(&title, &content) {
            warn!(template = %title, error = %e, "Failed to persist auto-created template");
        }
        Ok(Template { title, content })
    }

    fn unpaid_spike_template(&self, role: Role, kind: NoticeKind) -> Option<Template> {
        self.templates
            .find(&unpaid_spike_candidates(role, kind.notified_state().as_str()))
    }
}

/// 管理员变体：第三人称、带链路标识；ISP 变体附带位置后缀
fn admin_variant(role: Role, link: &str, content: &str, location: Option<&str>) -> String {
    let mut text = match role {
        Role::Private => content.replace("Your", link),
        Role::Vendo => content.replace("Vendo", link),
        _ => format!("[{}] {}", link, content),
    };
    if let Some(loc) = location {
        text.push_str(&format!("\nLocation: {}", loc));
    }
    text
}
