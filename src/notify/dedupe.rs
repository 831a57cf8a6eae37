//! 管理员通知去重 - 防止短窗口内重复的镜像通知
//!
//! 同一条物理链路可能挂着多个订户；管理员镜像按
//! `(分组, 角色, 链路, 状态)` 去重，TTL 内只放行一次。
//! 过期条目在每次判定前惰性清理。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::state::Role;

/// 去重键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub group: String,
    pub role: Role,
    pub link: String,
    pub state: String,
}

/// 管理员镜像去重缓存
pub struct AdminDedupeCache {
    recent: Mutex<HashMap<DedupeKey, Instant>>,
    ttl: Duration,
}

impl AdminDedupeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            recent: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// TTL 内首次出现返回 true 并记账；重复出现返回 false
    pub fn should_send(&self, key: &DedupeKey, now: Instant) -> bool {
        let mut map = self.recent.lock().expect("dedupe cache poisoned");
        map.retain(|_, sent_at| now.duration_since(*sent_at) < self.ttl);

        if map.contains_key(key) {
            debug!(group = %key.group, link = %key.link, state = %key.state, "Admin notice deduplicated");
            return false;
        }
        map.insert(key.clone(), now);
        true
    }
}
