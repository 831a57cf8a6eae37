//! 链路状态存储 - 每个 (分组, 链路) 的权威已知状态
//!
//! 所有读-改-写序列都封装在方法内部，锁只覆盖单次内存操作，
//! 绝不跨 I/O 持有。只有 Poller 会写入该存储。

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::key::LinkKey;

/// 单次轮询得到的原始状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedState {
    Up,
    Down,
    Unknown,
}

impl ObservedState {
    /// 解析路由器返回的状态字符串（大小写不敏感）
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UP" => ObservedState::Up,
            "DOWN" => ObservedState::Down,
            _ => ObservedState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedState::Up => "UP",
            ObservedState::Down => "DOWN",
            ObservedState::Unknown => "UNKNOWN",
        }
    }

    /// UP/DOWN 之间的变化才算一次翻转
    pub fn is_flip_from(&self, prev: ObservedState) -> bool {
        matches!(
            (prev, *self),
            (ObservedState::Up, ObservedState::Down) | (ObservedState::Down, ObservedState::Up)
        )
    }
}

impl std::fmt::Display for ObservedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 派生状态：抖动跨过阈值时 SPIKING 覆盖 UP/DOWN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveState {
    Up,
    Down,
    Unknown,
    Spiking,
}

impl From<ObservedState> for EffectiveState {
    fn from(s: ObservedState) -> Self {
        match s {
            ObservedState::Up => EffectiveState::Up,
            ObservedState::Down => EffectiveState::Down,
            ObservedState::Unknown => EffectiveState::Unknown,
        }
    }
}

impl EffectiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveState::Up => "UP",
            EffectiveState::Down => "DOWN",
            EffectiveState::Unknown => "UNKNOWN",
            EffectiveState::Spiking => "SPIKING",
        }
    }
}

/// 单条链路的记录
#[derive(Debug, Clone)]
pub struct LinkRecord {
    /// 最近一次轮询观测到的状态
    pub last_observed: ObservedState,
    /// 派生状态
    pub last_effective: EffectiveState,
    /// 最近一次实际通知出去的状态
    pub last_notified: Option<ObservedState>,
    /// 最近一次通知时间
    pub notified_at: Option<Instant>,
    /// 连续缺席的轮询次数
    missed_polls: u32,
}

impl LinkRecord {
    fn new(observed: ObservedState) -> Self {
        Self {
            last_observed: observed,
            last_effective: observed.into(),
            last_notified: None,
            notified_at: None,
            missed_polls: 0,
        }
    }
}

/// 应用一次观测的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// 首次见到该链路，记录已建立（作为基线，不产生转换事件）
    Created,
    /// 与上次观测一致
    Unchanged,
    /// 状态发生变化
    Changed { prev: ObservedState },
}

/// 权威状态存储
pub struct LinkStateStore {
    inner: Mutex<HashMap<LinkKey, LinkRecord>>,
}

impl LinkStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// 应用一次观测，返回变化情况
    pub fn apply_observation(&self, key: &LinkKey, observed: ObservedState) -> Applied {
        let mut map = self.inner.lock().expect("link store poisoned");
        match map.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(LinkRecord::new(observed));
                Applied::Created
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                record.missed_polls = 0;
                if record.last_observed == observed {
                    Applied::Unchanged
                } else {
                    let prev = record.last_observed;
                    record.last_observed = observed;
                    Applied::Changed { prev }
                }
            }
        }
    }

    /// 当前观测状态
    pub fn observed(&self, key: &LinkKey) -> Option<ObservedState> {
        let map = self.inner.lock().expect("link store poisoned");
        map.get(key).map(|r| r.last_observed)
    }

    /// 写入派生状态
    pub fn set_effective(&self, key: &LinkKey, effective: EffectiveState) {
        let mut map = self.inner.lock().expect("link store poisoned");
        if let Some(record) = map.get_mut(key) {
            record.last_effective = effective;
        }
    }

    /// 最近一次已通知状态
    pub fn last_notified(&self, key: &LinkKey) -> Option<ObservedState> {
        let map = self.inner.lock().expect("link store poisoned");
        map.get(key).and_then(|r| r.last_notified)
    }

    /// 记录一次通知；记录缺失时就地重建（状态自愈而非报错）
    pub fn record_notified(&self, key: &LinkKey, state: ObservedState, now: Instant) {
        let mut map = self.inner.lock().expect("link store poisoned");
        let record = map
            .entry(key.clone())
            .or_insert_with(|| LinkRecord::new(state));
        record.last_notified = Some(state);
        record.notified_at = Some(now);
    }

    /// 距离冷却期结束还差多久；None 表示冷却已过或从未通知
    pub fn cooldown_remaining(
        &self,
        key: &LinkKey,
        cooldown: Duration,
        now: Instant,
    ) -> Option<Duration> {
        let map = self.inner.lock().expect("link store poisoned");
        let notified_at = map.get(key).and_then(|r| r.notified_at)?;
        let deadline = notified_at + cooldown;
        deadline.checked_duration_since(now).filter(|d| !d.is_zero())
    }

    /// 某分组当前已知的所有键
    pub fn keys_for_group(&self, group: &str) -> Vec<LinkKey> {
        let map = self.inner.lock().expect("link store poisoned");
        map.keys().filter(|k| k.group == group).cloned().collect()
    }

    /// 标记本轮未出现的键：驱动到 UNKNOWN，连续缺席达到阈值后删除记录
    ///
    /// 返回 (被驱动到 UNKNOWN 的转换, 被删除的键)。
    pub fn sweep_missing(
        &self,
        group: &str,
        seen: &HashSet<String>,
        stale_polls: u32,
    ) -> (Vec<(LinkKey, ObservedState)>, Vec<LinkKey>) {
        let mut map = self.inner.lock().expect("link store poisoned");
        let mut transitions = Vec::new();
        let mut removed = Vec::new();

        for (key, record) in map.iter_mut() {
            if key.group != group || seen.contains(&key.name) {
                continue;
            }
            record.missed_polls += 1;
            if record.last_observed != ObservedState::Unknown {
                let prev = record.last_observed;
                record.last_observed = ObservedState::Unknown;
                transitions.push((key.clone(), prev));
            }
            if record.missed_polls >= stale_polls {
                removed.push(key.clone());
            }
        }
        for key in &removed {
            map.remove(key);
        }
        (transitions, removed)
    }

    /// 当前全部记录的快照（CLI 展示用）
    pub fn snapshot(&self) -> Vec<(LinkKey, LinkRecord)> {
        let map = self.inner.lock().expect("link store poisoned");
        let mut rows: Vec<_> = map.iter().map(|(k, r)| (k.clone(), r.clone())).collect();
        rows.sort_by(|(a, _), (b, _)| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
        rows
    }
}

impl Default for LinkStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> LinkKey {
        LinkKey::new("G1", name)
    }

    #[test]
    fn test_first_observation_is_baseline_not_transition() {
        let store = LinkStateStore::new();
        let k = key("PRIVATE-ALICIA");
        assert_eq!(store.apply_observation(&k, ObservedState::Up), Applied::Created);
        assert_eq!(store.observed(&k), Some(ObservedState::Up));
    }

    #[test]
    fn test_change_detection() {
        let store = LinkStateStore::new();
        let k = key("PRIVATE-ALICIA");
        store.apply_observation(&k, ObservedState::Up);
        assert_eq!(
            store.apply_observation(&k, ObservedState::Up),
            Applied::Unchanged
        );
        assert_eq!(
            store.apply_observation(&k, ObservedState::Down),
            Applied::Changed {
                prev: ObservedState::Up
            }
        );
    }

    #[test]
    fn test_sweep_drives_missing_to_unknown_once() {
        let store = LinkStateStore::new();
        let k = key("VENDO-PLAZA");
        store.apply_observation(&k, ObservedState::Up);

        let seen = HashSet::new();
        let (transitions, removed) = store.sweep_missing("G1", &seen, 10);
        assert_eq!(transitions, vec![(k.clone(), ObservedState::Up)]);
        assert!(removed.is_empty());

        // 第二轮缺席不再产生转换
        let (transitions, removed) = store.sweep_missing("G1", &seen, 10);
        assert!(transitions.is_empty());
        assert!(removed.is_empty());
        assert_eq!(store.observed(&k), Some(ObservedState::Unknown));
    }

    #[test]
    fn test_sweep_removes_stale_keys() {
        let store = LinkStateStore::new();
        let k = key("VENDO-PLAZA");
        store.apply_observation(&k, ObservedState::Up);

        let seen = HashSet::new();
        for _ in 0..2 {
            store.sweep_missing("G1", &seen, 3);
        }
        let (_, removed) = store.sweep_missing("G1", &seen, 3);
        assert_eq!(removed, vec![k.clone()]);
        assert_eq!(store.observed(&k), None);
    }

    #[test]
    fn test_sweep_only_touches_requested_group() {
        let store = LinkStateStore::new();
        let other = LinkKey::new("G2", "PRIVATE-BOB");
        store.apply_observation(&other, ObservedState::Up);

        let (transitions, removed) = store.sweep_missing("G1", &HashSet::new(), 10);
        assert!(transitions.is_empty());
        assert!(removed.is_empty());
        assert_eq!(store.observed(&other), Some(ObservedState::Up));
    }

    #[test]
    fn test_observation_resets_missed_counter() {
        let store = LinkStateStore::new();
        let k = key("PRIVATE-ALICIA");
        store.apply_observation(&k, ObservedState::Up);

        let seen = HashSet::new();
        store.sweep_missing("G1", &seen, 3);
        store.sweep_missing("G1", &seen, 3);
        // 重新出现：计数归零，Unknown → Up 是一次普通转换
        assert_eq!(
            store.apply_observation(&k, ObservedState::Up),
            Applied::Changed {
                prev: ObservedState::Unknown
            }
        );
        store.sweep_missing("G1", &seen, 3);
        let (_, removed) = store.sweep_missing("G1", &seen, 3);
        assert!(removed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_window() {
        let store = LinkStateStore::new();
        let k = key("PRIVATE-ALICIA");
        store.apply_observation(&k, ObservedState::Down);

        let now = Instant::now();
        assert_eq!(store.cooldown_remaining(&k, Duration::from_secs(120), now), None);

        store.record_notified(&k, ObservedState::Down, now);
        let rem = store
            .cooldown_remaining(&k, Duration::from_secs(120), now + Duration::from_secs(30))
            .expect("cooldown active");
        assert_eq!(rem, Duration::from_secs(90));
        assert_eq!(
            store.cooldown_remaining(&k, Duration::from_secs(120), now + Duration::from_secs(120)),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_notified_heals_missing_record() {
        let store = LinkStateStore::new();
        let k = key("PRIVATE-GHOST");
        // 没有先行观测也不会 panic，记录被重建
        store.record_notified(&k, ObservedState::Down, Instant::now());
        assert_eq!(store.last_notified(&k), Some(ObservedState::Down));
        assert_eq!(store.observed(&k), Some(ObservedState::Down));
    }
}
