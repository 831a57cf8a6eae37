//! 抖动检测 - 滑动窗口翻转计数、自适应抑制与 SPIKE 升级
//!
//! 每条链路维护一份翻转历史；窗口内翻转次数达到阈值即判定为抖动（spiking）。
//! 抖动开始时按档位表计算一段抑制期（翻转越多越久），抑制期内断线通知被扣住。
//! 持续抖动超过升级阈值后只发送一次 SPIKE 升级通知；链路连续 UP 满
//! 稳定窗口后发送恢复通知并整体清零。
//!
//! 所有判定方法都显式接收 `now`，时间窗口逻辑不依赖隐式时钟。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::HoldLevels;
use crate::state::{LinkKey, ObservedState};

/// 一次翻转记录后的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipOutcome {
    /// 未达到抖动阈值
    Stable,
    /// 本次翻转使链路进入抖动状态
    SpikeStarted {
        /// 抖动起点（窗口内最早的翻转时间）
        started: Instant,
    },
    /// 已处于抖动状态
    Spiking,
}

/// 单条链路的翻转历史
#[derive(Debug)]
struct FlipHistory {
    /// 窗口内的翻转时间，旧条目在每次判定前剪除
    flips: VecDeque<Instant>,
    /// 抖动起点；非空即判定为 spiking
    spike_started_at: Option<Instant>,
    /// 自适应抑制截止时间
    hold_until: Option<Instant>,
    /// 升级通知一次性闩锁
    spike_escalated: bool,
    /// 连续 UP 的起点（恢复判定用）
    up_since: Option<Instant>,
}

impl FlipHistory {
    fn new() -> Self {
        Self {
            flips: VecDeque::new(),
            spike_started_at: None,
            hold_until: None,
            spike_escalated: false,
            up_since: None,
        }
    }

    /// 剪除窗口外的翻转；窗口清空且抑制期已过的未升级抖动随之消退
    fn prune(&mut self, window: Duration, now: Instant) {
        let cutoff = now.checked_sub(window);
        if let Some(cutoff) = cutoff {
            while self.flips.front().is_some_and(|t| *t < cutoff) {
                self.flips.pop_front();
            }
        }
        let hold_over = self.hold_until.map_or(true, |h| now >= h);
        if !self.spike_escalated && self.flips.is_empty() && hold_over {
            self.spike_started_at = None;
            self.hold_until = None;
        }
    }
}

/// 抖动检测器
pub struct FlapDetector {
    inner: Mutex<HashMap<LinkKey, FlipHistory>>,
    window: Duration,
    threshold: usize,
    hold_levels: HoldLevels,
}

impl FlapDetector {
    pub fn new(window: Duration, threshold: usize, hold_levels: HoldLevels) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            window,
            threshold,
            hold_levels,
        }
    }

    /// 记录一次 UP/DOWN 翻转并返回分类
    pub fn record_flip(&self, key: &LinkKey, now: Instant) -> FlipOutcome {
        let mut map = self.inner.lock().expect("flap detector poisoned");
        let entry = map.entry(key.clone()).or_insert_with(FlipHistory::new);

        entry.flips.push_back(now);
        entry.prune(self.window, now);

        let count = entry.flips.len();
        if count < self.threshold {
            return FlipOutcome::Stable;
        }

        let newly_spiking = entry.spike_started_at.is_none();
        let started = *entry
            .flips
            .front()
            .expect("count >= threshold implies non-empty window");
        if newly_spiking {
            entry.spike_started_at = Some(started);
        }

        // 抑制期按命中的最大档位延展，风暴越猛扣得越久
        if let Some(hold) = self.hold_duration(count) {
            let candidate = now + hold;
            entry.hold_until = Some(entry.hold_until.map_or(candidate, |h| h.max(candidate)));
            debug!(link = %key, flips = count, hold_secs = hold.as_secs(), "Flap hold extended");
        }

        if newly_spiking {
            FlipOutcome::SpikeStarted { started }
        } else {
            FlipOutcome::Spiking
        }
    }

    /// 每轮观测都要调用：维护连续 UP 起点并触发窗口剪除
    pub fn observe(&self, key: &LinkKey, state: ObservedState, now: Instant) {
        let mut map = self.inner.lock().expect("flap detector poisoned");
        let entry = map.entry(key.clone()).or_insert_with(FlipHistory::new);
        entry.prune(self.window, now);
        match state {
            ObservedState::Up => {
                entry.up_since.get_or_insert(now);
            }
            _ => entry.up_since = None,
        }
    }

    /// 当前是否判定为抖动
    pub fn is_spiking(&self, key: &LinkKey, now: Instant) -> bool {
        let mut map = self.inner.lock().expect("flap detector poisoned");
        match map.get_mut(key) {
            Some(entry) => {
                entry.prune(self.window, now);
                entry.spike_started_at.is_some()
            }
            None => false,
        }
    }

    /// 抑制期剩余时长；None 表示当前不在抑制期内
    pub fn hold_remaining(&self, key: &LinkKey, now: Instant) -> Option<Duration> {
        let map = self.inner.lock().expect("flap detector poisoned");
        let hold_until = map.get(key)?.hold_until?;
        hold_until.checked_duration_since(now).filter(|d| !d.is_zero())
    }

    /// 升级闩锁是否已触发
    pub fn escalated(&self, key: &LinkKey) -> bool {
        let map = self.inner.lock().expect("flap detector poisoned");
        map.get(key).is_some_and(|e| e.spike_escalated)
    }

    /// 持续抖动满 `escalate_after` 且未升级过时触发升级闩锁
    ///
    /// 返回 true 表示调用方应发送一次 SPIKE 升级通知。
    pub fn try_escalate(&self, key: &LinkKey, now: Instant, escalate_after: Duration) -> bool {
        let mut map = self.inner.lock().expect("flap detector poisoned");
        let Some(entry) = map.get_mut(key) else {
            return false;
        };
        entry.prune(self.window, now);
        let Some(started) = entry.spike_started_at else {
            return false;
        };
        if entry.spike_escalated || now < started + escalate_after {
            return false;
        }
        entry.spike_escalated = true;
        true
    }

    /// 升级后的链路连续 UP 满 `clear_window` 时整体清零
    ///
    /// 返回 true 表示调用方应发送一次恢复通知；翻转历史已重置。
    pub fn try_recover(&self, key: &LinkKey, now: Instant, clear_window: Duration) -> bool {
        let mut map = self.inner.lock().expect("flap detector poisoned");
        let Some(entry) = map.get(key) else {
            return false;
        };
        if !entry.spike_escalated {
            return false;
        }
        let stable = entry.up_since.is_some_and(|u| now >= u + clear_window);
        if stable {
            map.remove(key);
        }
        stable
    }

    /// 链路记录被清除时同步丢弃翻转历史
    pub fn remove(&self, key: &LinkKey) {
        let mut map = self.inner.lock().expect("flap detector poisoned");
        map.remove(key);
    }

    fn hold_duration(&self, flips: usize) -> Option<Duration> {
        self.hold_levels
            .iter()
            .filter(|(threshold, _)| flips >= *threshold)
            .map(|(_, hold)| *hold)
            .last()
    }
}
