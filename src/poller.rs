//! 轮询器 - 每个路由器分组一个长生命周期循环
//!
//! 每拍：探测可达性、拉取 netwatch 列表、规范化、与存储 diff，
//! 把变化喂给抖动检测与去抖调度。本轮未出现的链路驱动到 UNKNOWN，
//! 连续缺席过久的记录被清除。
//!
//! 路由器整机不可达是独立路径：所有已知链路批量驱动到 DOWN（走同
//! 一条单链路管线，不走特殊广播），每条链路恰好产生一次转换事件；
//! 恢复时对称地批量驱动 UP，同样只发一次。单拍内的链路更新彼此串行，
//! 不同分组的轮询循环互不影响。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::debounce::StabilityScheduler;
use crate::flap::{FlapDetector, FlipOutcome};
use crate::router::{RawLink, RouterClient};
use crate::state::{Applied, EffectiveState, LinkKey, LinkStateStore, ObservedState};

/// 单分组轮询器
pub struct Poller {
    group: String,
    interval: Duration,
    stale_polls: u32,
    store: Arc<LinkStateStore>,
    flap: Arc<FlapDetector>,
    scheduler: Arc<StabilityScheduler>,
    /// 路由器整机状态；None 表示尚未探测过
    router_down: Option<bool>,
}

impl Poller {
    pub fn new(
        group: impl Into<String>,
        interval: Duration,
        stale_polls: u32,
        store: Arc<LinkStateStore>,
        flap: Arc<FlapDetector>,
        scheduler: Arc<StabilityScheduler>,
    ) -> Self {
        Self {
            group: group.into(),
            interval,
            stale_polls,
            store,
            flap,
            scheduler,
            router_down: None,
        }
    }

    /// 轮询主循环；永不返回，直到任务被取消
    pub async fn run(mut self, client: Arc<dyn RouterClient>) {
        info!(group = %self.group, interval_secs = self.interval.as_secs(), "Poller started");
        loop {
            self.tick(&client).await;
            sleep(self.interval).await;
        }
    }

    /// 执行一拍轮询
    pub async fn tick(&mut self, client: &Arc<dyn RouterClient>) {
        let probe = Arc::clone(client);
        let reachable = match tokio::task::spawn_blocking(move || probe.is_reachable()).await {
            Ok(v) => v,
            Err(e) => {
                error!(group = %self.group, error = %e, "Reachability probe task failed");
                false
            }
        };

        if !reachable {
            self.handle_unreachable();
            return;
        }
        self.handle_reachable();

        let fetch = Arc::clone(client);
        match tokio::task::spawn_blocking(move || fetch.list_links()).await {
            Ok(Ok(links)) => self.apply_scan(links),
            Ok(Err(e)) => {
                // 瞬态故障：记日志，下一拍重试
                warn!(group = %self.group, error = %e, "Netwatch fetch failed");
            }
            Err(e) => {
                error!(group = %self.group, error = %e, "Netwatch fetch task failed");
            }
        }
    }

    /// 路由器不可达：所有已知链路批量 DOWN（每次中断只做一次）
    pub fn handle_unreachable(&mut self) {
        if self.router_down == Some(true) {
            debug!(group = %self.group, "Router still down, bulk transition already emitted");
            return;
        }
        warn!(group = %self.group, "Router unreachable, marking all dependent links DOWN");
        self.router_down = Some(true);
        for key in self.store.keys_for_group(&self.group) {
            self.observe(&key.name, ObservedState::Down);
        }
    }

    /// 路由器恢复可达：对称的批量 UP（每次恢复只做一次）
    pub fn handle_reachable(&mut self) {
        if self.router_down == Some(true) {
            info!(group = %self.group, "Router recovered, marking dependent links UP");
            for key in self.store.keys_for_group(&self.group) {
                self.observe(&key.name, ObservedState::Up);
            }
        }
        self.router_down = Some(false);
    }

    /// 应用一轮完整的 netwatch 结果
    pub fn apply_scan(&mut self, links: Vec<RawLink>) {
        let mut seen = HashSet::new();
        for link in links {
            let key = LinkKey::new(&self.group, &link.name);
            if key.name.is_empty() {
                continue;
            }
            let observed = ObservedState::parse(&link.status);
            seen.insert(key.name.clone());
            self.observe(&key.name, observed);
        }
        self.sweep_missing(&seen);
    }

    /// 单链路观测管线：存储 diff → 翻转记录 → 派生状态 → 去抖调度
    fn observe(&self, name: &str, observed: ObservedState) {
        let key = LinkKey::new(&self.group, name);
        let now = Instant::now();

        match self.store.apply_observation(&key, observed) {
            Applied::Created => {
                debug!(link = %key, state = %observed, "Link first seen, baseline recorded");
                self.flap.observe(&key, observed, now);
            }
            Applied::Unchanged => {
                self.flap.observe(&key, observed, now);
                self.refresh_effective(&key, observed, now);
            }
            Applied::Changed { prev } => {
                info!(link = %key, from = %prev, to = %observed, "Link state changed");
                if observed.is_flip_from(prev) {
                    if let FlipOutcome::SpikeStarted { started } = self.flap.record_flip(&key, now)
                    {
                        info!(link = %key, "Flap threshold crossed, link is spiking");
                        self.scheduler.watch_escalation(&key, started);
                    }
                }
                self.flap.observe(&key, observed, now);
                self.refresh_effective(&key, observed, now);
                self.scheduler.on_observed_change(&key, observed);
            }
        }
    }

    /// 本轮未出现的链路：驱动到 UNKNOWN；连续缺席达到阈值后清除
    fn sweep_missing(&self, seen: &HashSet<String>) {
        let (transitions, removed) = self.store.sweep_missing(&self.group, seen, self.stale_polls);
        for (key, prev) in transitions {
            info!(link = %key, from = %prev, "Link absent from scan, driving to UNKNOWN");
            let now = Instant::now();
            self.flap.observe(&key, ObservedState::Unknown, now);
            self.refresh_effective(&key, ObservedState::Unknown, now);
            self.scheduler.on_observed_change(&key, ObservedState::Unknown);
        }
        for key in removed {
            info!(link = %key, "Link stale, dropping record");
            self.flap.remove(&key);
            self.scheduler.cancel(&key);
        }
    }

    fn refresh_effective(&self, key: &LinkKey, observed: ObservedState, now: Instant) {
        let effective = if self.flap.is_spiking(key, now) {
            EffectiveState::Spiking
        } else {
            observed.into()
        };
        self.store.set_effective(key, effective);
    }
}
