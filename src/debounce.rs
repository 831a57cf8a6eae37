//! 去抖调度 - 每条链路一个可取消的确认定时器
//!
//! 观测到状态变化后不立刻通知，而是起一个定时任务等待新状态坐稳。
//! 同一链路任意时刻最多只有一个在飞的定时器：新变化总是先取消旧任务
//! 再起新任务（cancel-and-replace），不存在两个定时器竞争通知同一条
//! 链路的窗口。任务在休眠结束后还会对照存储里的实时观测状态做最终
//! 校验，彻底消除"定时器即将结束"与"新定时器已请求"之间的竞态。
//!
//! 断线通知走两段闸门：先等去抖窗口，若链路处于抖动抑制期则扣到
//! 抑制期结束，之后还要再坐满一个完整的去抖窗口才真正外发。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::flap::FlapDetector;
use crate::notify::{Dispatcher, NoticeKind, NotificationRouter, QueuedMessage};
use crate::state::{LinkKey, LinkStateStore, ObservedState};

/// 定时任务注册表 - cancel-and-replace 语义
///
/// 任务完成时按代号自行注销；代号不匹配说明已被更新的任务顶替，注销为空操作。
struct TimerRegistry {
    inner: Mutex<HashMap<LinkKey, TimerSlot>>,
    next_gen: AtomicU64,
}

struct TimerSlot {
    gen: u64,
    handle: JoinHandle<()>,
}

impl TimerRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.next_gen.fetch_add(1, Ordering::Relaxed)
    }

    /// 登记新任务并取消同链路的旧任务
    fn replace(&self, key: &LinkKey, gen: u64, handle: JoinHandle<()>) {
        let mut map = self.inner.lock().expect("timer registry poisoned");
        if let Some(old) = map.insert(key.clone(), TimerSlot { gen, handle }) {
            old.handle.abort();
        }
    }

    /// 任务自行注销（仅当代号仍是自己）
    fn finish(&self, key: &LinkKey, gen: u64) {
        let mut map = self.inner.lock().expect("timer registry poisoned");
        if map.get(key).map(|slot| slot.gen) == Some(gen) {
            map.remove(key);
        }
    }

    fn cancel(&self, key: &LinkKey) {
        let mut map = self.inner.lock().expect("timer registry poisoned");
        if let Some(slot) = map.remove(key) {
            slot.handle.abort();
        }
    }

    fn live(&self) -> usize {
        self.inner.lock().expect("timer registry poisoned").len()
    }
}

struct SchedulerInner {
    delay: Duration,
    cooldown: Duration,
    stable_clear_window: Duration,
    escalate_after: Duration,
    store: Arc<LinkStateStore>,
    flap: Arc<FlapDetector>,
    router: Arc<NotificationRouter>,
    dispatcher: Arc<Dispatcher>,
    /// 去抖/恢复定时器：每条链路最多一个
    timers: TimerRegistry,
    /// 升级观察定时器：与去抖定时器互不挤占
    escalations: TimerRegistry,
}

/// 去抖调度器
pub struct StabilityScheduler {
    inner: Arc<SchedulerInner>,
}

impl StabilityScheduler {
    pub fn new(
        config: &MonitorConfig,
        store: Arc<LinkStateStore>,
        flap: Arc<FlapDetector>,
        router: Arc<NotificationRouter>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                delay: config.notify_delay,
                cooldown: config.cooldown,
                stable_clear_window: config.stable_clear_window,
                escalate_after: config.spike_escalate,
                store,
                flap,
                router,
                dispatcher,
                timers: TimerRegistry::new(),
                escalations: TimerRegistry::new(),
            }),
        }
    }

    /// 观测状态发生变化：取消旧定时器并按新状态起新定时器
    pub fn on_observed_change(&self, key: &LinkKey, new_state: ObservedState) {
        SchedulerInner::schedule_change(&self.inner, key, new_state);
    }

    /// 抖动开始：起一个升级观察任务
    pub fn watch_escalation(&self, key: &LinkKey, started: Instant) {
        SchedulerInner::schedule_escalation(&self.inner, key, started);
    }

    /// 链路记录被清除：撤掉全部在飞定时器
    pub fn cancel(&self, key: &LinkKey) {
        self.inner.timers.cancel(key);
        self.inner.escalations.cancel(key);
    }

    /// 当前在飞的去抖/恢复定时器数量（不变量校验用）
    pub fn live_timers(&self) -> usize {
        self.inner.timers.live()
    }
}

impl SchedulerInner {
    fn schedule_change(this: &Arc<Self>, key: &LinkKey, new_state: ObservedState) {
        if new_state == ObservedState::Unknown {
            // UNKNOWN 只取消在飞的确认，不外发
            this.timers.cancel(key);
            return;
        }

        let gen = this.timers.next_generation();
        let task_key = key.clone();

        let handle = if new_state == ObservedState::Up && this.flap.escalated(key) {
            // 升级过的链路回到 UP：走恢复确认而非普通去抖
            tokio::spawn(Arc::clone(this).run_recovery(task_key, gen))
        } else {
            tokio::spawn(Arc::clone(this).run_debounce(task_key, new_state, gen))
        };
        this.timers.replace(key, gen, handle);
    }

    fn schedule_escalation(this: &Arc<Self>, key: &LinkKey, started: Instant) {
        let deadline = started + this.escalate_after;
        let gen = this.escalations.next_generation();
        let handle = tokio::spawn(Arc::clone(this).run_escalation(key.clone(), gen, deadline));
        this.escalations.replace(key, gen, handle);
    }

    async fn run_debounce(self: Arc<Self>, key: LinkKey, new_state: ObservedState, gen: u64) {
        debug!(link = %key, state = %new_state, delay_secs = self.delay.as_secs(), "Debounce started");
        sleep(self.delay).await;

        // 最终校验：实时观测必须仍是当初触发的状态
        if self.store.observed(&key) != Some(new_state) {
            self.timers.finish(&key, gen);
            return;
        }

        if new_state == ObservedState::Down {
            // 两段闸门：抑制期结束后还要再坐满一个完整去抖窗口
            loop {
                let Some(remaining) = self.flap.hold_remaining(&key, Instant::now()) else {
                    break;
                };
                info!(link = %key, hold_secs = remaining.as_secs(), "DOWN notice held by flap suppression");
                sleep(remaining).await;
                sleep(self.delay).await;
                if self.store.observed(&key) != Some(new_state) {
                    self.timers.finish(&key, gen);
                    return;
                }
            }
            if self.flap.escalated(&key) {
                // 这次转换已由 SPIKE 升级通知接管
                debug!(link = %key, "Ordinary DOWN suppressed after spike escalation");
                self.timers.finish(&key, gen);
                return;
            }
        }

        if self.store.last_notified(&key) == Some(new_state) {
            debug!(link = %key, state = %new_state, "Already notified, skipping");
            self.timers.finish(&key, gen);
            return;
        }

        if let Some(remaining) = self.store.cooldown_remaining(&key, self.cooldown, Instant::now())
        {
            debug!(link = %key, wait_secs = remaining.as_secs(), "Cooldown active, deferring");
            sleep(remaining).await;
            if self.store.observed(&key) != Some(new_state) {
                self.timers.finish(&key, gen);
                return;
            }
        }

        info!(link = %key, state = %new_state, "State stable, notifying");
        self.dispatch(&key, NoticeKind::Stable(new_state));
        self.timers.finish(&key, gen);
    }

    async fn run_recovery(self: Arc<Self>, key: LinkKey, gen: u64) {
        debug!(link = %key, window_secs = self.stable_clear_window.as_secs(), "Recovery confirmation started");
        sleep(self.stable_clear_window).await;

        if self.store.observed(&key) == Some(ObservedState::Up)
            && self
                .flap
                .try_recover(&key, Instant::now(), self.stable_clear_window)
        {
            info!(link = %key, "Link stabilized after spike, sending recovery notice");
            self.dispatch(&key, NoticeKind::SpikeUp);
        }
        self.timers.finish(&key, gen);
    }

    async fn run_escalation(self: Arc<Self>, key: LinkKey, gen: u64, deadline: Instant) {
        sleep_until(deadline).await;

        // 本次转换已有普通通知出去：升级与普通通知互斥
        if self.store.last_notified(&key) != Some(ObservedState::Down)
            && self
                .flap
                .try_escalate(&key, Instant::now(), self.escalate_after)
        {
            warn!(link = %key, "Link flapping persisted, escalating to SPIKE notice");
            self.dispatch(&key, NoticeKind::SpikeDown);
            // 升级时链路已经回到 UP：立即进入恢复确认，
            // 否则闩锁会一直压住后续的普通断线通知
            if self.store.observed(&key) == Some(ObservedState::Up) {
                Self::schedule_change(&self, &key, ObservedState::Up);
            }
        }
        self.escalations.finish(&key, gen);
    }

    /// 解析并入队；成功后更新 last_notified
    fn dispatch(&self, key: &LinkKey, kind: NoticeKind) {
        match self.router.resolve(key, kind) {
            Ok(outbounds) => {
                if outbounds.is_empty() {
                    debug!(link = %key, kind = kind.state_label(), "No recipients resolved");
                }
                for outbound in outbounds {
                    self.dispatcher.enqueue(QueuedMessage {
                        group: key.group.clone(),
                        link: key.name.clone(),
                        state: kind.state_label().to_string(),
                        template: outbound.template,
                        recipient_id: outbound.recipient.messenger_id.clone(),
                        recipient: outbound.recipient.name.clone(),
                        text: outbound.text,
                    });
                }
                self.store
                    .record_notified(key, kind.notified_state(), Instant::now());
            }
            Err(e) => {
                warn!(link = %key, error = %e, "Failed to resolve notification");
            }
        }
    }
}
