//! 监控引擎装配 - 组装各组件并启动分组轮询与投递 worker
//!
//! 能力对象（接收者目录、模板库、发送器、路由器客户端）都以 trait 注入，
//! 生产装配与测试装配共用同一套接线。

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::debounce::StabilityScheduler;
use crate::flap::FlapDetector;
use crate::notify::{
    AdminDedupeCache, AuditLog, Dispatcher, FileDirectory, FileTemplateStore, InMemoryDirectory,
    NotificationRouter, RecipientDirectory, Sender, TemplateStore,
};
use crate::poller::Poller;
use crate::router::{RestClientConfig, RouterClient, RouterOsRestClient};
use crate::state::LinkStateStore;

/// 数据目录（接收者、模板、审计日志）
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("netwatch-monitor")
}

/// 已启动的后台任务句柄
pub struct MonitorHandles {
    pub pollers: Vec<JoinHandle<()>>,
    pub worker: JoinHandle<()>,
}

impl MonitorHandles {
    /// 停止全部后台任务
    pub fn abort(&self) {
        for poller in &self.pollers {
            poller.abort();
        }
        self.worker.abort();
    }
}

/// 监控引擎
pub struct Monitor {
    config: MonitorConfig,
    store: Arc<LinkStateStore>,
    flap: Arc<FlapDetector>,
    scheduler: Arc<StabilityScheduler>,
    dispatcher: Arc<Dispatcher>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        directory: Arc<dyn RecipientDirectory>,
        templates: Arc<dyn TemplateStore>,
        sender: Arc<dyn Sender>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let store = Arc::new(LinkStateStore::new());
        let flap = Arc::new(FlapDetector::new(
            config.flap_window,
            config.flap_threshold,
            config.hold_levels.clone(),
        ));
        let dedupe = Arc::new(AdminDedupeCache::new(config.admin_dedupe_ttl));
        let router = Arc::new(NotificationRouter::new(
            templates,
            directory,
            dedupe,
            Arc::clone(&store),
            config.locations.clone(),
            config.notify_blocked,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.rate_limit_per_group,
            config.worker_tick,
            sender,
            audit,
        ));
        let scheduler = Arc::new(StabilityScheduler::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&flap),
            router,
            Arc::clone(&dispatcher),
        ));
        Self {
            config,
            store,
            flap,
            scheduler,
            dispatcher,
        }
    }

    pub fn store(&self) -> Arc<LinkStateStore> {
        Arc::clone(&self.store)
    }

    pub fn flap(&self) -> Arc<FlapDetector> {
        Arc::clone(&self.flap)
    }

    pub fn scheduler(&self) -> Arc<StabilityScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// 为某分组构造一个轮询器（测试也走这里，保证接线一致）
    pub fn poller_for(&self, group: &str) -> Poller {
        Poller::new(
            group,
            self.config.poll_interval,
            self.config.stale_polls,
            Arc::clone(&self.store),
            Arc::clone(&self.flap),
            Arc::clone(&self.scheduler),
        )
    }

    /// 启动投递 worker 与全部分组轮询循环
    pub fn start(&self, clients: HashMap<String, Arc<dyn RouterClient>>) -> MonitorHandles {
        let worker = Arc::clone(&self.dispatcher).spawn_worker();
        let mut pollers = Vec::new();

        if clients.is_empty() {
            // 配置错误在启动时暴露：没有可轮询的分组，但进程不退出
            error!("No router groups configured, nothing to poll");
        }
        for (group, client) in clients {
            let poller = self.poller_for(&group);
            pollers.push(tokio::spawn(poller.run(client)));
        }
        MonitorHandles { pollers, worker }
    }
}

/// 按配置为每个分组构造 REST 客户端；单个分组失败不影响其余分组
pub fn build_router_clients(config: &MonitorConfig) -> HashMap<String, Arc<dyn RouterClient>> {
    let mut clients: HashMap<String, Arc<dyn RouterClient>> = HashMap::new();
    for (group, host) in &config.router_map {
        let rest = RestClientConfig::new(host.clone(), config.username.clone(), config.password.clone());
        match RouterOsRestClient::new(rest) {
            Ok(client) => {
                clients.insert(group.clone(), Arc::new(client));
            }
            Err(e) => {
                error!(group = %group, host = %host, error = %e, "Failed to build router client, group will not poll");
            }
        }
    }
    clients
}

/// 加载接收者目录；文件缺失时退化为空目录并告警
pub fn load_directory(path: &Path) -> Arc<dyn RecipientDirectory> {
    match FileDirectory::load(path) {
        Ok(dir) => {
            info!(path = %path.display(), "Recipient directory loaded");
            Arc::new(dir)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Recipient directory unavailable, starting empty");
            Arc::new(InMemoryDirectory::empty())
        }
    }
}

/// 加载模板库
pub fn load_templates(path: PathBuf) -> Result<Arc<FileTemplateStore>> {
    let store = FileTemplateStore::load(path).context("Failed to load template store")?;
    Ok(Arc::new(store))
}
