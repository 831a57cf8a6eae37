//! 监控配置模块 - 路由器分组映射与各项时间窗口参数
//!
//! 所有阈值都是可调配置而非硬性常量；默认值是长期运行中收敛下来的一组参数。
//! 路由器分组映射通过 `ROUTER_MAP_JSON` 环境变量注入（JSON 对象：分组 → 主机），
//! 解析失败时回退到默认映射并记录警告。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// 环境变量：路由器分组映射（JSON 对象，例如 `{"G1":"192.168.4.1"}`）
pub const ROUTER_MAP_ENV: &str = "ROUTER_MAP_JSON";
/// 环境变量：RouterOS 登录用户名
pub const ROUTER_USERNAME_ENV: &str = "ROUTER_USERNAME";
/// 环境变量：RouterOS 登录密码
pub const ROUTER_PASSWORD_ENV: &str = "ROUTER_PASSWORD";
/// 环境变量：Messenger 发送令牌
pub const PAGE_ACCESS_TOKEN_ENV: &str = "PAGE_ACCESS_TOKEN";

/// 自适应抑制档位表：窗口内翻转次数阈值 → 抑制时长
///
/// 升序排列；命中的最大档位生效，翻转越多抑制越久。
pub type HoldLevels = Vec<(usize, Duration)>;

/// 监控引擎配置
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// 每个分组的轮询间隔
    pub poll_interval: Duration,
    /// 去抖延迟：新状态必须保持这么久才会触发通知
    pub notify_delay: Duration,
    /// 单链路两次通知之间的最短间隔
    pub cooldown: Duration,
    /// 翻转统计滑动窗口
    pub flap_window: Duration,
    /// 窗口内翻转次数达到该值即判定为抖动
    pub flap_threshold: usize,
    /// 连续抖动达到该时长后升级为 SPIKE 通知
    pub spike_escalate: Duration,
    /// 自适应抑制档位表
    pub hold_levels: HoldLevels,
    /// 升级后链路需连续 UP 这么久才发送恢复通知并清零抖动历史
    pub stable_clear_window: Duration,
    /// 每个分组每秒最多外发的消息数
    pub rate_limit_per_group: u32,
    /// 外发队列 worker 的轮询间隔
    pub worker_tick: Duration,
    /// 管理员镜像通知的去重窗口
    pub admin_dedupe_ttl: Duration,
    /// 连续缺席这么多轮后清除链路记录
    pub stale_polls: u32,
    /// 是否向 Cutoff/Limited 计费状态的专线订户发送断线/抖动通知
    pub notify_blocked: bool,
    /// 分组 → 路由器主机
    pub router_map: HashMap<String, String>,
    /// 分组 → 场地位置（管理员 ISP 通知的位置后缀）
    pub locations: HashMap<String, String>,
    /// RouterOS 登录用户名
    pub username: String,
    /// RouterOS 登录密码
    pub password: String,
    /// Messenger 发送令牌（缺失时回退到控制台输出）
    pub page_access_token: Option<String>,
    /// dry-run 模式：不实际外发，只记录
    pub dry_run: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            notify_delay: Duration::from_secs(90),
            cooldown: Duration::from_secs(120),
            flap_window: Duration::from_secs(180),
            flap_threshold: 3,
            spike_escalate: Duration::from_secs(10 * 60),
            hold_levels: vec![
                (3, Duration::from_secs(3 * 60)),
                (5, Duration::from_secs(5 * 60)),
                (8, Duration::from_secs(8 * 60)),
            ],
            stable_clear_window: Duration::from_secs(3 * 60),
            rate_limit_per_group: 5,
            worker_tick: Duration::from_millis(100),
            admin_dedupe_ttl: Duration::from_secs(60),
            stale_polls: 10,
            notify_blocked: false,
            router_map: default_router_map(),
            locations: HashMap::new(),
            username: String::new(),
            password: String::new(),
            page_access_token: None,
            dry_run: false,
        }
    }
}

impl MonitorConfig {
    /// 从环境变量加载配置（缺失项使用默认值）
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.router_map = load_router_map();
        cfg.username = std::env::var(ROUTER_USERNAME_ENV).unwrap_or_default();
        cfg.password = std::env::var(ROUTER_PASSWORD_ENV).unwrap_or_default();
        cfg.page_access_token = std::env::var(PAGE_ACCESS_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        cfg
    }

    /// 分组对应的位置描述（未配置时为空）
    pub fn location_of(&self, group: &str) -> Option<&str> {
        self.locations.get(group).map(|s| s.as_str())
    }

    /// 命中的最大抑制档位
    ///
    /// `flips` 是当前窗口内的翻转次数；返回 None 表示还未达到任何档位。
    pub fn hold_duration(&self, flips: usize) -> Option<Duration> {
        self.hold_levels
            .iter()
            .filter(|(threshold, _)| flips >= *threshold)
            .map(|(_, hold)| *hold)
            .last()
    }
}

/// 默认路由器映射
pub fn default_router_map() -> HashMap<String, String> {
    HashMap::from([
        ("G1".to_string(), "192.168.4.1".to_string()),
        ("G2".to_string(), "10.147.18.20".to_string()),
    ])
}

/// 解析 `ROUTER_MAP_JSON`，失败或为空时回退到默认映射
pub fn load_router_map() -> HashMap<String, String> {
    let raw = match std::env::var(ROUTER_MAP_ENV) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return default_router_map(),
    };

    match serde_json::from_str::<HashMap<String, String>>(&raw) {
        Ok(map) if !map.is_empty() => {
            info!(groups = map.len(), "Loaded router map from environment");
            map
        }
        Ok(_) => {
            warn!("Empty {} value, using default router map", ROUTER_MAP_ENV);
            default_router_map()
        }
        Err(e) => {
            warn!(error = %e, "Invalid {} format, using default router map", ROUTER_MAP_ENV);
            default_router_map()
        }
    }
}

/// 本地设置文件（与审计日志同目录）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// 是否启用 Messenger 外发
    #[serde(rename = "ENABLE_MESSENGER_SEND", default = "default_true")]
    pub enable_messenger_send: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_messenger_send: true,
        }
    }
}

impl Settings {
    /// 读取设置文件；缺失或损坏时使用默认值
    pub fn load(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_shape() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.flap_threshold, 3);
        assert_eq!(cfg.rate_limit_per_group, 5);
        assert_eq!(cfg.hold_levels.len(), 3);
        assert!(cfg.router_map.contains_key("G1"));
    }

    #[test]
    fn test_hold_duration_picks_largest_satisfied_tier() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.hold_duration(2), None);
        assert_eq!(cfg.hold_duration(3), Some(Duration::from_secs(180)));
        assert_eq!(cfg.hold_duration(4), Some(Duration::from_secs(180)));
        assert_eq!(cfg.hold_duration(5), Some(Duration::from_secs(300)));
        assert_eq!(cfg.hold_duration(7), Some(Duration::from_secs(300)));
        assert_eq!(cfg.hold_duration(8), Some(Duration::from_secs(480)));
        assert_eq!(cfg.hold_duration(20), Some(Duration::from_secs(480)));
    }

    #[test]
    fn test_router_map_parse_roundtrip() {
        let raw = r#"{"G7":"10.0.0.1","G8":"10.0.0.2"}"#;
        let map: HashMap<String, String> = serde_json::from_str(raw).unwrap();
        assert_eq!(map.get("G7").map(|s| s.as_str()), Some("10.0.0.1"));
        assert_eq!(map.len(), 2);
    }
}
