//! 外发通道 - Sender 能力与 Messenger 实现
//!
//! Dispatcher 只依赖 `Sender` trait；失败由调用方记录，不在这里重试。

use anyhow::{Context, Result};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// 单次投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    /// 已投递；平台返回的消息 ID
    Sent { id: Option<String> },
    /// 主动跳过（停用开关、dry-run 等）
    Skipped(String),
    /// 投递失败
    Failed(String),
}

impl SendResult {
    pub fn delivered(&self) -> bool {
        matches!(self, SendResult::Sent { .. })
    }

    /// 审计行的结果标签
    pub fn outcome(&self) -> &'static str {
        match self {
            SendResult::Sent { .. } => "sent",
            SendResult::Skipped(_) => "skipped",
            SendResult::Failed(_) => "failed",
        }
    }
}

/// 外发能力
pub trait Sender: Send + Sync {
    /// 渠道名（日志与审计用）
    fn name(&self) -> &str;

    /// 向单个接收者发送一段文本
    fn send(&self, recipient_id: &str, text: &str) -> Result<SendResult>;
}

/// Messenger 发送配置
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Graph API 访问令牌
    pub access_token: String,
    /// 请求超时
    pub timeout: Duration,
    /// 全局外发开关；关闭时跳过但仍记录
    pub enabled: bool,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            timeout: Duration::from_secs(10),
            enabled: true,
        }
    }
}

/// Messenger（Graph API）发送器
pub struct MessengerSender {
    client: reqwest::blocking::Client,
    config: MessengerConfig,
}

impl MessengerSender {
    pub fn new(config: MessengerConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }
}

impl Sender for MessengerSender {
    fn name(&self) -> &str {
        "messenger"
    }

    fn send(&self, recipient_id: &str, text: &str) -> Result<SendResult> {
        if !self.config.enabled {
            debug!(recipient = %recipient_id, "Messenger send disabled, skipping");
            return Ok(SendResult::Skipped("messenger send disabled".to_string()));
        }
        if self.config.access_token.is_empty() {
            return Ok(SendResult::Failed("missing access token".to_string()));
        }

        let url = format!(
            "https://graph.facebook.com/v19.0/me/messages?access_token={}",
            self.config.access_token
        );
        let payload = json!({
            "recipient": { "id": recipient_id },
            "message": { "text": text },
            "tag": "CONFIRMED_EVENT_UPDATE",
        });

        let response = match self.client.post(&url).json(&payload).send() {
            Ok(r) => r,
            Err(e) => {
                warn!(recipient = %recipient_id, error = %e, "Messenger request failed");
                return Ok(SendResult::Failed(e.to_string()));
            }
        };

        let body: serde_json::Value = response
            .json()
            .unwrap_or_else(|_| json!({ "error": "invalid response body" }));
        match body.get("message_id").and_then(|v| v.as_str()) {
            Some(id) => Ok(SendResult::Sent {
                id: Some(id.to_string()),
            }),
            None => {
                let detail = body
                    .get("error")
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no message_id in response".to_string());
                Ok(SendResult::Failed(detail))
            }
        }
    }
}

/// 控制台发送器 - dry-run 与本地开发用
pub struct ConsoleSender;

impl Sender for ConsoleSender {
    fn name(&self) -> &str {
        "console"
    }

    fn send(&self, recipient_id: &str, text: &str) -> Result<SendResult> {
        println!("[notify] -> {}\n{}\n", recipient_id, text);
        Ok(SendResult::Sent { id: None })
    }
}
