//! RouterOS REST 客户端 - RouterClient 的生产实现
//!
//! 走 RouterOS v7 的 REST 接口；可达性探测用身份端点加短超时，
//! 超时视为本轮不可达而非致命错误。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::{RawLink, RouterClient};

/// REST 客户端配置
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// 路由器主机（IP 或域名）
    pub host: String,
    /// 登录用户名
    pub username: String,
    /// 登录密码
    pub password: String,
    /// 可达性探测超时
    pub probe_timeout: Duration,
    /// 数据请求超时
    pub request_timeout: Duration,
}

impl RestClientConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            probe_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// RouterOS netwatch 行
#[derive(Debug, Deserialize)]
struct NetwatchRow {
    #[serde(default)]
    host: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    status: String,
}

/// RouterOS REST 实现
pub struct RouterOsRestClient {
    probe: reqwest::blocking::Client,
    client: reqwest::blocking::Client,
    config: RestClientConfig,
}

impl RouterOsRestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let probe = reqwest::blocking::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .context("Failed to build probe client")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build REST client")?;
        Ok(Self {
            probe,
            client,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/rest{}", self.config.host, path)
    }
}

impl RouterClient for RouterOsRestClient {
    fn is_reachable(&self) -> bool {
        let result = self
            .probe
            .get(self.url("/system/identity"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send();
        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(host = %self.config.host, status = %response.status(), "Router identity probe rejected");
                false
            }
            Err(e) => {
                debug!(host = %self.config.host, error = %e, "Router unreachable");
                false
            }
        }
    }

    fn list_links(&self) -> Result<Vec<RawLink>> {
        let rows: Vec<NetwatchRow> = self
            .client
            .get(self.url("/tool/netwatch"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .with_context(|| format!("Netwatch request to {} failed", self.config.host))?
            .error_for_status()
            .context("Netwatch request rejected")?
            .json()
            .context("Invalid netwatch response body")?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                // 注释优先；两者皆空的行无法定位链路，丢弃
                let name = if !row.comment.is_empty() {
                    row.comment
                } else {
                    row.host
                };
                if name.is_empty() {
                    return None;
                }
                Some(RawLink {
                    name,
                    status: row.status,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netwatch_row_mapping() {
        let raw = r#"[
            {"host":"10.0.0.2","comment":"PRIVATE-ALICIA","status":"up"},
            {"host":"10.0.0.3","comment":"","status":"down"},
            {"host":"","comment":"","status":"up"}
        ]"#;
        let rows: Vec<NetwatchRow> = serde_json::from_str(raw).unwrap();
        let links: Vec<RawLink> = rows
            .into_iter()
            .filter_map(|row| {
                let name = if !row.comment.is_empty() {
                    row.comment
                } else {
                    row.host
                };
                if name.is_empty() {
                    return None;
                }
                Some(RawLink {
                    name,
                    status: row.status,
                })
            })
            .collect();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].name, "PRIVATE-ALICIA");
        assert_eq!(links[1].name, "10.0.0.3");
        assert_eq!(links[1].status, "down");
    }

    #[test]
    fn test_url_shape() {
        let client = RouterOsRestClient::new(RestClientConfig::new("192.168.4.1", "api", "secret"))
            .unwrap();
        assert_eq!(
            client.url("/tool/netwatch"),
            "http://192.168.4.1/rest/tool/netwatch"
        );
    }
}
