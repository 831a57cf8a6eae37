//! Netwatch Monitor CLI
//!
//! 监控多个路由器分组下的链路可达性，把原始 UP/DOWN 观测转成
//! 去抖、去重、限速后的订户通知。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use netwatch_monitor::{
    build_router_clients, data_dir, load_directory, load_templates, AuditLog, ConsoleSender,
    MessengerConfig, MessengerSender, Monitor, MonitorConfig, RouterClient, Sender, Settings,
};

#[derive(Parser)]
#[command(name = "nwm")]
#[command(about = "Netwatch Monitor - 链路可达性监控与通知分发")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动监控：分组轮询 + 通知投递
    Run {
        /// 轮询间隔（秒），覆盖默认配置
        #[arg(long, short)]
        interval: Option<u64>,
        /// dry-run 模式：通知打印到控制台，不实际外发
        #[arg(long)]
        dry_run: bool,
    },
    /// 单次探测所有分组并打印链路状态
    Check {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 向指定接收者发送一条测试消息
    SendTest {
        /// Messenger 接收者 ID
        recipient_id: String,
        /// 消息内容
        message: String,
    },
    /// 列出模板库内容
    Templates {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 查看最近的投递审计记录
    Deliveries {
        /// 条数上限
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化 tracing 日志系统
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug nwm run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("netwatch_monitor=info,nwm=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { interval, dry_run } => {
            let mut config = MonitorConfig::from_env();
            if let Some(secs) = interval {
                config.poll_interval = std::time::Duration::from_secs(secs);
            }
            config.dry_run = dry_run;
            run_monitor(config).await?;
        }
        Commands::Check { json } => {
            let config = MonitorConfig::from_env();
            tokio::task::spawn_blocking(move || run_check(&config, json)).await??;
        }
        Commands::SendTest {
            recipient_id,
            message,
        } => {
            let config = MonitorConfig::from_env();
            let sender = build_sender(&config);
            let result =
                tokio::task::spawn_blocking(move || sender.send(&recipient_id, &message)).await??;
            println!("发送结果: {:?}", result);
        }
        Commands::Templates { json } => {
            let store = load_templates(data_dir().join("templates.json"))?;
            let entries = store.entries();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("共 {} 份模板:\n", entries.len());
                for tpl in entries {
                    println!("  {} | {}", tpl.title, tpl.content);
                }
            }
        }
        Commands::Deliveries { limit } => {
            let audit = AuditLog::new();
            let records = audit.recent(limit)?;
            println!("最近 {} 条投递记录:\n", records.len());
            for r in records {
                println!(
                    "  {} | {} | {}:{} {} -> {} [{}]",
                    r.ts.format("%Y-%m-%d %H:%M:%S"),
                    r.template,
                    r.group,
                    r.link,
                    r.state,
                    r.recipient,
                    r.outcome
                );
            }
        }
    }

    Ok(())
}

/// 组装并启动监控引擎，直到 Ctrl+C
async fn run_monitor(config: MonitorConfig) -> Result<()> {
    let dir = data_dir();
    let directory = load_directory(&dir.join("recipients.json"));
    let templates = load_templates(dir.join("templates.json"))?;
    let sender = build_sender(&config);
    let audit = Arc::new(AuditLog::new());

    let clients = build_router_clients(&config);
    info!(groups = clients.len(), "Starting netwatch monitor");

    let monitor = Monitor::new(config, directory, templates, sender, audit);
    let handles = monitor.start(clients);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handles.abort();
    Ok(())
}

/// 按配置选择发送器；缺令牌或 dry-run 时退化为控制台输出
fn build_sender(config: &MonitorConfig) -> Arc<dyn Sender> {
    if config.dry_run {
        return Arc::new(ConsoleSender);
    }
    let settings = Settings::load(&data_dir().join("settings.json"));
    match &config.page_access_token {
        Some(token) => match MessengerSender::new(MessengerConfig {
            access_token: token.clone(),
            enabled: settings.enable_messenger_send,
            ..Default::default()
        }) {
            Ok(sender) => Arc::new(sender),
            Err(e) => {
                warn!(error = %e, "Failed to build messenger sender, falling back to console");
                Arc::new(ConsoleSender)
            }
        },
        None => {
            warn!("PAGE_ACCESS_TOKEN not set, notifications will print to console");
            Arc::new(ConsoleSender)
        }
    }
}

/// 单次探测：打印每个分组的可达性与链路状态
fn run_check(config: &MonitorConfig, json: bool) -> Result<()> {
    let clients = build_router_clients(config);
    let mut report = Vec::new();

    for (group, client) in &clients {
        let reachable = client.is_reachable();
        let links = if reachable {
            client.list_links().unwrap_or_default()
        } else {
            Vec::new()
        };
        report.push(serde_json::json!({
            "group": group,
            "reachable": reachable,
            "links": links.iter().map(|l| {
                serde_json::json!({ "name": l.name, "status": l.status })
            }).collect::<Vec<_>>(),
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in &report {
            let group = entry["group"].as_str().unwrap_or("?");
            let reachable = entry["reachable"].as_bool().unwrap_or(false);
            println!(
                "分组 {} | 路由器{}",
                group,
                if reachable { "可达" } else { "不可达" }
            );
            if let Some(links) = entry["links"].as_array() {
                for link in links {
                    println!(
                        "  {} | {}",
                        link["name"].as_str().unwrap_or("?"),
                        link["status"].as_str().unwrap_or("?")
                    );
                }
            }
        }
    }
    Ok(())
}
