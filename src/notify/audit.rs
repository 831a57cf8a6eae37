//! 投递审计日志 - 本地 JSONL 追加写
//!
//! 每次投递尝试（成功或失败）追加一行；写入持文件锁，
//! 文件超限后截断到保留条数。Dispatcher 对写入失败只记日志不中断。

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 单条投递审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// ISO8601 时间戳
    pub ts: DateTime<Utc>,
    /// 路由器分组
    pub group: String,
    /// 链路名
    pub link: String,
    /// 通知状态标签（UP/DOWN/SPIKE-DOWN/SPIKE-UP）
    pub state: String,
    /// 接收者显示名
    pub recipient: String,
    /// 使用的模板标题
    pub template: String,
    /// 结果（sent/skipped/failed）
    pub outcome: String,
}

const MAX_RECORDS: usize = 2000;
const KEEP_AFTER_CLEANUP: usize = 1000;
const CLEANUP_CHECK_INTERVAL: usize = 50;
static WRITE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// 审计日志
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// 默认存储路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("netwatch-monitor")
            .join("deliveries.jsonl")
    }

    pub fn new() -> Self {
        Self {
            path: Self::default_path(),
        }
    }

    /// 指定路径（测试用）
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// 追加一条记录（带文件锁）
    pub fn record(&self, record: &DeliveryRecord) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let mut writer = &file;
        let line = serde_json::to_string(record)?;
        writeln!(writer, "{}", line)?;
        file.unlock()?;

        let count = WRITE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if count % CLEANUP_CHECK_INTERVAL == 0 {
            self.cleanup_if_needed()?;
        }
        Ok(())
    }

    /// 最近 `limit` 条记录（新到旧）
    pub fn recent(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records: Vec<DeliveryRecord> = reader
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// 超限时截断到保留条数
    fn cleanup_if_needed(&self) -> Result<()> {
        use fs2::FileExt;

        if !self.path.exists() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        file.lock_exclusive()?;
        let reader = BufReader::new(&file);
        let lines: Vec<String> = reader.lines().filter_map(|l| l.ok()).collect();
        file.unlock()?;

        if lines.len() <= MAX_RECORDS {
            return Ok(());
        }
        let keep: Vec<&String> = lines.iter().rev().take(KEEP_AFTER_CLEANUP).collect();
        let out = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        out.lock_exclusive()?;
        let mut writer = &out;
        for line in keep.iter().rev() {
            writeln!(writer, "{}", line)?;
        }
        out.unlock()?;
        Ok(())
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
