//! 消息模板 - 按候选标题查找，缺失时自动生成默认文案
//!
//! 查找顺序从最具体到最泛化，第一个存在的模板胜出；全部缺失时按角色和
//! 状态拼一份合理的默认文案并持久化到最具体的标题下，保证后续查找稳定命中。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::state::{LinkKey, Role};

/// 一份已解析的模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub title: String,
    pub content: String,
}

/// 模板存取能力
pub trait TemplateStore: Send + Sync {
    /// 依序尝试候选标题，返回第一个存在的模板
    fn find(&self, candidates: &[String]) -> Option<Template>;

    /// 新建模板；已存在的标题保持不变（幂等）
    fn create(&self, title: &str, content: &str) -> Result<()>;
}

/// 稳定态通知的候选标题，从最具体到最泛化
///
/// `链路-分组-状态`、`链路-分组`、`分组-状态`、`链路-状态`、裸 `状态`。
pub fn lookup_candidates(key: &LinkKey, state_label: &str) -> Vec<String> {
    vec![
        format!("{}-{}-{}", key.name, key.group, state_label),
        format!("{}-{}", key.name, key.group),
        format!("{}-{}", key.group, state_label),
        format!("{}-{}", key.name, state_label),
        state_label.to_string(),
    ]
}

/// SPIKE 通知的候选标题（按角色归类）
pub fn spike_candidates(role: Role, state_label: &str) -> Vec<String> {
    vec![
        format!("{}-SPIKE-{}", role, state_label),
        format!("{}-SPIKE", role),
        format!("SPIKE-{}", state_label),
    ]
}

/// 欠费订户专用的 SPIKE 候选标题
pub fn unpaid_spike_candidates(role: Role, state_label: &str) -> Vec<String> {
    let mut candidates = vec![format!("{}-UNPAID-SPIKE", role)];
    candidates.extend(spike_candidates(role, state_label));
    candidates
}

/// 按角色和状态生成默认文案
pub fn default_content(role: Role, state_label: &str) -> String {
    match (role, state_label) {
        (Role::Private, "DOWN") => "Your PRIVATE connection is currently down. Kindly check if the cables are properly connected and if all indicator lights are on.".to_string(),
        (Role::Vendo, "DOWN") => "Your VENDO is currently down. Kindly check if the cables are properly connected and if all indicator lights are on.".to_string(),
        (Role::Isp, "DOWN") => "We are currently experiencing an internet service interruption. Our provider is already working on it. Thank you for your patience.".to_string(),
        (_, "DOWN") => "Your connection is currently down. Kindly check the cables and indicator lights.".to_string(),
        (Role::Private, "UP") => "Your PRIVATE connection is up and running.".to_string(),
        (Role::Vendo, "UP") => "Your VENDO is up and running.".to_string(),
        (Role::Isp, "UP") => "Internet service has been restored. Thank you for your patience.".to_string(),
        (_, "UP") => "Your connection is up and running.".to_string(),
        (_, "SPIKE-DOWN") => "Your connection is experiencing intermittent interruptions. Our team is already monitoring the line. Kindly bear with us while it stabilizes.".to_string(),
        (_, "SPIKE-UP") => "Your connection has stabilized and is back to normal. Thank you for your patience.".to_string(),
        _ => format!("Notification: {}", state_label),
    }
}

/// 内存模板库
pub struct InMemoryTemplateStore {
    templates: Mutex<BTreeMap<String, String>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self {
            templates: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        let store = Self::new();
        {
            let mut map = store.templates.lock().expect("template store poisoned");
            for (title, content) in entries {
                map.insert(title.to_string(), content.to_string());
            }
        }
        store
    }

    /// 全部模板快照（CLI 展示用）
    pub fn entries(&self) -> Vec<Template> {
        self.templates
            .lock()
            .expect("template store poisoned")
            .iter()
            .map(|(title, content)| Template {
                title: title.clone(),
                content: content.clone(),
            })
            .collect()
    }
}

impl Default for InMemoryTemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn find(&self, candidates: &[String]) -> Option<Template> {
        let map = self.templates.lock().expect("template store poisoned");
        candidates.iter().find_map(|title| {
            map.get(title).map(|content| Template {
                title: title.clone(),
                content: content.clone(),
            })
        })
    }

    fn create(&self, title: &str, content: &str) -> Result<()> {
        let mut map = self.templates.lock().expect("template store poisoned");
        map.entry(title.to_string())
            .or_insert_with(|| content.to_string());
        Ok(())
    }
}

/// JSON 文件模板库（标题 → 内容的扁平对象）
pub struct FileTemplateStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileTemplateStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let cache = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read template file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid template file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write template file {}", self.path.display()))
    }

    pub fn entries(&self) -> Vec<Template> {
        self.cache
            .lock()
            .expect("template store poisoned")
            .iter()
            .map(|(title, content)| Template {
                title: title.clone(),
                content: content.clone(),
            })
            .collect()
    }
}

impl TemplateStore for FileTemplateStore {
    fn find(&self, candidates: &[String]) -> Option<Template> {
        let map = self.cache.lock().expect("template store poisoned");
        candidates.iter().find_map(|title| {
            map.get(title).map(|content| Template {
                title: title.clone(),
                content: content.clone(),
            })
        })
    }

    fn create(&self, title: &str, content: &str) -> Result<()> {
        let snapshot = {
            let mut map = self.cache.lock().expect("template store poisoned");
            if map.contains_key(title) {
                return Ok(());
            }
            map.insert(title.to_string(), content.to_string());
            map.clone()
        };
        if let Err(e) = self.persist(&snapshot) {
            warn!(title = %title, error = %e, "Failed to persist template");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_order_most_specific_first() {
        let key = LinkKey::new("G1", "PRIVATE-ALICIA");
        let candidates = lookup_candidates(&key, "DOWN");
        assert_eq!(
            candidates,
            vec![
                "PRIVATE-ALICIA-G1-DOWN".to_string(),
                "PRIVATE-ALICIA-G1".to_string(),
                "G1-DOWN".to_string(),
                "PRIVATE-ALICIA-DOWN".to_string(),
                "DOWN".to_string(),
            ]
        );
    }

    #[test]
    fn test_first_existing_candidate_wins() {
        let key = LinkKey::new("G1", "PRIVATE-ALICIA");
        let store = InMemoryTemplateStore::with_entries(&[
            ("G1-DOWN", "group down"),
            ("DOWN", "bare down"),
        ]);
        let found = store.find(&lookup_candidates(&key, "DOWN")).unwrap();
        assert_eq!(found.title, "G1-DOWN");
        assert_eq!(found.content, "group down");
    }

    #[test]
    fn test_bare_state_fallback() {
        let key = LinkKey::new("G1", "PRIVATE-ALICIA");
        let store = InMemoryTemplateStore::with_entries(&[("DOWN", "bare down")]);
        let found = store.find(&lookup_candidates(&key, "DOWN")).unwrap();
        assert_eq!(found.title, "DOWN");
    }

    #[test]
    fn test_create_is_idempotent() {
        let store = InMemoryTemplateStore::new();
        store.create("DOWN", "first").unwrap();
        store.create("DOWN", "second").unwrap();
        let found = store.find(&["DOWN".to_string()]).unwrap();
        assert_eq!(found.content, "first");
    }

    #[test]
    fn test_default_content_by_role() {
        assert!(default_content(Role::Private, "DOWN").contains("PRIVATE connection"));
        assert!(default_content(Role::Vendo, "UP").contains("VENDO"));
        assert!(default_content(Role::Other, "SPIKE-DOWN").contains("intermittent"));
    }

    #[test]
    fn test_unpaid_spike_candidates_lead_with_unpaid() {
        let candidates = unpaid_spike_candidates(Role::Private, "DOWN");
        assert_eq!(candidates[0], "PRIVATE-UNPAID-SPIKE");
        assert_eq!(candidates[1], "PRIVATE-SPIKE-DOWN");
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");
        {
            let store = FileTemplateStore::load(path.clone()).unwrap();
            store.create("DOWN", "bare down").unwrap();
        }
        let reloaded = FileTemplateStore::load(path).unwrap();
        let found = reloaded.find(&["DOWN".to_string()]).unwrap();
        assert_eq!(found.content, "bare down");
    }
}
