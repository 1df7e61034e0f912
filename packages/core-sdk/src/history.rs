use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{models::SqlResponse, telemetry};

pub const HISTORY_SLOT: &str = "queryHistory";
pub const MAX_HISTORY: usize = 20;
const SUMMARY_CHARS: usize = 100;

/**
 * \brief 客户端命名字符串槽（类似浏览器 localStorage）。
 */
pub trait LocalStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    slots: Mutex<HashMap<String, String>>,
}

impl LocalStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let slots = self.slots.lock().map_err(|_| anyhow!("storage lock poisoned"))?;
        Ok(slots.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|_| anyhow!("storage lock poisoned"))?;
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/**
 * \brief 所有槽位保存在一个 JSON 文件中；内容损坏时按空处理，读取失败则报错。
 */
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut slots = self.read_all()?;
        slots.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&slots)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

/**
 * \brief 客户端记录的一条生成结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHistoryItem {
    pub id: String,
    pub prompt: String,
    pub sql_query: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub summary: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl QueryHistoryItem {
    pub fn new(prompt: &str, response: &SqlResponse) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            sql_query: response.sql_query.clone(),
            explanation: response.explanation.clone(),
            summary: summarize(&response.explanation),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/**
 * \brief 选中历史记录后回填到生成表单的内容。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationForm {
    pub prompt: String,
    pub sql_query: String,
    pub explanation: String,
}

/**
 * \brief 最新在前的查询历史，上限 `MAX_HISTORY` 条，每次变更都会落盘。
 */
pub struct QueryHistory<S: LocalStorage> {
    storage: S,
    items: Vec<QueryHistoryItem>,
}

impl<S: LocalStorage> QueryHistory<S> {
    /**
     * \brief 从存储恢复；读取或解析失败视为空历史。
     */
    pub fn load(storage: S) -> Self {
        let items = match storage.get_item(HISTORY_SLOT) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueryHistoryItem>>(&raw) {
                Ok(mut items) => {
                    items.truncate(MAX_HISTORY);
                    items
                }
                Err(err) => {
                    telemetry::log_warn("history.load", &format!("parse failed: {}", err));
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                telemetry::log_warn("history.load", &format!("read failed: {:#}", err));
                Vec::new()
            }
        };
        Self { storage, items }
    }

    pub fn items(&self) -> &[QueryHistoryItem] {
        &self.items
    }

    pub fn append(&mut self, item: QueryHistoryItem) -> Result<()> {
        self.items.insert(0, item);
        self.items.truncate(MAX_HISTORY);
        self.persist()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.items.clear();
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<&QueryHistoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn select(&self, id: &str) -> Option<GenerationForm> {
        self.get(id).map(|item| GenerationForm {
            prompt: item.prompt.clone(),
            sql_query: item.sql_query.clone(),
            explanation: item.explanation.clone(),
        })
    }

    /**
     * \brief 按提示词、SQL 或摘要做不区分大小写的匹配；空关键字返回全部。
     */
    pub fn search(&self, term: &str) -> Vec<&QueryHistoryItem> {
        let needle = term.trim().to_lowercase();
        self.items
            .iter()
            .filter(|item| {
                needle.is_empty()
                    || item.prompt.to_lowercase().contains(&needle)
                    || item.sql_query.to_lowercase().contains(&needle)
                    || item.summary.to_lowercase().contains(&needle)
            })
            .collect()
    }

    fn persist(&self) -> Result<()> {
        let raw = serde_json::to_string(&self.items)?;
        self.storage.set_item(HISTORY_SLOT, &raw)
    }
}

/**
 * \brief 解释的摘要：超过 100 字符截断并加 "..."，否则取第一句。
 */
pub fn summarize(explanation: &str) -> String {
    if explanation.chars().count() > SUMMARY_CHARS {
        let head: String = explanation.chars().take(SUMMARY_CHARS).collect();
        format!("{}...", head)
    } else {
        let first = explanation.split('.').next().unwrap_or("");
        format!("{}.", first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: usize) -> QueryHistoryItem {
        QueryHistoryItem::new(
            &format!("question {}", n),
            &SqlResponse {
                sql_query: format!("SELECT {};", n),
                explanation: format!("Returns {}.", n),
            },
        )
    }

    #[test]
    fn test_append_caps_at_twenty_newest_first() {
        let mut history = QueryHistory::load(MemoryStorage::default());
        for n in 0..25 {
            history.append(item(n)).expect("append");
            assert!(history.items().len() <= MAX_HISTORY);
        }
        let prompts: Vec<String> = history.items().iter().map(|i| i.prompt.clone()).collect();
        let expected: Vec<String> = (5..25).rev().map(|n| format!("question {}", n)).collect();
        assert_eq!(prompts, expected);
    }

    #[test]
    fn test_state_round_trips_through_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        let mut history = QueryHistory::load(FileStorage::new(&path));
        history.append(item(1)).expect("append 1");
        history.append(item(2)).expect("append 2");

        let reloaded = QueryHistory::load(FileStorage::new(&path));
        assert_eq!(reloaded.items(), history.items());
    }

    #[test]
    fn test_clear_then_reload_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        let mut history = QueryHistory::load(FileStorage::new(&path));
        history.append(item(1)).expect("append");
        history.clear().expect("clear");
        assert!(history.items().is_empty());
        assert!(QueryHistory::load(FileStorage::new(&path)).items().is_empty());
    }

    #[test]
    fn test_corrupt_history_loads_empty() {
        let storage = MemoryStorage::default();
        storage
            .set_item(HISTORY_SLOT, "[{\"id\": 1")
            .expect("seed corrupt");
        let history = QueryHistory::load(storage);
        assert!(history.items().is_empty());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json at all").expect("write garbage");
        let mut history = QueryHistory::load(FileStorage::new(&path));
        assert!(history.items().is_empty());
        history.append(item(7)).expect("append over garbage");
        assert_eq!(QueryHistory::load(FileStorage::new(&path)).items().len(), 1);
    }

    #[test]
    fn test_unreadable_file_is_not_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        let bytes = [0xffu8, 0xfe, 0x00, 0x7b];
        std::fs::write(&path, bytes).expect("write non-utf8");
        let storage = FileStorage::new(&path);
        assert!(storage.set_item(HISTORY_SLOT, "[]").is_err());
        assert_eq!(std::fs::read(&path).expect("read back"), bytes);
    }

    #[test]
    fn test_select_republishes_form_state() {
        let mut history = QueryHistory::load(MemoryStorage::default());
        let entry = item(3);
        let id = entry.id.clone();
        history.append(entry).expect("append");
        let form = history.select(&id).expect("form");
        assert_eq!(
            form,
            GenerationForm {
                prompt: "question 3".into(),
                sql_query: "SELECT 3;".into(),
                explanation: "Returns 3.".into(),
            }
        );
        assert!(history.select("missing").is_none());
    }

    #[test]
    fn test_search_matches_prompt_sql_and_summary() {
        let mut history = QueryHistory::load(MemoryStorage::default());
        history
            .append(QueryHistoryItem::new(
                "Top customers",
                &SqlResponse {
                    sql_query: "SELECT * FROM customers LIMIT 5;".into(),
                    explanation: "Lists the best buyers.".into(),
                },
            ))
            .expect("append");
        history.append(item(1)).expect("append");
        assert_eq!(history.search("CUSTOMERS").len(), 1);
        assert_eq!(history.search("best buyers").len(), 1);
        assert_eq!(history.search("").len(), 2);
        assert!(history.search("inventory").is_empty());
    }

    #[test]
    fn test_summarize_rules() {
        assert_eq!(
            summarize("Counts orders. Then groups them by month."),
            "Counts orders."
        );
        assert_eq!(summarize("No period here"), "No period here.");
        let long = "a".repeat(150);
        let s = summarize(&long);
        assert_eq!(s.chars().count(), 103);
        assert!(s.ends_with("..."));
        let exactly = "b".repeat(100);
        assert_eq!(summarize(&exactly), format!("{}.", exactly));
    }
}
