//! 重复动作缓存
//!
//! 以 hash(workspace|"global", 工具名, 规范化输入) 为键的有界内存缓存：同键调用落在
//! 配置窗口内判定为重复（不刷新时间戳）。逐出是插入触发的机会性清理，不做后台扫描，
//! 也不是严格 LRU。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// 默认缓存容量
pub const DEFAULT_DEDUPE_CAPACITY: usize = 1500;

/// 递归规范化 JSON：对象键排序，数组保持原序
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize_json(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// 稳定指纹：sha256(workspace|tool|canonical_json)，十六进制字符串
fn fingerprint(workspace: Option<&str>, tool: &str, input: &Value) -> String {
    let canonical = canonicalize_json(input).to_string();
    let mut hasher = Sha256::new();
    hasher.update(workspace.unwrap_or("global").as_bytes());
    hasher.update(b"|");
    hasher.update(tool.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// 有界重复动作缓存；多请求并发访问（Mutex 保护的 HashMap）
pub struct DedupeCache {
    entries: Mutex<HashMap<String, Instant>>,
    capacity: usize,
}

impl DedupeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// 检查并登记一次调用：窗口内的同键调用返回 true（重复，不刷新时间戳）；
    /// 否则记录当前时间并返回 false
    pub fn check_and_record(
        &self,
        workspace: Option<&str>,
        tool: &str,
        input: &Value,
        window: Duration,
    ) -> bool {
        self.check_and_record_at(workspace, tool, input, window, Instant::now())
    }

    /// 同上，但由调用方提供当前时刻（测试用模拟时钟）
    pub fn check_and_record_at(
        &self,
        workspace: Option<&str>,
        tool: &str,
        input: &Value,
        window: Duration,
        now: Instant,
    ) -> bool {
        let key = fingerprint(workspace, tool, input);
        let mut entries = self.entries.lock().expect("dedupe cache lock poisoned");

        if let Some(ts) = entries.get(&key) {
            if now.saturating_duration_since(*ts) < window {
                return true;
            }
        }

        entries.insert(key, now);
        if entries.len() > self.capacity {
            entries.retain(|_, ts| now.saturating_duration_since(*ts) < window);
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dedupe cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
