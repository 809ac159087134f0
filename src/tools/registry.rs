//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / integration_id / schema / execute），
//! 由 ToolRegistry 按名注册与查找。注册表区分「热工具」（始终进入执行阶段工具集）与
//! 按需检索的冷工具：record_usage 统计使用次数，越过阈值自动晋升为热工具。
//! search 按关键词对名称与描述做大小写不敏感匹配，名称命中优先。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

/// 使用次数达到该值后晋升为热工具
const HOT_PROMOTION_THRESHOLD: u64 = 5;

/// 工具 trait：名称、描述（供 LLM 理解）、所属集成、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于工具调用 JSON 的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 所属集成标识（如 "github"、"salesforce"）；内建工具返回 None
    fn integration_id(&self) -> Option<&str> {
        None
    }

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具元信息：集成 id 与输入 schema
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub integration_id: Option<String>,
    pub input_schema: Value,
}

/// 检索结果摘要
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，带热工具集合与使用统计
#[derive(Default)]
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
    hot: Mutex<HashSet<String>>,
    usage: Mutex<HashMap<String, u64>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册冷工具（通过 search_tools / execute_tool 按需使用）
    pub fn register(&self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools
            .lock()
            .expect("registry lock poisoned")
            .insert(name, Arc::new(tool));
    }

    /// 注册热工具（始终进入执行阶段的工具集）
    pub fn register_hot(&self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.hot
            .lock()
            .expect("registry lock poisoned")
            .insert(name.clone());
        self.tools
            .lock()
            .expect("registry lock poisoned")
            .insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn metadata(&self, name: &str) -> Option<ToolMetadata> {
        self.get(name).map(|tool| ToolMetadata {
            integration_id: tool.integration_id().map(str::to_string),
            input_schema: tool.parameters_schema(),
        })
    }

    /// 热工具列表（按名称排序，保证提示词稳定）
    pub fn hot_tools(&self) -> Vec<Arc<dyn Tool>> {
        let hot = self.hot.lock().expect("registry lock poisoned");
        let tools = self.tools.lock().expect("registry lock poisoned");
        let mut names: Vec<&String> = hot.iter().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| tools.get(name).cloned())
            .collect()
    }

    pub fn is_hot(&self, name: &str) -> bool {
        self.hot
            .lock()
            .expect("registry lock poisoned")
            .contains(name)
    }

    /// 记录一次使用；累计越过阈值后晋升为热工具
    pub fn record_usage(&self, name: &str) {
        let count = {
            let mut usage = self.usage.lock().expect("registry lock poisoned");
            let count = usage.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count >= HOT_PROMOTION_THRESHOLD {
            let exists = self
                .tools
                .lock()
                .expect("registry lock poisoned")
                .contains_key(name);
            if exists {
                let mut hot = self.hot.lock().expect("registry lock poisoned");
                if hot.insert(name.to_string()) {
                    tracing::info!(tool = name, usage = count, "promoted to hot tool set");
                }
            }
        }
    }

    /// 关键词检索：名称命中排在描述命中前，同级按名称排序
    pub fn search(&self, query: &str, limit: usize) -> Vec<ToolSummary> {
        let query = query.trim().to_lowercase();
        let tools = self.tools.lock().expect("registry lock poisoned");
        let mut scored: Vec<(u8, ToolSummary)> = tools
            .values()
            .filter_map(|tool| {
                let name = tool.name().to_lowercase();
                let description = tool.description().to_lowercase();
                let score = if query.is_empty() || name.contains(&query) {
                    2
                } else if description.contains(&query) {
                    1
                } else {
                    return None;
                };
                Some((
                    score,
                    ToolSummary {
                        name: tool.name().to_string(),
                        description: tool.description().to_string(),
                    },
                ))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        scored.into_iter().take(limit).map(|(_, s)| s).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyTool {
        name: &'static str,
        description: &'static str,
        integration: Option<&'static str>,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            self.description
        }
        fn integration_id(&self) -> Option<&str> {
            self.integration
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("ok".to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let reg = ToolRegistry::new();
        reg.register_hot(DummyTool {
            name: "tracker_get_issue",
            description: "Fetch an issue from the tracker",
            integration: Some("tracker"),
        });
        reg.register(DummyTool {
            name: "tracker_close_issue",
            description: "Close an issue in the tracker",
            integration: Some("tracker"),
        });
        reg.register(DummyTool {
            name: "crm_get_deal",
            description: "Fetch a deal from the CRM",
            integration: Some("crm"),
        });
        reg
    }

    #[test]
    fn test_hot_and_cold_registration() {
        let reg = registry();
        assert!(reg.is_hot("tracker_get_issue"));
        assert!(!reg.is_hot("tracker_close_issue"));
        let hot = reg.hot_tools();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].name(), "tracker_get_issue");
    }

    #[test]
    fn test_usage_promotes_to_hot() {
        let reg = registry();
        for _ in 0..4 {
            reg.record_usage("tracker_close_issue");
        }
        assert!(!reg.is_hot("tracker_close_issue"));
        reg.record_usage("tracker_close_issue");
        assert!(reg.is_hot("tracker_close_issue"));
        // 未注册的名字不会被晋升
        for _ in 0..10 {
            reg.record_usage("ghost_tool");
        }
        assert!(!reg.is_hot("ghost_tool"));
    }

    #[test]
    fn test_search_prefers_name_matches() {
        let reg = registry();
        let results = reg.search("tracker", 10);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|s| s.name.starts_with("tracker_")));

        let results = reg.search("deal", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "crm_get_deal");

        // 同级命中按名称排序
        let results = reg.search("issue", 10);
        assert_eq!(results[0].name, "tracker_close_issue");
        assert_eq!(results[1].name, "tracker_get_issue");

        // 名称不命中时回退到描述命中
        let results = reg.search("fetch", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "crm_get_deal");
        assert_eq!(results[1].name, "tracker_get_issue");

        assert!(reg.search("nonexistent", 10).is_empty());
    }

    #[test]
    fn test_metadata_exposes_integration_and_schema() {
        let reg = registry();
        let meta = reg.metadata("crm_get_deal").unwrap();
        assert_eq!(meta.integration_id.as_deref(), Some("crm"));
        assert!(meta.input_schema.is_object());
        assert!(reg.metadata("missing").is_none());
    }
}
