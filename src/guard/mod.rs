//! 工具护栏
//!
//! 对每次工具调用做准入检查：工作区白名单匹配（支持 `*` 前缀通配与 `*` 工作区回退）、
//! 变更类工具的重复动作判定、工作区提示注入。限流 / 审批 / 审计 / 结果监控属于外部
//! 协作方，契约见 services 子模块。拒绝永远以结构化结果返回，不抛异常。

pub mod dedupe;
pub mod services;

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

pub use dedupe::{canonicalize_json, DedupeCache, DEFAULT_DEDUPE_CAPACITY};
pub use services::{
    ApprovalGates, AuditLog, NoApprovalGates, NoopRateLimiter, OutcomeMonitor, RateDecision,
    RateLimiter, TracingAuditLog, TracingOutcomeMonitor,
};

/// 永远放行的基础工具：注册表检索 / 执行与时钟，不受工作区白名单约束
pub const ALWAYS_ALLOWED_TOOLS: &[&str] = &["search_tools", "execute_tool", "current_time"];

/// 默认的「变更类、易重复」工具名模式（可配置覆盖，见 [guardrails].mutating_patterns）
pub fn default_mutating_patterns() -> Vec<String> {
    vec![
        r"(?i)create[-_](ticket|issue|case|task|record)".to_string(),
        r"(?i)(open|file)[-_](ticket|issue|bug)".to_string(),
        r"(?i)create[-_](pr|pull[-_]request|merge[-_]request)".to_string(),
        r"(?i)(send|post)[-_](message|email|reply|comment)".to_string(),
    ]
}

/// 护栏配置（来自 [guardrails] 配置段）
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// 工作区 -> 白名单条目；键 "*" 为全局回退；条目可以 `*` 结尾做前缀匹配
    pub allowlists: HashMap<String, Vec<String>>,
    /// 工作区 -> 注入执行阶段提示词的工具使用提示
    pub hints: HashMap<String, String>,
    /// 变更类工具名正则（命中才做重复动作判定）
    pub mutating_patterns: Vec<String>,
    /// 重复动作窗口（秒）与工作区覆盖
    pub dedupe_window_secs: u64,
    pub dedupe_window_overrides: HashMap<String, u64>,
    pub dedupe_capacity: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            allowlists: HashMap::new(),
            hints: HashMap::new(),
            mutating_patterns: default_mutating_patterns(),
            dedupe_window_secs: 3600,
            dedupe_window_overrides: HashMap::new(),
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
        }
    }
}

/// 单次准入判定结果（每次调用临时构造，不持久化）
#[derive(Debug, Clone)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GuardDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// 白名单条目匹配：`*` 结尾做前缀匹配，否则精确匹配；均大小写不敏感
fn entry_matches(entry: &str, name: &str) -> bool {
    if let Some(prefix) = entry.strip_suffix('*') {
        return name
            .get(..prefix.len())
            .map(|head| head.eq_ignore_ascii_case(prefix))
            .unwrap_or(false);
    }
    entry.eq_ignore_ascii_case(name)
}

/// 护栏组件：配置 + 编译后的变更模式 + 显式持有的重复动作缓存（注入流水线，非全局单例）
pub struct Guardrails {
    config: GuardConfig,
    mutating: Vec<Regex>,
    dedupe: DedupeCache,
}

impl Guardrails {
    pub fn new(config: GuardConfig) -> Self {
        let mutating = config
            .mutating_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "skipping invalid mutating-tool pattern");
                    None
                }
            })
            .collect();
        let dedupe = DedupeCache::new(config.dedupe_capacity);
        Self {
            config,
            mutating,
            dedupe,
        }
    }

    /// 解析工作区白名单：工作区条目，其次 `*` 回退条目，否则空（空表示不限制）
    pub fn resolve_allowlist(&self, workspace: Option<&str>) -> &[String] {
        workspace
            .and_then(|w| self.config.allowlists.get(w))
            .or_else(|| self.config.allowlists.get("*"))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// 白名单判定：基础工具永远放行；无工作区或空名单放行；否则要求工具名或集成 id
    /// 命中某个条目（精确或 `*` 前缀），不命中则给出可读原因拒绝
    pub fn is_tool_allowed(
        &self,
        workspace: Option<&str>,
        tool: &str,
        integration_id: Option<&str>,
    ) -> GuardDecision {
        if ALWAYS_ALLOWED_TOOLS
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tool))
        {
            return GuardDecision::allow();
        }

        let entries = self.resolve_allowlist(workspace);
        if entries.is_empty() {
            return GuardDecision::allow();
        }

        for entry in entries {
            if entry_matches(entry, tool) {
                return GuardDecision::allow();
            }
            if let Some(integration) = integration_id {
                if entry_matches(entry, integration) {
                    return GuardDecision::allow();
                }
            }
        }

        GuardDecision::deny(format!(
            "tool '{tool}' is not on the allowlist for workspace '{}'",
            workspace.unwrap_or("*")
        ))
    }

    /// 是否对该工具做重复动作判定：基础工具除外，仅命中变更类模式的工具
    pub fn should_dedupe(&self, tool: &str) -> bool {
        if ALWAYS_ALLOWED_TOOLS
            .iter()
            .any(|t| t.eq_ignore_ascii_case(tool))
        {
            return false;
        }
        self.mutating.iter().any(|re| re.is_match(tool))
    }

    /// 该工作区生效的重复动作窗口
    pub fn dedupe_window(&self, workspace: Option<&str>) -> Duration {
        let secs = workspace
            .and_then(|w| self.config.dedupe_window_overrides.get(w).copied())
            .unwrap_or(self.config.dedupe_window_secs);
        Duration::from_secs(secs)
    }

    /// 重复动作判定：窗口内同 (工作区, 工具, 规范化输入) 的第二次调用为重复
    pub fn is_duplicate(&self, workspace: Option<&str>, tool: &str, input: &Value) -> bool {
        self.dedupe
            .check_and_record(workspace, tool, input, self.dedupe_window(workspace))
    }

    /// 工作区的工具使用提示（注入执行阶段系统提示词）
    pub fn hint_for(&self, workspace: Option<&str>) -> Option<&str> {
        workspace
            .and_then(|w| self.config.hints.get(w))
            .map(String::as_str)
    }

    /// 白名单摘要（注入执行阶段系统提示词）
    pub fn allowlist_summary(&self, workspace: Option<&str>) -> String {
        let entries = self.resolve_allowlist(workspace);
        if entries.is_empty() {
            "all registered tools are allowed".to_string()
        } else {
            format!("allowed tools/integrations: {}", entries.join(", "))
        }
    }
}
