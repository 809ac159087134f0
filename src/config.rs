//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BATON__*` 覆盖（双下划线表示嵌套，
//! 如 `BATON__LLM__PROVIDER=mock`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::guard::{default_mutating_patterns, GuardConfig, DEFAULT_DEDUPE_CAPACITY};
use crate::retry::RetryOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub pipeline: PipelineSection,
    pub retry: RetrySection,
    pub guardrails: GuardrailsSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名与对话轮数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话历史保留轮数
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: default_max_context_turns(),
        }
    }
}

fn default_max_context_turns() -> usize {
    20
}

/// [llm] 段：后端选择（openai 兼容 / mock）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [pipeline] 段：执行阶段步数预算与单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_max_steps() -> usize {
    8
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [retry] 段：出站调用退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter_ms: default_retry_jitter_ms(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_retry_jitter_ms() -> u64 {
    250
}

impl RetrySection {
    pub fn options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter_ms: self.jitter_ms,
        }
    }
}

/// [guardrails] 段：工作区白名单、工具提示与重复动作参数
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailsSection {
    /// 工作区 -> 白名单条目；键 "*" 为全局回退
    #[serde(default)]
    pub allowlists: HashMap<String, Vec<String>>,
    /// 工作区 -> 注入执行阶段提示词的工具使用提示
    #[serde(default)]
    pub hints: HashMap<String, String>,
    /// 变更类工具名正则（命中才做重复动作判定）
    #[serde(default = "default_mutating_patterns")]
    pub mutating_patterns: Vec<String>,
    #[serde(default)]
    pub dedupe: DedupeSection,
}

impl Default for GuardrailsSection {
    fn default() -> Self {
        Self {
            allowlists: HashMap::new(),
            hints: HashMap::new(),
            mutating_patterns: default_mutating_patterns(),
            dedupe: DedupeSection::default(),
        }
    }
}

/// [guardrails.dedupe] 段：重复动作窗口与缓存容量
#[derive(Debug, Clone, Deserialize)]
pub struct DedupeSection {
    #[serde(default = "default_dedupe_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_dedupe_capacity")]
    pub capacity: usize,
    /// 工作区 -> 窗口秒数覆盖
    #[serde(default)]
    pub window_overrides: HashMap<String, u64>,
}

impl Default for DedupeSection {
    fn default() -> Self {
        Self {
            window_secs: default_dedupe_window_secs(),
            capacity: default_dedupe_capacity(),
            window_overrides: HashMap::new(),
        }
    }
}

fn default_dedupe_window_secs() -> u64 {
    3600
}

fn default_dedupe_capacity() -> usize {
    DEFAULT_DEDUPE_CAPACITY
}

impl GuardrailsSection {
    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            allowlists: self.allowlists.clone(),
            hints: self.hints.clone(),
            mutating_patterns: self.mutating_patterns.clone(),
            dedupe_window_secs: self.dedupe.window_secs,
            dedupe_window_overrides: self.dedupe.window_overrides.clone(),
            dedupe_capacity: self.dedupe.capacity,
        }
    }
}

/// [tools] 段：内建工具参数
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    #[serde(default)]
    pub fetch: FetchSection,
}

/// [tools.fetch] 段：抓取 URL 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_fetch_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_result_chars: default_fetch_max_result_chars(),
            allowed_domains: default_fetch_allowed_domains(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_fetch_max_result_chars() -> usize {
    8000
}

fn default_fetch_allowed_domains() -> Vec<String> {
    vec![
        "en.wikipedia.org".into(),
        "github.com".into(),
        "raw.githubusercontent.com".into(),
        "stackoverflow.com".into(),
        "docs.rs".into(),
        "crates.io".into(),
        "doc.rust-lang.org".into(),
        "developer.mozilla.org".into(),
        "arxiv.org".into(),
        "news.ycombinator.com".into(),
    ]
}

/// 从 config 目录加载配置，环境变量 BATON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BATON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BATON")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
