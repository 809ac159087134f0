//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

use std::sync::Arc;

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};

use crate::config::AppConfig;

/// 根据配置创建 LLM 客户端（mock / OpenAI 兼容端点），外面统一包一层退避重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let inner: Arc<dyn LlmClient> = match cfg.llm.provider.as_str() {
        "mock" => Arc::new(MockLlmClient),
        _ => Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
        )),
    };
    let retry = RetryConfig {
        max_attempts: cfg.retry.max_attempts,
        base_delay_ms: cfg.retry.base_delay_ms,
        max_delay_ms: cfg.retry.max_delay_ms,
        jitter_ms: cfg.retry.jitter_ms,
    };
    Arc::new(RetryingLlmClient::new(inner, &retry))
}
