//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）、complete_stream
//! （流式 Token）。RetryingLlmClient 在任意实现外包一层统一退避重试，把限流与超时
//! 映射到 retry 引擎的分类上。

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::memory::Message;
use crate::retry::{with_retry, RetryError, RetryOptions, UpstreamError};

/// LLM 调用错误：一般 API 错误、限流（含建议等待毫秒数）、超时
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM request timeout")]
    Timeout,
}

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流
    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// LLM 重试配置（与 retry::RetryOptions 同形，独立出来便于按配置段反序列化）
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let opts = RetryOptions::default();
        Self {
            max_attempts: opts.max_attempts,
            base_delay_ms: opts.base_delay_ms,
            max_delay_ms: opts.max_delay_ms,
            jitter_ms: opts.jitter_ms,
        }
    }
}

impl From<&RetryConfig> for RetryOptions {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay_ms: cfg.base_delay_ms,
            max_delay_ms: cfg.max_delay_ms,
            jitter_ms: cfg.jitter_ms,
        }
    }
}

/// 把 LlmError 映射为重试引擎可分类的 UpstreamError
fn upstream_from_llm(err: LlmError) -> UpstreamError {
    match err {
        LlmError::ApiError(msg) => UpstreamError::new(msg),
        LlmError::RateLimited { retry_after_ms } => UpstreamError::new("rate limited")
            .with_status(429)
            .with_header("retry-after", retry_after_ms.div_ceil(1000).to_string()),
        LlmError::Timeout => UpstreamError::new("request timeout").with_code("ETIMEDOUT"),
    }
}

fn llm_from_upstream(err: UpstreamError) -> LlmError {
    if err.code.as_deref() == Some("ETIMEDOUT") {
        return LlmError::Timeout;
    }
    if err.status == Some(429) {
        let retry_after_ms = err
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(0);
        return LlmError::RateLimited { retry_after_ms };
    }
    LlmError::ApiError(err.message)
}

/// 在任意 LlmClient 外包一层统一退避重试（限流 / 超时走 retry 引擎）
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    options: RetryOptions,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: &RetryConfig) -> Self {
        Self {
            inner,
            options: config.into(),
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let inner = self.inner.clone();
        let messages = messages.to_vec();
        let result = with_retry(
            move || {
                let inner = inner.clone();
                let messages = messages.clone();
                async move { inner.complete(&messages).await.map_err(upstream_from_llm) }
            },
            "llm.complete",
            &self.options,
        )
        .await;

        match result {
            Ok(text) => Ok(text),
            Err(RetryError::RateLimited { retry_after, .. }) => Err(LlmError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            }),
            Err(RetryError::Upstream(err)) => Err(llm_from_upstream(err)),
        }
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        // 流式调用不做中途重试：失败由调用方整体重来
        self.inner.complete_stream(messages).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}
