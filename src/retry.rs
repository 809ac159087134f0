//! 出站调用统一重试
//!
//! with_retry 包装任意可失败的异步操作：按状态码 / 错误码 / 限流信号判定可重试性，
//! 指数退避加抖动、封顶；当服务端给出的等待时间超过上限时，直接升级为终态限流错误
//! （携带建议等待时长），不再白白耗尽重试次数。睡眠为非阻塞挂起，不影响并发请求。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// 固定可重试状态码集合
const RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 瞬态网络错误码集合（连接重置 / 超时 / DNS）
const TRANSIENT_CODES: [&str; 4] = ["ECONNRESET", "ETIMEDOUT", "EAI_AGAIN", "ENOTFOUND"];

/// 重试配置：次数、基准延迟、延迟上限、抖动
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5000,
            jitter_ms: 250,
        }
    }
}

/// 上游调用失败：消息 + 可选状态码 / 错误码 / 响应头，供重试分类使用
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
            headers: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 按名取首个响应头值（大小写不敏感）；头可能缺失或重复，重复时取第一个
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// 重试引擎的终态错误：被限流（携带建议等待时长）或上游错误原样透出
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("rate limited by upstream ({context}), retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: String,
    },

    #[error(transparent)]
    Upstream(UpstreamError),
}

/// 限流信号：429，或 403 且配额头显示剩余为零
fn is_rate_limited(err: &UpstreamError) -> bool {
    match err.status {
        Some(429) => true,
        Some(403) => err
            .header("x-ratelimit-remaining")
            .map(|v| v.trim() == "0")
            .unwrap_or(false),
        _ => false,
    }
}

fn is_retryable(err: &UpstreamError) -> bool {
    if is_rate_limited(err) {
        return true;
    }
    if let Some(status) = err.status {
        if RETRYABLE_STATUS.contains(&status) {
            return true;
        }
    }
    if let Some(code) = &err.code {
        if TRANSIENT_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
            return true;
        }
    }
    false
}

/// 服务端建议等待时长（毫秒）：Retry-After（秒数或 HTTP 日期），其次
/// x-ratelimit-reset（epoch 秒）；解析失败一律视为缺失
fn server_hint_ms(err: &UpstreamError) -> Option<u64> {
    if let Some(value) = err.header("retry-after") {
        let value = value.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(secs.saturating_mul(1000));
        }
        if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
            let delta = date.timestamp_millis() - chrono::Utc::now().timestamp_millis();
            return Some(delta.max(0) as u64);
        }
    }
    if let Some(value) = err.header("x-ratelimit-reset") {
        if let Ok(epoch_secs) = value.trim().parse::<i64>() {
            let delta = epoch_secs.saturating_mul(1000) - chrono::Utc::now().timestamp_millis();
            return Some(delta.max(0) as u64);
        }
    }
    None
}

fn jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}

/// 包装一个可失败的异步操作，按 RetryOptions 做指数退避重试。
///
/// - 不可重试的错误与最后一次尝试的错误立即透出为 RetryError::Upstream；
/// - 限流且服务端建议等待超过 max_delay_ms 时，立即返回 RetryError::RateLimited
///   （哪怕是第一次失败），由调用方决定如何向上游反馈；
/// - 其余情况延迟 min(max_delay_ms, 服务端建议 ?? 指数退避) + 抖动 后重试。
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    context: &str,
    options: &RetryOptions,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let rate_limited = is_rate_limited(&err);
                let hint = server_hint_ms(&err);

                if rate_limited {
                    if let Some(hint_ms) = hint {
                        if hint_ms > options.max_delay_ms {
                            return Err(RetryError::RateLimited {
                                retry_after: Duration::from_millis(hint_ms),
                                context: context.to_string(),
                            });
                        }
                    }
                }

                if !is_retryable(&err) || attempt >= options.max_attempts {
                    return Err(RetryError::Upstream(err));
                }

                let shift = (attempt - 1).min(20);
                let exponential = options.base_delay_ms.saturating_mul(1u64 << shift);
                let delay_ms = hint.unwrap_or(exponential).min(options.max_delay_ms)
                    + jitter(options.jitter_ms);
                tracing::warn!(
                    context,
                    attempt,
                    delay_ms,
                    error = %err,
                    "retrying after transient upstream error"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryOptions {
        RetryOptions {
            jitter_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let started = tokio::time::Instant::now();

        let result = with_retry(
            move || {
                let calls = calls_in.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(UpstreamError::new("connection reset").with_code("ECONNRESET"))
                    } else {
                        Ok("hello")
                    }
                }
            },
            "test",
            &no_jitter(),
        )
        .await;

        assert_eq!(result.unwrap(), "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms + 1000ms 两次退避
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = with_retry(
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::new("bad request").with_status(400))
                }
            },
            "test",
            &no_jitter(),
        )
        .await;

        assert!(matches!(result, Err(RetryError::Upstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_upstream_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = with_retry(
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::new("server error").with_status(503))
                }
            },
            "test",
            &RetryOptions {
                base_delay_ms: 1,
                jitter_ms: 0,
                ..Default::default()
            },
        )
        .await;

        match result {
            Err(RetryError::Upstream(e)) => assert_eq!(e.status, Some(503)),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_escalates_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        // Retry-After: 30s，远超 max_delay_ms=5000
        let result: Result<(), _> = with_retry(
            move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::new("too many requests")
                        .with_status(429)
                        .with_header("Retry-After", "30"))
                }
            },
            "test",
            &no_jitter(),
        )
        .await;

        match result {
            Err(RetryError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_with_small_hint_retries_with_hint_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let started = tokio::time::Instant::now();

        let result = with_retry(
            move || {
                let calls = calls_in.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        Err(UpstreamError::new("slow down")
                            .with_status(429)
                            .with_header("retry-after", "2"))
                    } else {
                        Ok(n)
                    }
                }
            },
            "test",
            &no_jitter(),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[test]
    fn test_forbidden_with_zero_remaining_is_rate_limited() {
        let err = UpstreamError::new("forbidden")
            .with_status(403)
            .with_header("X-RateLimit-Remaining", "0");
        assert!(is_rate_limited(&err));

        let err = UpstreamError::new("forbidden")
            .with_status(403)
            .with_header("X-RateLimit-Remaining", "7");
        assert!(!is_rate_limited(&err));

        let err = UpstreamError::new("forbidden").with_status(403);
        assert!(!is_rate_limited(&err));
    }

    #[test]
    fn test_server_hint_parses_http_date() {
        let date = (chrono::Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let err = UpstreamError::new("busy")
            .with_status(429)
            .with_header("retry-after", date);
        let hint = server_hint_ms(&err).expect("hint");
        assert!(hint > 28_000 && hint <= 30_000, "hint was {hint}");
    }

    #[test]
    fn test_server_hint_parses_ratelimit_reset_epoch() {
        let reset = chrono::Utc::now().timestamp() + 10;
        let err = UpstreamError::new("busy")
            .with_status(429)
            .with_header("x-ratelimit-reset", reset.to_string());
        let hint = server_hint_ms(&err).expect("hint");
        assert!(hint > 8_000 && hint <= 10_000, "hint was {hint}");
    }

    #[test]
    fn test_unparsable_hint_is_absent() {
        let err = UpstreamError::new("busy")
            .with_status(429)
            .with_header("retry-after", "soon-ish");
        assert_eq!(server_hint_ms(&err), None);
    }

    #[test]
    fn test_header_lookup_case_insensitive_first_wins() {
        let err = UpstreamError::new("x")
            .with_header("Retry-After", "1")
            .with_header("retry-after", "2");
        assert_eq!(err.header("RETRY-AFTER"), Some("1"));
        assert_eq!(err.header("missing"), None);
    }
}
