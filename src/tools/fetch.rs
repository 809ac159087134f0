//! web_fetch 工具：域名白名单、超时、结果大小限制
//!
//! 仅允许配置中的域名；GET 请求带超时与 User-Agent；响应超过 max_result_chars 时截断并
//! 追加 ...[truncated]。出站请求统一走 retry 引擎：非 2xx 响应连同响应头交给重试分类，
//! 上游限流会以终态限流错误的形式反馈给模型。

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::retry::{with_retry, RetryError, RetryOptions, UpstreamError};
use crate::tools::Tool;

/// 从 URL 中提取 host（不含端口与路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = url.split('/').next()?;
    let host = host.split(':').next()?;
    Some(host.to_lowercase())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...[truncated]")
}

/// web_fetch 工具：抓取 URL 内容，仅允许白名单域名；超时、大小与重试策略由配置决定
pub struct WebFetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
    retry: RetryOptions,
}

impl WebFetchTool {
    pub fn new(
        allowed_domains: Vec<String>,
        timeout_secs: u64,
        max_result_chars: usize,
        retry: RetryOptions,
    ) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent("baton/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains,
            max_result_chars,
            retry,
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        if self.allowed_domains.contains(&domain) {
            return Ok(());
        }
        Err(format!("Domain not in allowlist: {domain}"))
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        self.is_allowed(url)?;

        let client = self.client.clone();
        let target = url.to_string();
        let result = with_retry(
            move || {
                let client = client.clone();
                let target = target.clone();
                async move {
                    let resp = client.get(&target).send().await.map_err(|e| {
                        let mut err = UpstreamError::new(format!("request failed: {e}"));
                        if e.is_timeout() {
                            err = err.with_code("ETIMEDOUT");
                        } else if e.is_connect() {
                            err = err.with_code("ECONNRESET");
                        }
                        err
                    })?;
                    let status = resp.status();
                    if !status.is_success() {
                        let mut err = UpstreamError::new(format!("HTTP {status}"))
                            .with_status(status.as_u16());
                        for (name, value) in resp.headers() {
                            if let Ok(v) = value.to_str() {
                                err = err.with_header(name.as_str(), v);
                            }
                        }
                        return Err(err);
                    }
                    resp.text()
                        .await
                        .map_err(|e| UpstreamError::new(format!("read failed: {e}")))
                }
            },
            "web_fetch",
            &self.retry,
        )
        .await;

        match result {
            Ok(body) => Ok(truncate_chars(&body, self.max_result_chars)),
            Err(RetryError::RateLimited { retry_after, .. }) => Err(format!(
                "rate limited by upstream, retry after {}s",
                retry_after.as_secs()
            )),
            Err(RetryError::Upstream(e)) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch the contents of an allow-listed URL (GET). Args: {\"url\": \"https://...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Absolute http(s) URL" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing 'url' argument".to_string())?;
        self.fetch(url).await
    }
}
