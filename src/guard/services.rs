//! 外部协作方契约：限流 / 审批 / 审计 / 结果监控
//!
//! 这些存储都在核心之外（各自保证并发安全），这里只定义调用契约与默认实现：
//! 限流与审批默认全放行，审计与结果监控默认写入 tracing 结构化日志。
//! 审计失败不得阻塞工具执行，结果监控对流水线而言是 fire-and-forget。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::CallerContext;

/// 限流判定：是否放行，拒绝原因与建议等待时长
#[derive(Debug, Clone, Default)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            retry_after: Some(retry_after),
        }
    }
}

/// 限流器：check 不得有副作用；record 在实际调用发生后记账
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, tool: &str, user_id: &str) -> RateDecision;
    async fn record(&self, tool: &str, user_id: &str);
}

/// 审批门：requires_approval 判定 (工具, 输入) 组合是否需要人工批准；
/// request_approval 创建待审批记录并返回其 id，绝不执行底层工具
#[async_trait]
pub trait ApprovalGates: Send + Sync {
    async fn requires_approval(
        &self,
        tool: &str,
        integration_id: Option<&str>,
        inputs: &Value,
    ) -> bool;

    async fn request_approval(
        &self,
        kind: &str,
        tool: &str,
        integration_id: Option<&str>,
        inputs: &Value,
        ctx: &CallerContext,
    ) -> String;
}

/// 审计日志：每次工具调用先记 call 再记 result，同一调用内不重排
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_tool_call(
        &self,
        ctx: &CallerContext,
        tool: &str,
        integration_id: Option<&str>,
        inputs: &Value,
    );

    async fn log_tool_result(
        &self,
        ctx: &CallerContext,
        tool: &str,
        ok: bool,
        summary: &str,
        duration_ms: u64,
    );
}

/// 结果监控：按 (工具, 集成) 记录成功标志、耗时与分类错误
#[async_trait]
pub trait OutcomeMonitor: Send + Sync {
    async fn record_outcome(
        &self,
        tool: &str,
        integration_id: Option<&str>,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    );
}

/// 默认限流器：全部放行
#[derive(Debug, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(&self, _tool: &str, _user_id: &str) -> RateDecision {
        RateDecision::allow()
    }

    async fn record(&self, _tool: &str, _user_id: &str) {}
}

/// 默认审批门：从不要求审批
#[derive(Debug, Default)]
pub struct NoApprovalGates;

#[async_trait]
impl ApprovalGates for NoApprovalGates {
    async fn requires_approval(
        &self,
        _tool: &str,
        _integration_id: Option<&str>,
        _inputs: &Value,
    ) -> bool {
        false
    }

    async fn request_approval(
        &self,
        _kind: &str,
        _tool: &str,
        _integration_id: Option<&str>,
        _inputs: &Value,
        _ctx: &CallerContext,
    ) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 默认审计：结构化 JSON 写入 tracing
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn log_tool_call(
        &self,
        ctx: &CallerContext,
        tool: &str,
        integration_id: Option<&str>,
        inputs: &Value,
    ) {
        let audit = serde_json::json!({
            "event": "tool_call",
            "tool": tool,
            "integration": integration_id,
            "user": ctx.user_id,
            "workspace": ctx.workspace_id,
            "args_preview": args_preview(inputs),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }

    async fn log_tool_result(
        &self,
        ctx: &CallerContext,
        tool: &str,
        ok: bool,
        summary: &str,
        duration_ms: u64,
    ) {
        let audit = serde_json::json!({
            "event": "tool_result",
            "tool": tool,
            "user": ctx.user_id,
            "ok": ok,
            "outcome": summary,
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }
}

/// 默认结果监控：写入 tracing
#[derive(Debug, Default)]
pub struct TracingOutcomeMonitor;

#[async_trait]
impl OutcomeMonitor for TracingOutcomeMonitor {
    async fn record_outcome(
        &self,
        tool: &str,
        integration_id: Option<&str>,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let event = serde_json::json!({
            "event": "tool_outcome",
            "tool": tool,
            "integration": integration_id,
            "success": success,
            "duration_ms": duration_ms,
            "error": error,
        });
        tracing::info!(outcome = %event.to_string(), "tool");
    }
}
