//! 带护栏的工具执行器
//!
//! 对每个工具的每次调用施加完整拦截链：
//! 白名单 → 重复动作（变更类工具，支持 override 旁路）→ 限流（拒绝会被审计）→
//! 审批门（只建待审批记录，绝不执行底层操作）→ 审计调用 → 计时执行（带超时）→
//! 审计结果 → 使用统计（热工具晋升）→ 结果监控 → 限流记账。
//!
//! 护栏拒绝以结构化 JSON（error / errorType / hint）作为 Ok 值返回，让模型能在带内
//! 自行纠正；只有底层工具的真实失败与超时在遥测落盘后以 Err 透出。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{CallerContext, PipelineError};
use crate::guard::{
    ApprovalGates, AuditLog, Guardrails, NoApprovalGates, NoopRateLimiter, OutcomeMonitor,
    RateLimiter, TracingAuditLog, TracingOutcomeMonitor,
};
use crate::tools::ToolRegistry;

/// 工具输入中旁路重复动作检查的标志键
pub const OVERRIDE_DUPLICATE_KEY: &str = "override_duplicate_check";

/// 带护栏的执行器：注册表 + 护栏 + 外部协作方 + 单次调用超时
pub struct GuardedExecutor {
    registry: Arc<ToolRegistry>,
    guardrails: Arc<Guardrails>,
    rate_limiter: Arc<dyn RateLimiter>,
    approvals: Arc<dyn ApprovalGates>,
    audit: Arc<dyn AuditLog>,
    outcomes: Arc<dyn OutcomeMonitor>,
    timeout: Duration,
}

impl GuardedExecutor {
    /// 创建执行器；协作方默认取放行 / tracing 实现，可用 with_* 替换
    pub fn new(registry: Arc<ToolRegistry>, guardrails: Arc<Guardrails>, timeout_secs: u64) -> Self {
        Self {
            registry,
            guardrails,
            rate_limiter: Arc::new(NoopRateLimiter),
            approvals: Arc::new(NoApprovalGates),
            audit: Arc::new(TracingAuditLog),
            outcomes: Arc::new(TracingOutcomeMonitor),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGates>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_outcomes(mut self, outcomes: Arc<dyn OutcomeMonitor>) -> Self {
        self.outcomes = outcomes;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn guardrails(&self) -> &Arc<Guardrails> {
        &self.guardrails
    }

    /// 构造护栏拒绝负载：error 恒为 true，errorType 机器可读，hint 供模型自行纠正
    pub fn guard_error(error_type: &str, hint: impl Into<String>) -> String {
        serde_json::json!({
            "error": true,
            "errorType": error_type,
            "hint": hint.into(),
        })
        .to_string()
    }

    /// 执行一次工具调用（完整拦截链）
    pub async fn execute(
        &self,
        ctx: &CallerContext,
        tool_name: &str,
        args: Value,
    ) -> Result<String, PipelineError> {
        let workspace = ctx.workspace_id.as_deref();

        let Some(tool) = self.registry.get(tool_name) else {
            return Ok(Self::guard_error(
                "unknown_tool",
                format!("tool '{tool_name}' is not registered; use search_tools to discover available tools"),
            ));
        };
        let integration = tool.integration_id().map(str::to_string);

        // 1. 白名单
        let decision = self
            .guardrails
            .is_tool_allowed(workspace, tool_name, integration.as_deref());
        if !decision.allowed {
            return Ok(Self::guard_error(
                "not_allowed",
                decision
                    .reason
                    .unwrap_or_else(|| format!("tool '{tool_name}' is not allowed")),
            ));
        }

        // 2. 重复动作（仅变更类工具；调用方可显式旁路）
        if self.guardrails.should_dedupe(tool_name) {
            let forced = args
                .get(OVERRIDE_DUPLICATE_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !forced && self.guardrails.is_duplicate(workspace, tool_name, &args) {
                return Ok(Self::guard_error(
                    "duplicate_action",
                    format!(
                        "an identical {tool_name} call was accepted recently; \
                         pass \"{OVERRIDE_DUPLICATE_KEY}\": true to run it anyway"
                    ),
                ));
            }
        }

        // 3. 限流；拒绝也要留审计痕迹
        let rate = self.rate_limiter.check(tool_name, &ctx.user_id).await;
        if !rate.allowed {
            let retry_secs = rate.retry_after.map(|d| d.as_secs()).unwrap_or(60);
            self.audit
                .log_tool_result(ctx, tool_name, false, "rate_limited", 0)
                .await;
            let reason = rate
                .reason
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            return Ok(Self::guard_error(
                "rate_limited",
                format!("rate limit exceeded{reason}; retry after {retry_secs}s"),
            ));
        }

        // 4. 审批门：创建待审批记录后直接拒绝，不执行底层操作
        if self
            .approvals
            .requires_approval(tool_name, integration.as_deref(), &args)
            .await
        {
            let approval_id = self
                .approvals
                .request_approval("tool_call", tool_name, integration.as_deref(), &args, ctx)
                .await;
            return Ok(Self::guard_error(
                "approval_required",
                format!(
                    "this action requires human approval; a pending approval was created (id {approval_id})"
                ),
            ));
        }

        // 5. 审计 → 计时执行 → 审计结果与遥测；工具异常在遥测之后才透出
        self.audit
            .log_tool_call(ctx, tool_name, integration.as_deref(), &args)
            .await;
        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(args)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, summary) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        self.audit
            .log_tool_result(ctx, tool_name, ok, summary, duration_ms)
            .await;
        self.registry.record_usage(tool_name);
        let error_text = match &result {
            Ok(Err(e)) => Some(e.clone()),
            Err(_) => Some(format!("timeout after {:?}", self.timeout)),
            _ => None,
        };
        self.outcomes
            .record_outcome(
                tool_name,
                integration.as_deref(),
                ok,
                duration_ms,
                error_text.as_deref(),
            )
            .await;
        self.rate_limiter.record(tool_name, &ctx.user_id).await;

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(PipelineError::ToolExecutionFailed(format!(
                "{tool_name}: {e}"
            ))),
            Err(_) => Err(PipelineError::ToolTimeout(tool_name.to_string())),
        }
    }
}
