//! 编排流水线
//!
//! 两阶段主循环：执行阶段带工具与步数预算跑推理，产出交接文档；解析失败先做一次
//! 无工具的修复重试，仍失败则落到确定性兜底交接；随后由交接状态派生呈现指令，
//! 跑无工具的呈现阶段得到最终回复。两个阶段严格串行（交接定稿前呈现不启动），
//! 同一步内模型请求的多个工具调用并发执行。
//!
//! 状态机：Executing → {ParsedOK | ParseFailed → Repairing → {RepairedOK |
//! RepairFailed(fallback)}} → Presenting → Done。

pub mod directive;
pub mod markup;

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub use directive::{looks_like_briefing, presenter_directive, PRESENTER_PROMPT};
pub use markup::render_chat_markup;

use crate::core::{CallerContext, PipelineError};
use crate::guard::Guardrails;
use crate::handoff::{
    fallback_handoff, parse_handoff, serialize_handoff, ExecutionHandoff, HANDOFF_HEADER,
};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::observability;
use crate::tools::{tool_call_schema_json, GuardedExecutor, ToolRegistry};

/// 执行阶段系统提示词：工具调用协议 + 交接文档契约
const EXECUTOR_PROMPT: &str = "\
You are the execution phase of a two-phase assistant: use tools to gather \
information and take the actions the user asked for. You never talk to the user \
directly.

On each turn output exactly one of the following, and nothing else:
1. A tool call: a single JSON object {\"tool\": \"<name>\", \"args\": {...}}, or a \
JSON array of such objects to run several tools at once.
2. The final execution handoff document, plain text:

EXECUTION_HANDOFF
Status: done | needs_info | blocked | planning
Plan:
- <short step>
Actions:
- <action taken, with links or ids>
Data:
- <fact gathered, with its source>
Errors:
- <error encountered>
Verification:
- <check performed, or an explicit \"not run\" notice>
Missing:
- <information you still need>
Follow-up:
- <one question to ask the user>
Draft:
- <optional draft reply>

Every section must appear; write \"- none\" under a section that has nothing. \
Only report real tool results - never invent data. If a tool returns a JSON \
error payload, read its hint and adjust.";

/// 修复提示词：对失格输出做一次无工具的重排
const REPAIR_PROMPT: &str = "\
Your previous output was not a valid execution handoff. Reformat it as a \
plain-text EXECUTION_HANDOFF document with the sections Status, Plan, Actions, \
Data, Errors, Verification, Missing, Follow-up and Draft, using \"- item\" \
bullets and \"- none\" for empty sections. Do not call any tools. Output only \
the handoff document.";

/// 模型请求的单个工具调用（简化 JSON：{"tool": "x", "args": {...}}）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 执行阶段单步输出：一批工具调用，或最终文本（交接文档候选）
#[derive(Debug)]
pub enum ExecutorStep {
    ToolCalls(Vec<ToolCall>),
    Final(String),
}

/// 解析执行阶段单步输出。
///
/// 含交接头部的输出一律视为最终文本；否则尝试提取 JSON（```json 围栏或首个
/// 括号块），对象 / 对象数组解析为工具调用；都不成立时当作最终文本（后续走
/// 解析-修复-兜底路径）。
pub fn parse_executor_output(output: &str) -> ExecutorStep {
    let trimmed = output.trim();
    if trimmed.to_uppercase().contains(HANDOFF_HEADER) {
        return ExecutorStep::Final(trimmed.to_string());
    }

    let candidate: Option<&str> = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        Some(match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        })
    } else {
        let first_obj = trimmed.find('{');
        let first_arr = trimmed.find('[');
        match (first_obj, first_arr) {
            (Some(o), Some(a)) if a < o => trimmed
                .rfind(']')
                .filter(|end| *end > a)
                .map(|end| &trimmed[a..=end]),
            (Some(o), _) => trimmed
                .rfind('}')
                .filter(|end| *end > o)
                .map(|end| &trimmed[o..=end]),
            (None, Some(a)) => trimmed
                .rfind(']')
                .filter(|end| *end > a)
                .map(|end| &trimmed[a..=end]),
            (None, None) => None,
        }
    };

    let Some(json_str) = candidate else {
        return ExecutorStep::Final(trimmed.to_string());
    };

    let calls: Vec<ToolCall> = if json_str.trim_start().starts_with('[') {
        match serde_json::from_str::<Vec<ToolCall>>(json_str) {
            Ok(calls) => calls,
            Err(_) => return ExecutorStep::Final(trimmed.to_string()),
        }
    } else {
        match serde_json::from_str::<ToolCall>(json_str) {
            Ok(call) => vec![call],
            Err(_) => return ExecutorStep::Final(trimmed.to_string()),
        }
    };

    let calls: Vec<ToolCall> = calls.into_iter().filter(|c| !c.tool.is_empty()).collect();
    if calls.is_empty() {
        ExecutorStep::Final(trimmed.to_string())
    } else {
        ExecutorStep::ToolCalls(calls)
    }
}

/// 单次请求的输入：调用方上下文、用户输入、既有对话、可选进度回调与取消令牌
pub struct PipelineRequest {
    pub ctx: CallerContext,
    pub user_input: String,
    pub history: Vec<Message>,
    pub status_tx: Option<UnboundedSender<String>>,
    pub cancel_token: CancellationToken,
}

impl PipelineRequest {
    pub fn new(ctx: CallerContext, user_input: impl Into<String>) -> Self {
        Self {
            ctx,
            user_input: user_input.into(),
            history: Vec::new(),
            status_tx: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// 工具执行期间通过该通道推送简短进度文案（聊天端的 status 回调）
    pub fn with_status_tx(mut self, tx: UnboundedSender<String>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }
}

/// 单次请求的产出：最终回复文本与（诊断用的）定稿交接
#[derive(Debug)]
pub struct PipelineOutcome {
    pub reply: String,
    pub handoff: ExecutionHandoff,
}

fn send_status(tx: &Option<UnboundedSender<String>>, text: impl Into<String>) {
    if let Some(t) = tx {
        let _ = t.send(text.into());
    }
}

/// 编排流水线：持有 LLM、带护栏的执行器、注册表与护栏配置
pub struct Pipeline {
    llm: Arc<dyn LlmClient>,
    executor: Arc<GuardedExecutor>,
    registry: Arc<ToolRegistry>,
    guardrails: Arc<Guardrails>,
    max_steps: usize,
}

impl Pipeline {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<GuardedExecutor>,
        registry: Arc<ToolRegistry>,
        guardrails: Arc<Guardrails>,
        max_steps: usize,
    ) -> Self {
        Self {
            llm,
            executor,
            registry,
            guardrails,
            max_steps: max_steps.max(1),
        }
    }

    /// 处理单条用户输入：执行阶段 → 交接 → 呈现阶段 → 标记转换后的最终文本
    pub async fn run(&self, req: &PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
        let handoff = self.executor_phase(req).await?;

        send_status(&req.status_tx, "Writing the reply...");
        let directive = presenter_directive(&handoff, &req.user_input);
        let serialized = serialize_handoff(&handoff);
        let mut messages = vec![Message::system(format!(
            "{PRESENTER_PROMPT}\n\nExecution handoff:\n{serialized}\nInstructions:\n{directive}"
        ))];
        messages.extend(req.history.iter().cloned());
        messages.push(Message::user(req.user_input.clone()));

        let reply = self.llm.complete(&messages).await?;
        Ok(PipelineOutcome {
            reply: render_chat_markup(&reply),
            handoff,
        })
    }

    /// 执行阶段：带工具与步数预算的推理循环，结束后走解析 / 修复 / 兜底
    async fn executor_phase(&self, req: &PipelineRequest) -> Result<ExecutionHandoff, PipelineError> {
        let system = self.executor_system_prompt(req);
        let mut messages = vec![Message::system(system)];
        messages.extend(req.history.iter().cloned());
        messages.push(Message::user(req.user_input.clone()));

        let mut last_output = String::new();
        let mut final_text: Option<String> = None;

        for step in 0..self.max_steps {
            if req.cancel_token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let output = self.llm.complete(&messages).await?;
            last_output = output.clone();

            match parse_executor_output(&output) {
                ExecutorStep::Final(text) => {
                    final_text = Some(text);
                    break;
                }
                ExecutorStep::ToolCalls(calls) => {
                    let names: Vec<&str> = calls.iter().map(|c| c.tool.as_str()).collect();
                    send_status(&req.status_tx, format!("Running {}...", names.join(", ")));
                    tracing::debug!(step, tools = ?names, "executor requested tools");

                    // 同一步内请求的多个工具并发执行；观察结果按请求顺序写回
                    let observations =
                        join_all(calls.iter().map(|call| self.dispatch(&req.ctx, call))).await;
                    for (call, observation) in calls.iter().zip(observations) {
                        messages.push(Message::assistant(format!(
                            "Tool call: {} | Result: {}",
                            call.tool, observation
                        )));
                        messages.push(Message::user(format!(
                            "Observation from {}: {}",
                            call.tool, observation
                        )));
                    }
                }
            }
        }

        // 步数预算耗尽：最后一次输出照常走解析 / 修复（大概率落到 blocked / 兜底）
        let raw = final_text.unwrap_or(last_output);
        Ok(self.parse_with_repair(&raw).await)
    }

    /// 分发一次工具调用：注册表元工具（检索 / 执行）在此展开，其余直接走护栏执行器
    async fn dispatch(&self, ctx: &CallerContext, call: &ToolCall) -> String {
        match call.tool.as_str() {
            "search_tools" => self.run_search_tools(&call.args),
            "execute_tool" => {
                let Some(inner) = call.args.get("name").and_then(Value::as_str) else {
                    return GuardedExecutor::guard_error(
                        "invalid_arguments",
                        "execute_tool requires a 'name' argument",
                    );
                };
                if inner == "execute_tool" || inner == "search_tools" {
                    return GuardedExecutor::guard_error(
                        "invalid_arguments",
                        "execute_tool cannot invoke the registry meta-tools",
                    );
                }
                let inner_args = call
                    .args
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                self.observation(ctx, inner, inner_args).await
            }
            _ => self.observation(ctx, &call.tool, call.args.clone()).await,
        }
    }

    /// 执行并把结果转成观察文本；真实失败（已完成遥测）以 Error: 前缀回写给模型
    async fn observation(&self, ctx: &CallerContext, name: &str, args: Value) -> String {
        match self.executor.execute(ctx, name, args).await {
            Ok(content) => content,
            Err(e) => format!("Error: {e}"),
        }
    }

    fn run_search_tools(&self, args: &Value) -> String {
        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .min(20) as usize;
        let results = self.registry.search(query, limit);
        serde_json::to_string(&results).unwrap_or_else(|_| "[]".to_string())
    }

    /// 解析交接；失败则做一次无工具修复；仍失败落到兜底。每条路径都记录交接质量遥测
    async fn parse_with_repair(&self, raw: &str) -> ExecutionHandoff {
        let report = parse_handoff(raw);
        if report.ok {
            observability::record_handoff_quality(
                true,
                false,
                report.handoff.status.as_str(),
                &report.missing_fields,
                report.errors.len(),
            );
            return report.handoff;
        }

        let first_reason = report.failure_summary();
        tracing::warn!(reason = %first_reason, "executor handoff failed to parse, attempting one repair");

        let repair_messages = vec![
            Message::system(REPAIR_PROMPT.to_string()),
            Message::user(format!("Previous output:\n\n{raw}")),
        ];
        let cause = match self.llm.complete(&repair_messages).await {
            Ok(repaired) => {
                let second = parse_handoff(&repaired);
                if second.ok {
                    observability::record_handoff_quality(
                        true,
                        true,
                        second.handoff.status.as_str(),
                        &second.missing_fields,
                        second.errors.len(),
                    );
                    return second.handoff;
                }
                format!("{first_reason}; repair failed: {}", second.failure_summary())
            }
            Err(e) => format!("{first_reason}; repair call failed: {e}"),
        };

        let mut fallback = fallback_handoff(&cause);
        fallback.raw = raw.to_string();
        observability::record_handoff_quality(
            false,
            true,
            fallback.status.as_str(),
            &fallback.missing,
            fallback.errors.len(),
        );
        fallback
    }

    /// 执行阶段系统提示词：基础协议 + 工具调用 schema + 热工具清单 + 注册表元工具 +
    /// 工作区白名单摘要与工具提示
    fn executor_system_prompt(&self, req: &PipelineRequest) -> String {
        let workspace = req.ctx.workspace_id.as_deref();

        let mut catalog = String::new();
        for tool in self.registry.hot_tools() {
            catalog.push_str(&format!(
                "- {}: {}\n  args schema: {}\n",
                tool.name(),
                tool.description(),
                tool.parameters_schema()
            ));
        }
        catalog.push_str(
            "- search_tools: Search the tool registry by keyword. \
             Args: {\"query\": \"...\", \"limit\": 5}\n",
        );
        catalog.push_str(
            "- execute_tool: Execute any registered tool by name. \
             Args: {\"name\": \"...\", \"args\": {...}}\n",
        );

        let mut prompt = format!(
            "{EXECUTOR_PROMPT}\n\nTool call format (JSON Schema):\n{}\n\nAvailable tools:\n{catalog}\nWorkspace policy: {}.",
            tool_call_schema_json(),
            self.guardrails.allowlist_summary(workspace)
        );
        if let Some(hints) = self.guardrails.hint_for(workspace) {
            prompt.push_str("\nWorkspace tool hints:\n");
            prompt.push_str(hints);
        }
        prompt
    }
}
