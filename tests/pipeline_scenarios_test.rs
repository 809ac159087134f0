//! 流水线端到端场景测试
//!
//! 用脚本化 LLM 精确驱动执行 / 呈现两阶段，配合计数假工具验证：
//! 查询 + 关闭工单的完整闭环、重复建单拦截、解析失败的修复与兜底、
//! 步数预算耗尽路径与简报指令注入。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use baton::core::CallerContext;
use baton::guard::{GuardConfig, Guardrails};
use baton::handoff::HandoffStatus;
use baton::llm::ScriptedLlmClient;
use baton::memory::Role;
use baton::pipeline::{Pipeline, PipelineRequest};
use baton::tools::{GuardedExecutor, Tool, ToolRegistry};

struct IssueLookupTool;

#[async_trait]
impl Tool for IssueLookupTool {
    fn name(&self) -> &str {
        "tracker_get_issue"
    }
    fn description(&self) -> &str {
        "Fetch an issue from the tracker by id"
    }
    fn integration_id(&self) -> Option<&str> {
        Some("tracker")
    }
    async fn execute(&self, args: Value) -> Result<String, String> {
        let id = args.get("id").and_then(Value::as_str).unwrap_or("?");
        Ok(json!({
            "id": id,
            "state": "resolved",
            "link": format!("https://tracker.example/{id}"),
        })
        .to_string())
    }
}

struct CloseIssueTool {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CloseIssueTool {
    fn name(&self) -> &str {
        "tracker_close_issue"
    }
    fn description(&self) -> &str {
        "Close an issue in the tracker"
    }
    fn integration_id(&self) -> Option<&str> {
        Some("tracker")
    }
    async fn execute(&self, args: Value) -> Result<String, String> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        let id = args.get("id").and_then(Value::as_str).unwrap_or("?");
        Ok(json!({"id": id, "state": "closed"}).to_string())
    }
}

struct CreateIssueTool {
    created: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CreateIssueTool {
    fn name(&self) -> &str {
        "tracker_create_issue"
    }
    fn description(&self) -> &str {
        "Create a new issue in the tracker"
    }
    fn integration_id(&self) -> Option<&str> {
        Some("tracker")
    }
    async fn execute(&self, args: Value) -> Result<String, String> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let title = args.get("title").and_then(Value::as_str).unwrap_or("?");
        Ok(json!({"id": "ENG-999", "title": title}).to_string())
    }
}

struct Harness {
    pipeline: Pipeline,
    llm: Arc<ScriptedLlmClient>,
    closed: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

fn harness(responses: Vec<&str>, max_steps: usize) -> Harness {
    let llm = Arc::new(ScriptedLlmClient::new(responses));
    let closed = Arc::new(AtomicUsize::new(0));
    let created = Arc::new(AtomicUsize::new(0));

    let registry = Arc::new(ToolRegistry::new());
    registry.register_hot(IssueLookupTool);
    registry.register(CloseIssueTool {
        closed: closed.clone(),
    });
    registry.register(CreateIssueTool {
        created: created.clone(),
    });

    let guardrails = Arc::new(Guardrails::new(GuardConfig::default()));
    let executor = Arc::new(GuardedExecutor::new(
        registry.clone(),
        guardrails.clone(),
        5,
    ));
    let pipeline = Pipeline::new(llm.clone(), executor, registry, guardrails, max_steps);

    Harness {
        pipeline,
        llm,
        closed,
        created,
    }
}

fn ctx() -> CallerContext {
    CallerContext::new("user-1").with_workspace("ws-1")
}

const DONE_HANDOFF: &str = "\
EXECUTION_HANDOFF
Status: done
Plan:
- look up ENG-123
- close it if resolved
Actions:
- closed ENG-123 (https://tracker.example/ENG-123)
Data:
- ENG-123 was already resolved
Errors:
- none
Verification:
- re-fetched ENG-123, state is closed
Missing:
- none
Follow-up:
- none
Draft:
- Done. Closed ENG-123.
";

#[tokio::test]
async fn test_lookup_then_close_scenario() {
    let h = harness(
        vec![
            r#"{"tool": "tracker_get_issue", "args": {"id": "ENG-123"}}"#,
            r#"{"tool": "tracker_close_issue", "args": {"id": "ENG-123"}}"#,
            DONE_HANDOFF,
            "Done. Closed [ENG-123](https://tracker.example/ENG-123) - it was already resolved.",
        ],
        8,
    );

    let req = PipelineRequest::new(ctx(), "What's the status of ENG-123 and can you close it if it's done?");
    let outcome = h.pipeline.run(&req).await.unwrap();

    assert!(outcome.reply.starts_with("Done."));
    // Markdown 链接已转为聊天端标记
    assert!(outcome
        .reply
        .contains("<https://tracker.example/ENG-123|ENG-123>"));
    assert_eq!(outcome.handoff.status, HandoffStatus::Done);
    assert_eq!(outcome.handoff.actions.len(), 1);
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    // 执行 3 次 + 呈现 1 次
    assert_eq!(h.llm.calls(), 4);
}

#[tokio::test]
async fn test_duplicate_ticket_creation_is_rejected_on_second_run() {
    let blocked_handoff = "\
EXECUTION_HANDOFF
Status: done
Plan:
- file the bug
Actions:
- none
Data:
- none
Errors:
- duplicate_action: an identical tracker_create_issue call was accepted recently
Verification:
- none
Missing:
- none
Follow-up:
- none
Draft:
- That bug was already filed a moment ago.
";

    let h = harness(
        vec![
            // 第一轮：建单成功
            r#"{"tool": "tracker_create_issue", "args": {"title": "bug X", "project": "ENG"}}"#,
            DONE_HANDOFF,
            "Filed the bug.",
            // 第二轮：同参建单被护栏拦截，交接在 Errors 里反映
            r#"{"tool": "tracker_create_issue", "args": {"project": "ENG", "title": "bug X"}}"#,
            blocked_handoff,
            "That bug was already filed a moment ago.",
        ],
        8,
    );

    let req = PipelineRequest::new(ctx(), "file a bug for X");
    h.pipeline.run(&req).await.unwrap();
    assert_eq!(h.created.load(Ordering::SeqCst), 1);

    let req = PipelineRequest::new(ctx(), "file a bug for X");
    let outcome = h.pipeline.run(&req).await.unwrap();
    // 键序不同但规范化后相同 → 第二次真实执行被拦下
    assert_eq!(h.created.load(Ordering::SeqCst), 1);
    assert!(outcome
        .handoff
        .errors
        .iter()
        .any(|e| e.contains("duplicate_action")));

    // 第二轮执行阶段把护栏负载作为观察写回了对话
    let requests = h.llm.requests();
    let second_run_handoff_request = &requests[4];
    assert!(second_run_handoff_request.iter().any(|m| {
        m.role == Role::User && m.content.contains("duplicate_action")
    }));
}

#[tokio::test]
async fn test_unparseable_output_repaired_then_fallback() {
    let h = harness(
        vec![
            "I looked around but nothing made sense.",
            "still not a handoff, sorry",
            "Understood - I hit a problem and need more direction.",
        ],
        8,
    );

    let req = PipelineRequest::new(ctx(), "do the thing");
    let outcome = h.pipeline.run(&req).await.unwrap();

    // 兜底保证：blocked + 非空 errors/missing + 追问
    assert_eq!(outcome.handoff.status, HandoffStatus::Blocked);
    assert!(!outcome.handoff.errors.is_empty());
    assert_eq!(outcome.handoff.missing, vec!["executor_handoff_format".to_string()]);
    assert!(outcome.handoff.follow_up.is_some());
    assert!(outcome.handoff.errors[0].contains("repair failed"));
    // 原始文本保留用于诊断
    assert!(outcome.handoff.raw.contains("nothing made sense"));
}

#[tokio::test]
async fn test_step_budget_exhaustion_goes_through_repair() {
    let repaired = "\
EXECUTION_HANDOFF
Status: blocked
Plan:
- keep looking
Actions:
- none
Data:
- none
Errors:
- ran out of tool-call budget
Verification:
- none
Missing:
- a narrower search scope
Follow-up:
- Can you narrow down what I should look for?
Draft:
- none
";

    let h = harness(
        vec![
            // 两步预算内全是工具调用，从未产出交接
            r#"{"tool": "tracker_get_issue", "args": {"id": "ENG-1"}}"#,
            r#"{"tool": "tracker_get_issue", "args": {"id": "ENG-2"}}"#,
            // 修复调用把最后一次输出重排成合法交接
            repaired,
            "I ran out of budget - can you narrow the scope?",
        ],
        2,
    );

    let req = PipelineRequest::new(ctx(), "audit every issue");
    let outcome = h.pipeline.run(&req).await.unwrap();

    assert_eq!(outcome.handoff.status, HandoffStatus::Blocked);
    assert!(outcome.handoff.errors[0].contains("budget"));
    assert_eq!(h.llm.calls(), 4);
}

#[tokio::test]
async fn test_concurrent_tool_calls_in_one_step() {
    let h = harness(
        vec![
            r#"[{"tool": "tracker_get_issue", "args": {"id": "ENG-1"}},
                {"tool": "tracker_get_issue", "args": {"id": "ENG-2"}}]"#,
            DONE_HANDOFF,
            "Done. Checked both issues.",
        ],
        8,
    );

    let req = PipelineRequest::new(ctx(), "check ENG-1 and ENG-2");
    let outcome = h.pipeline.run(&req).await.unwrap();
    assert!(outcome.reply.starts_with("Done."));

    // 一步两个调用 → 两对 (assistant, user) 观察消息，顺序与请求一致
    let requests = h.llm.requests();
    let handoff_request = &requests[1];
    let observations: Vec<&String> = handoff_request
        .iter()
        .filter(|m| m.role == Role::User && m.content.starts_with("Observation from"))
        .map(|m| &m.content)
        .collect();
    assert_eq!(observations.len(), 2);
    assert!(observations[0].contains("ENG-1"));
    assert!(observations[1].contains("ENG-2"));
}

#[tokio::test]
async fn test_briefing_request_injects_four_section_layout() {
    let briefing_handoff = "\
EXECUTION_HANDOFF
Status: done
Plan:
- pull the deal record
Actions:
- none
Data:
- Acme deal is in stage 3 (source: crm_get_deal)
Errors:
- none
Verification:
- none
Missing:
- none
Follow-up:
- none
Draft:
- none
";

    let h = harness(
        vec![briefing_handoff, "1. Snapshot\n..."],
        8,
    );

    let req = PipelineRequest::new(ctx(), "tell me about the Acme deal");
    h.pipeline.run(&req).await.unwrap();

    let requests = h.llm.requests();
    let presenter_request = requests.last().unwrap();
    let system = presenter_request
        .iter()
        .find(|m| m.role == Role::System)
        .unwrap();
    assert!(system.content.contains("four sections"));
    assert!(system.content.contains("EXECUTION_HANDOFF"));

    // 非简报问法不注入
    let h = harness(vec![briefing_handoff, "done"], 8);
    let req = PipelineRequest::new(ctx(), "what stage is ENG-123 in?");
    h.pipeline.run(&req).await.unwrap();
    let requests = h.llm.requests();
    let system = requests
        .last()
        .unwrap()
        .iter()
        .find(|m| m.role == Role::System)
        .unwrap()
        .clone();
    assert!(!system.content.contains("four sections"));
}

#[tokio::test]
async fn test_status_updates_emitted_during_tool_use() {
    let h = harness(
        vec![
            r#"{"tool": "tracker_get_issue", "args": {"id": "ENG-123"}}"#,
            DONE_HANDOFF,
            "Done.",
        ],
        8,
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let req = PipelineRequest::new(ctx(), "check ENG-123").with_status_tx(tx);
    h.pipeline.run(&req).await.unwrap();

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    assert!(updates.iter().any(|u| u.contains("tracker_get_issue")));
    assert!(updates.iter().any(|u| u.contains("reply")));
}
