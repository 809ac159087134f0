//! Baton - 入口：初始化日志、组装流水线，运行行式 REPL 聊天适配器
//!
//! 聊天端是流水线的外部协作方，这里只做最薄的一层：读入一行用户输入，跑一次
//! 流水线，打印进度与最终回复。生产形态的渠道适配（Slack 等）替换这一层即可。

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use baton::config::{load_config, AppConfig};
use baton::core::CallerContext;
use baton::guard::Guardrails;
use baton::llm::create_llm_from_config;
use baton::memory::{ConversationMemory, Message};
use baton::pipeline::{Pipeline, PipelineRequest};
use baton::tools::{ClockTool, GuardedExecutor, ToolRegistry, WebFetchTool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    baton::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        AppConfig::default()
    });

    let llm = create_llm_from_config(&cfg);

    let registry = Arc::new(ToolRegistry::new());
    registry.register_hot(ClockTool);
    registry.register_hot(WebFetchTool::new(
        cfg.tools.fetch.allowed_domains.clone(),
        cfg.tools.fetch.timeout_secs,
        cfg.tools.fetch.max_result_chars,
        cfg.retry.options(),
    ));

    let guardrails = Arc::new(Guardrails::new(cfg.guardrails.guard_config()));
    let executor = Arc::new(GuardedExecutor::new(
        registry.clone(),
        guardrails.clone(),
        cfg.pipeline.tool_timeout_secs,
    ));
    let pipeline = Pipeline::new(
        llm,
        executor,
        registry,
        guardrails,
        cfg.pipeline.max_steps,
    );

    let ctx = CallerContext::new("local").with_session(uuid::Uuid::new_v4().to_string());
    let mut history = ConversationMemory::new(cfg.app.max_context_turns);

    println!(
        "{} ready. Type a message, or 'quit' to exit.",
        cfg.app.name.as_deref().unwrap_or("baton")
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        let Some(line) = lines.next_line().await.context("stdin read failed")? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        // 工具执行期间的进度文案异步打印
        let (status_tx, mut status_rx) = mpsc::unbounded_channel::<String>();
        let printer = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                println!("  [{status}]");
            }
        });

        let request = PipelineRequest::new(ctx.clone(), input)
            .with_history(history.messages().to_vec())
            .with_status_tx(status_tx);

        match pipeline.run(&request).await {
            Ok(outcome) => {
                println!("baton> {}", outcome.reply);
                history.push(Message::user(input));
                history.push(Message::assistant(outcome.reply));
            }
            Err(e) => {
                // 流水线自身抛错时由调用方兜底一句话（呈现阶段产物之外的保底）
                tracing::error!(error = %e, "pipeline failed");
                println!("baton> Sorry, something went wrong while handling that.");
            }
        }
        let _ = printer.await;
    }

    Ok(())
}
