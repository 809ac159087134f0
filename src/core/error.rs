//! 流水线错误类型
//!
//! 护栏拒绝（白名单 / 去重 / 限流 / 审批）不走这里：它们以结构化 JSON 负载返回给
//! 推理阶段，永远不会作为异常抛出。只有真正的工具执行失败与 LLM 调用失败才成为错误。

use thiserror::Error;

use crate::llm::LlmError;

/// 流水线运行过程中可能出现的错误（LLM、工具执行、取消）；交接解析失败不在此列：
/// 修复与兜底保证它永远不会以异常形态离开流水线
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Cancelled")]
    Cancelled,
}
