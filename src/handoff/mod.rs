//! 执行交接协议
//!
//! 执行阶段结束时必须输出一份固定分区的纯文本文档（EXECUTION_HANDOFF），描述状态、
//! 计划、已做动作、收集到的数据、错误、校验、缺失信息、追问与草稿回复。parse 负责
//! 把模型输出还原为结构化 ExecutionHandoff，write 负责反向序列化（两阶段之间的唯一
//! 数据契约），fallback_handoff 在解析与修复都失败时兜底，保证呈现阶段永远拿到一份
//! 结构合法的交接。

pub mod parse;
pub mod write;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use parse::{parse_handoff, ParseReport};
pub use write::serialize_handoff;

/// 交接文档头部行（大小写不敏感，允许首尾空白）
pub const HANDOFF_HEADER: &str = "EXECUTION_HANDOFF";

/// 解析 / 修复都失败时写入 missing 的标记
pub const MISSING_FORMAT_MARKER: &str = "executor_handoff_format";

/// 执行阶段状态：驱动呈现阶段的指令选择；缺失或不可解析时一律按 blocked 处理
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Done,
    NeedsInfo,
    #[default]
    Blocked,
    Planning,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Done => "done",
            HandoffStatus::NeedsInfo => "needs_info",
            HandoffStatus::Blocked => "blocked",
            HandoffStatus::Planning => "planning",
        }
    }

    /// 从线上取值解析；大小写不敏感，不认识的值返回 None（由调用方记错误）
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "done" => Some(HandoffStatus::Done),
            "needs_info" => Some(HandoffStatus::NeedsInfo),
            "blocked" => Some(HandoffStatus::Blocked),
            "planning" => Some(HandoffStatus::Planning),
            _ => None,
        }
    }
}

/// 结构化交接文档：每次请求由编解码器新建，呈现阶段消费一次后丢弃，从不持久化
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionHandoff {
    pub status: HandoffStatus,
    pub plan: Vec<String>,
    pub actions: Vec<String>,
    pub data: Vec<String>,
    pub errors: Vec<String>,
    pub verification: Vec<String>,
    pub missing: Vec<String>,
    pub follow_up: Option<String>,
    pub draft: Option<String>,
    /// 原始未解析文本，仅用于诊断
    #[serde(skip)]
    #[schemars(skip)]
    pub raw: String,
}

/// 确定性兜底交接：解析与修复都失败时使用，保证呈现阶段输入永远结构合法
pub fn fallback_handoff(cause: &str) -> ExecutionHandoff {
    ExecutionHandoff {
        status: HandoffStatus::Blocked,
        errors: vec![format!(
            "executor did not produce a readable handoff: {cause}"
        )],
        missing: vec![MISSING_FORMAT_MARKER.to_string()],
        follow_up: Some(
            "I wasn't able to finish summarizing my work. Could you confirm what you need?"
                .to_string(),
        ),
        ..Default::default()
    }
}
