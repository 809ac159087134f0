//! 核心类型：错误与调用方上下文

pub mod error;

pub use error::PipelineError;

/// 调用方上下文：用户 / 工作区 / 渠道 / 会话标识，随每次工具调用解析并贯穿审计链
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub channel_id: Option<String>,
    pub session_id: Option<String>,
}

impl CallerContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
