//! Mock LLM 客户端（用于测试与本地演示，无需 API）
//!
//! MockLlmClient 按所处阶段回放固定输出：执行阶段回一份合法交接文档（回显用户输入），
//! 呈现阶段回一句简单答复，便于本地跑通两阶段流水线。
//! ScriptedLlmClient 按脚本顺序逐次吐出预设回复，供集成测试精确驱动每一步。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::Stream;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：执行阶段回显用户输入为合法交接文档，呈现阶段回固定答复
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        // 呈现阶段的 system 消息里带有序列化后的交接文档
        let presenting = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("EXECUTION_HANDOFF"));

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        if presenting {
            return Ok(format!("Done. Echo from Mock: {last_user}"));
        }

        Ok(format!(
            "EXECUTION_HANDOFF\n\
             Status: done\n\
             Plan:\n- reply to the user\n\
             Actions:\n- none\n\
             Data:\n- user said: {last_user}\n\
             Errors:\n- none\n\
             Verification:\n- not run (mock backend)\n\
             Missing:\n- none\n\
             Follow-up:\n- none\n\
             Draft:\n- Echo from Mock: {last_user}\n"
        ))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

/// 脚本化客户端：按入队顺序逐次返回预设回复，并记录每次收到的消息，供测试断言
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("script lock poisoned")
            .push_back(response.into());
    }

    /// 已收到的所有请求（每次 complete 的完整消息列表）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("script lock poisoned").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("script lock poisoned").len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.requests
            .lock()
            .expect("script lock poisoned")
            .push(messages.to_vec());
        self.responses
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .ok_or_else(|| LlmError::ApiError("script exhausted".to_string()))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::parse_handoff;

    #[tokio::test]
    async fn test_mock_executor_output_is_a_valid_handoff() {
        let out = MockLlmClient
            .complete(&[Message::user("ping")])
            .await
            .unwrap();
        let report = parse_handoff(&out);
        assert!(report.ok, "errors: {:?}", report.errors);
        assert!(report.handoff.data[0].contains("ping"));
    }

    #[tokio::test]
    async fn test_scripted_client_plays_in_order_then_errors() {
        let llm = ScriptedLlmClient::new(vec!["one", "two"]);
        assert_eq!(llm.complete(&[]).await.unwrap(), "one");
        assert_eq!(llm.complete(&[]).await.unwrap(), "two");
        assert!(llm.complete(&[]).await.is_err());
        assert_eq!(llm.calls(), 3);
    }
}
