//! current_time 工具：返回当前时间（永远放行的基础工具）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 时钟工具：无参数，返回 UTC 时间（RFC 3339）与 Unix 时间戳
#[derive(Debug, Default)]
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time (UTC, RFC 3339) plus the Unix timestamp"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let now = chrono::Utc::now();
        let payload = serde_json::json!({
            "utc": now.to_rfc3339(),
            "unix": now.timestamp(),
        });
        Ok(payload.to_string())
    }
}
