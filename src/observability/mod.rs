//! 可观测性
//!
//! tracing 初始化与交接质量遥测：每次请求无论成败都记录一条 handoff_quality 事件
//! （是否解析成功、是否经过修复、状态、缺失字段、错误数）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 交接质量遥测（结构化 JSON，一次请求一条）
pub fn record_handoff_quality(
    parsed: bool,
    repaired: bool,
    status: &str,
    missing_fields: &[String],
    error_count: usize,
) {
    let event = serde_json::json!({
        "event": "handoff_quality",
        "parsed": parsed,
        "repaired": repaired,
        "status": status,
        "missing_fields": missing_fields,
        "errors": error_count,
    });
    tracing::info!(quality = %event.to_string(), "handoff");
}
