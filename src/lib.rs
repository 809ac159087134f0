//! Baton - Rust 对话智能体编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 流水线错误与调用方上下文
//! - **guard**: 工具护栏（白名单 / 重复动作 / 限流与审批契约）
//! - **handoff**: 执行交接协议（解析 / 序列化 / 修复兜底）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话历史
//! - **observability**: tracing 初始化与交接质量遥测
//! - **pipeline**: 执行 / 呈现两阶段编排主循环
//! - **retry**: 出站调用统一指数退避重试
//! - **tools**: 工具注册表与带护栏的执行器

pub mod config;
pub mod core;
pub mod guard;
pub mod handoff;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod tools;
