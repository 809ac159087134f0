//! 工具箱：注册表、带护栏的执行器与内建工具

pub mod clock;
pub mod executor;
pub mod fetch;
pub mod registry;
pub mod schema;

pub use clock::ClockTool;
pub use executor::{GuardedExecutor, OVERRIDE_DUPLICATE_KEY};
pub use fetch::WebFetchTool;
pub use registry::{Tool, ToolMetadata, ToolRegistry, ToolSummary};
pub use schema::tool_call_schema_json;
