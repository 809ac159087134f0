//! 会话记忆：消息类型与有界对话历史

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};
