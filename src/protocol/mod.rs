pub mod chat;

pub use chat::{ChatMessage, ChatRequest, ChatRole, UpstreamChatRequest};
