mod chat;
mod sse;

pub use chat::OpenAiChatInterceptor;
