mod chat;
mod generate;

pub use chat::OllamaChatInterceptor;
pub use generate::OllamaGenerateInterceptor;
