//! LLM provider implementations.

mod gemini;
mod openai;

pub use gemini::GeminiExtractor;
pub use openai::OpenAiExtractor;
