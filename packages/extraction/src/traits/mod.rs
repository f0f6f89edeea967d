//! Core trait abstractions for the extraction library.
//!
//! These traits define the interfaces that applications implement
//! to provide OCR, LLM, and token-acquisition capabilities.

pub mod auth;
pub mod llm;
pub mod ocr;

pub use auth::TokenSource;
pub use llm::InvoiceLlm;
pub use ocr::OcrProvider;
