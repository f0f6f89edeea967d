//! OCR provider implementations.

mod vision;

pub use vision::{shard_text, VisionOcr};
