//! Shared types for the extraction library.

pub mod invoice;
pub mod ocr;

pub use invoice::{InvoiceRecord, LineItem};
pub use ocr::{OcrOperation, OcrPoll, OcrText};
