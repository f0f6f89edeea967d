//! Invoice processing domain: the job aggregate, the lifecycle engine,
//! the orchestration facade, CSV export and retention.

pub mod export;
pub mod job;
pub mod lifecycle;
pub mod orchestration;
pub mod retention;

pub use job::{Job, JobStatus, ProcessingLock};
pub use lifecycle::{EngineSettings, ProcessOutcome, ProcessingEngine};
pub use orchestration::{InvoiceFacade, UploadedFile};
pub use retention::RetentionSweeper;
