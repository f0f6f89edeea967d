// Kernel - core infrastructure with dependency injection
//
// The kernel holds infrastructure only (clock, stores, blob gateway,
// dispatcher, rate limiter, auth). Business logic belongs in the domain
// layer.

pub mod blob_store;
pub mod clock;
pub mod deps;
pub mod dispatcher;
pub mod oidc;
pub mod pdf;
pub mod rate_limit;
pub mod store;
pub mod stores;
pub mod test_dependencies;
pub mod token_source;

pub use blob_store::{BlobStore, LocalDiskBlobStore, MemoryBlobStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use deps::ServerDeps;
pub use dispatcher::{
    CloudTasksDispatcher, DispatchMode, EmulationDispatcher, TaskDispatcher, TaskHandler,
};
pub use oidc::{GoogleOidcVerifier, OidcClaims, OidcVerifier, StaticVerifier};
pub use pdf::{HeuristicPdfInspector, PdfInspector, StaticPdfInspector};
pub use rate_limit::{LimitAction, RateLimitExceeded, RateLimiter};
pub use store::{JobStore, LimiterStore, VersionedJob, WriteOutcome};
pub use stores::{MemoryJobStore, MemoryLimiterStore, PostgresJobStore, PostgresLimiterStore};
pub use token_source::MetadataTokenSource;
