pub mod client_addr;
pub mod oidc_auth;
pub mod session;

pub use client_addr::BackstopIp;
pub use oidc_auth::{worker_auth_middleware, WorkerAuth};
pub use session::{parse_session_id, SessionId};
