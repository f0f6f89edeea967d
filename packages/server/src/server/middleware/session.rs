//! `X-Session-Id` extraction.
//!
//! Sessions are opaque client-supplied identifiers; the only requirement
//! is the UUIDv4 shape. Every non-worker route extracts this.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::common::ApiError;

pub const SESSION_HEADER: &str = "x-session-id";

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$",
        )
        .expect("static pattern")
    })
}

/// Validate a raw session id against the UUIDv4 shape.
pub fn parse_session_id(raw: &str) -> Option<Uuid> {
    if !session_id_pattern().is_match(raw) {
        return None;
    }
    Uuid::parse_str(raw).ok()
}

/// Extractor for the session header.
#[derive(Debug, Clone, Copy)]
pub struct SessionId(pub Uuid);

#[axum::async_trait]
impl<S> FromRequestParts<S> for SessionId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest {
                code: "missingSession",
                detail: "X-Session-Id header is required".to_string(),
            })?;

        parse_session_id(raw)
            .map(SessionId)
            .ok_or_else(|| ApiError::BadRequest {
                code: "badSession",
                detail: "X-Session-Id must be a UUIDv4".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_v4_uuids() {
        let id = Uuid::new_v4().to_string();
        assert!(parse_session_id(&id).is_some());
        assert!(parse_session_id(&id.to_uppercase()).is_some());
    }

    #[test]
    fn rejects_non_v4_shapes() {
        assert!(parse_session_id("").is_none());
        assert!(parse_session_id("not-a-uuid").is_none());
        // v1 uuid: version nibble is 1.
        assert!(parse_session_id("f8b50b84-9a1d-11ee-8c90-0242ac120002").is_none());
        // Braces or extra characters don't pass.
        let id = Uuid::new_v4().to_string();
        assert!(parse_session_id(&format!("{{{id}}}")).is_none());
    }
}
