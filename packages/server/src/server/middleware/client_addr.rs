//! Caller address resolution for the per-IP rate-limit backstop.
//!
//! Upload intake is the only surface with an IP-keyed limit, so the
//! address is resolved by an extractor right there instead of a global
//! middleware. Proxied deployments carry the caller in `X-Forwarded-For`
//! (first hop wins); direct connections fall back to the socket peer.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::net::{IpAddr, SocketAddr};

/// The address fed into [`crate::kernel::rate_limit::RateLimiter::check_ip`].
/// `None` when the request carries no resolvable address (in-process
/// tests, or a proxy that strips everything); the backstop then skips.
#[derive(Debug, Clone, Copy)]
pub struct BackstopIp(pub Option<IpAddr>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for BackstopIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = ["x-forwarded-for", "x-real-ip"].iter().find_map(|name| {
            let value = parts.headers.get(*name)?.to_str().ok()?;
            value.split(',').next()?.trim().parse().ok()
        });

        let ip = forwarded.or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        });

        Ok(BackstopIp(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    async fn resolve(request: Request<Body>) -> Option<IpAddr> {
        let (mut parts, _) = request.into_parts();
        let BackstopIp(ip) = BackstopIp::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        ip
    }

    #[tokio::test]
    async fn forwarded_for_takes_the_first_hop() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .header("x-real-ip", "198.51.100.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve(request).await, Some("203.0.113.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn real_ip_is_the_second_choice() {
        let request = Request::builder()
            .header("x-real-ip", "198.51.100.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve(request).await, Some("198.51.100.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn falls_back_to_the_socket_peer() {
        let mut request = Request::builder().body(Body::empty()).unwrap();
        let addr: SocketAddr = "192.0.2.7:55000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(resolve(request).await, Some("192.0.2.7".parse().unwrap()));
    }

    #[tokio::test]
    async fn no_address_means_the_backstop_skips() {
        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(resolve(request).await, None);
    }
}
