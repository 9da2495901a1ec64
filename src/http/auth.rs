//! Request identity: bearer sessions, staff access, cart ownership, client IP.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::net::SocketAddr;

use super::AppState;
use crate::domain::aggregates::{CartOwner, Customer};
use crate::StorefrontError;

pub const CART_SESSION_HEADER: &str = "x-cart-session";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MAX_CART_SESSION_LEN: usize = 64;

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}

pub fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name)?.to_str().ok().map(str::trim).filter(|v| !v.is_empty())
}

/// Signed-in customer.
pub struct CurrentCustomer {
    pub customer: Customer,
    /// Hash of the session token the request came in with.
    pub token_hash: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentCustomer {
    type Rejection = StorefrontError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(StorefrontError::Unauthorized)?;
        let session = state.accounts.authenticate(token).await?;
        Ok(Self { customer: session.customer, token_hash: session.token_hash })
    }
}

/// Signed-in staff member.
pub struct Staff(pub Customer);

#[axum::async_trait]
impl FromRequestParts<AppState> for Staff {
    type Rejection = StorefrontError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let CurrentCustomer { customer, .. } = CurrentCustomer::from_request_parts(parts, state).await?;
        if !customer.is_staff {
            return Err(StorefrontError::Forbidden("Staff access required"));
        }
        Ok(Self(customer))
    }
}

/// Whose cart the request addresses: the signed-in customer's, else the
/// anonymous one named by `X-Cart-Session`.
pub struct CartKey(pub CartOwner);

#[axum::async_trait]
impl FromRequestParts<AppState> for CartKey {
    type Rejection = StorefrontError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if bearer_token(parts).is_some() {
            let current = CurrentCustomer::from_request_parts(parts, state).await?;
            return Ok(Self(CartOwner::Customer(current.customer.id)));
        }
        match cart_session(parts) {
            Some(key) => Ok(Self(CartOwner::Session(key.to_string()))),
            None => Err(StorefrontError::Validation("Sign in or send an X-Cart-Session header".into())),
        }
    }
}

/// Anonymous cart key, if the client sent a usable one.
pub fn cart_session(parts: &Parts) -> Option<&str> {
    header_value(parts, CART_SESSION_HEADER).filter(|key| key.len() <= MAX_CART_SESSION_LEN)
}

/// Optional anonymous cart key, for folding into a customer cart at sign-in.
pub struct CartSession(pub Option<String>);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CartSession {
    type Rejection = StorefrontError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(cart_session(parts).map(String::from)))
    }
}

/// First `X-Forwarded-For` hop, else the peer address.
pub struct ClientIp(pub Option<String>);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = StorefrontError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = header_value(parts, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);
        let peer = || parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(forwarded.or_else(peer)))
    }
}

/// Client-supplied `Idempotency-Key`.
pub struct IdempotencyKey(pub Option<String>);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for IdempotencyKey {
    type Rejection = StorefrontError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match header_value(parts, IDEMPOTENCY_KEY_HEADER) {
            Some(key) if key.len() > 255 => Err(StorefrontError::Validation("Idempotency-Key is too long".into())),
            key => Ok(Self(key.map(String::from))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(bearer_token(&parts(&[("authorization", "Bearer abc")])), Some("abc"));
        assert_eq!(bearer_token(&parts(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&parts(&[])), None);
    }

    #[tokio::test]
    async fn forwarded_for_wins_over_peer() {
        let mut p = parts(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        p.extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        let ClientIp(ip) = ClientIp::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(ip.as_deref(), Some("203.0.113.9"));

        let mut p = parts(&[]);
        p.extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        let ClientIp(ip) = ClientIp::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn oversized_cart_sessions_are_ignored() {
        let long = "k".repeat(65);
        assert_eq!(cart_session(&parts(&[(CART_SESSION_HEADER, "abc")])), Some("abc"));
        assert_eq!(cart_session(&parts(&[(CART_SESSION_HEADER, long.as_str())])), None);
    }
}
