//! Identity extraction for HTTP and WebSocket requests.
//!
//! Authentication happens upstream; by the time a request reaches us the
//! proxy has stamped the verified user on it. Headers win over query
//! parameters, which exist for browser WebSocket clients that cannot set
//! headers on the upgrade request.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use parley_core::{Identity, UserId};
use serde::Deserialize;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// The caller's identity, as asserted by the upstream auth layer.
#[derive(Clone, Debug)]
pub struct VerifiedIdentity(pub Identity);

#[derive(Debug, Default, Deserialize)]
struct IdentityParams {
    user_id: Option<String>,
    username: Option<String>,
}

impl<S> FromRequestParts<S> for VerifiedIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let params = Query::<IdentityParams>::try_from_uri(&parts.uri)
            .map(|Query(params)| params)
            .unwrap_or_default();
        resolve(&parts.headers, params)
            .map(Self)
            .ok_or(ApiError::Unauthorized)
    }
}

fn resolve(headers: &HeaderMap, params: IdentityParams) -> Option<Identity> {
    let user_id = header(headers, USER_ID_HEADER).or(non_blank(params.user_id))?;
    let identity = Identity::new(UserId::from_raw(user_id));
    match header(headers, USER_NAME_HEADER).or(non_blank(params.username)) {
        Some(name) => Some(identity.with_display_name(name)),
        None => Some(identity),
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?;
    non_blank(Some(value.to_string()))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Identity, ApiError> {
        let (mut parts, ()) = request.into_parts();
        VerifiedIdentity::from_request_parts(&mut parts, &())
            .await
            .map(|VerifiedIdentity(identity)| identity)
    }

    #[tokio::test]
    async fn headers_take_precedence_over_query() {
        let request = Request::builder()
            .uri("/ws?user_id=query-user&username=Query")
            .header(USER_ID_HEADER, "header-user")
            .header(USER_NAME_HEADER, "Header")
            .body(())
            .unwrap();
        let identity = extract(request).await.unwrap();
        assert_eq!(identity.user_id.as_str(), "header-user");
        assert_eq!(identity.display_name.as_deref(), Some("Header"));
    }

    #[tokio::test]
    async fn query_parameters_are_a_fallback() {
        let request = Request::builder()
            .uri("/ws?user_id=u1&username=Alice")
            .body(())
            .unwrap();
        let identity = extract(request).await.unwrap();
        assert_eq!(identity.user_id.as_str(), "u1");
        assert_eq!(identity.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn display_name_is_optional() {
        let request = Request::builder()
            .uri("/ws")
            .header(USER_ID_HEADER, "u1")
            .body(())
            .unwrap();
        let identity = extract(request).await.unwrap();
        assert!(identity.display_name.is_none());
    }

    #[tokio::test]
    async fn missing_or_blank_user_is_rejected() {
        let request = Request::builder().uri("/ws").body(()).unwrap();
        assert!(matches!(extract(request).await, Err(ApiError::Unauthorized)));

        let request = Request::builder()
            .uri("/ws?user_id=%20%20")
            .header(USER_ID_HEADER, " ")
            .body(())
            .unwrap();
        assert!(matches!(extract(request).await, Err(ApiError::Unauthorized)));
    }
}
