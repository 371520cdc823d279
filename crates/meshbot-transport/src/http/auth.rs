//! Token authentication for the HTTP API.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use meshbot_framework::ApiScope;

use super::error::ApiError;
use super::server::ApiState;

/// Alternative header carrying the bare token.
pub const TOKEN_HEADER: &str = "x-api-token";

/// The scope of the token that authenticated a request.
///
/// Rejects with 401 when the server has no tokens or the token is unknown.
#[derive(Debug, Clone, Copy)]
pub struct ApiToken(pub ApiScope);

impl ApiToken {
    /// Fails with 403 unless the token may send.
    pub fn require_send(&self) -> Result<(), ApiError> {
        if self.0.allows_send() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

impl FromRequestParts<ApiState> for ApiToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        if state.tokens.is_empty() {
            return Err(ApiError::NoTokens);
        }
        presented_token(&parts.headers)
            .and_then(|token| state.tokens.get(token))
            .map(|scope| ApiToken(*scope))
            .ok_or(ApiError::Unauthorized)
    }
}

/// `Authorization: Bearer <t>` (scheme case-insensitive), else `X-Api-Token`.
pub fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty());

    bearer.or_else(|| {
        headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_presented_token() {
        assert_eq!(presented_token(&headers(&[("authorization", "Bearer abc")])), Some("abc"));
        assert_eq!(presented_token(&headers(&[("authorization", "bearer  abc ")])), Some("abc"));
        assert_eq!(presented_token(&headers(&[("x-api-token", " xyz ")])), Some("xyz"));
        assert_eq!(
            presented_token(&headers(&[("authorization", "Basic Zm9v"), ("x-api-token", "xyz")])),
            Some("xyz")
        );
        assert_eq!(presented_token(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(presented_token(&HeaderMap::new()), None);
    }
}
