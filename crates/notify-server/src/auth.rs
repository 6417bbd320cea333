//! Resolving the bearer credential on an upgrade request to a user identity.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use notify_core::UserId;
use notify_settings::AuthSettings;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// JWT claims. `sub` carries the user identity.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl PrincipalResolver for JwtResolver {
    async fn resolve(&self, credential: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }
        Ok(UserId::from_raw(data.claims.sub))
    }
}

/// Takes the credential itself as the user identity. Development only.
pub struct PassthroughResolver;

#[async_trait]
impl PrincipalResolver for PassthroughResolver {
    async fn resolve(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        Ok(UserId::from_raw(credential))
    }
}

pub fn resolver_from_settings(settings: &AuthSettings) -> Arc<dyn PrincipalResolver> {
    if settings.enable {
        let secret = SecretString::from(settings.jwt_secret.clone());
        Arc::new(JwtResolver::new(&secret))
    } else {
        tracing::warn!("auth disabled, bearer credentials are trusted as user ids");
        Arc::new(PassthroughResolver)
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer <token>`, falling back to `?token=` for browsers,
/// which cannot set headers on a WebSocket handshake.
pub fn credential_from_parts(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    from_header.or_else(|| {
        let Query(query) = Query::<TokenQuery>::try_from_uri(&parts.uri).ok()?;
        query.token.filter(|t| !t.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    use super::*;

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: u64,
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn token(sub: &str, exp: u64, secret: &str) -> String {
        encode(
            &Header::default(),
            &TestClaims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn resolver() -> JwtResolver {
        JwtResolver::new(&SecretString::from(SECRET.to_string()))
    }

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[tokio::test]
    async fn valid_token_resolves_subject() {
        let user = resolver()
            .resolve(&token("u1", now() + 3600, SECRET))
            .await
            .unwrap();
        assert_eq!(user.as_str(), "u1");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let err = resolver()
            .resolve(&token("u1", now() + 3600, "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let err = resolver()
            .resolve(&token("u1", now() - 3600, SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn empty_subject_is_rejected() {
        let err = resolver()
            .resolve(&token("", now() + 3600, SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn passthrough_uses_credential() {
        let user = PassthroughResolver.resolve("u9").await.unwrap();
        assert_eq!(user.as_str(), "u9");
    }

    #[test]
    fn credential_from_bearer_header() {
        let req = Request::builder()
            .uri("/post/feed/posted")
            .header("authorization", "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(credential_from_parts(&parts(req)).as_deref(), Some("abc"));
    }

    #[test]
    fn credential_from_query_when_header_absent() {
        let req = Request::builder()
            .uri("/post/feed/posted?token=xyz&other=1")
            .body(())
            .unwrap();
        assert_eq!(credential_from_parts(&parts(req)).as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_credential() {
        let req = Request::builder()
            .uri("/post/feed/posted")
            .header("authorization", "Basic abc")
            .body(())
            .unwrap();
        assert!(credential_from_parts(&parts(req)).is_none());
    }

    #[test]
    fn auth_error_is_401() {
        let resp = AuthError::MissingCredential.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
