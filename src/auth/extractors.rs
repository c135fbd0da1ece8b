use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;
use uuid::Uuid;

use crate::auth::{cookie::SESSION_COOKIE, error::AuthError, jwt::SessionKeys};

/// Authenticated caller, resolved from the session cookie. Handlers that
/// take this extractor never run for an absent, malformed, expired or
/// tampered token.
#[derive(Debug)]
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    SessionKeys: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = SessionKeys::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_owned())
            .ok_or(AuthError::Unauthorized)?;

        let claims = keys.verify(&token).map_err(|_| {
            warn!("invalid or expired session token");
            AuthError::Unauthorized
        })?;

        Ok(AuthUser(claims.sub))
    }
}
