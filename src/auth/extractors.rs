use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::dto::{JwtKeys, TokenKind};
use super::repo_types::{Role, User};
use crate::error::AppError;
use crate::state::AppState;

fn bearer(parts: &Parts) -> Option<&str> {
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
}

fn access_subject(keys: &JwtKeys, token: &str) -> Result<Uuid, AppError> {
    let claims = keys.verify(token).map_err(|_| {
        warn!("invalid or expired token");
        AppError::Unauthorized("Invalid or expired token".into())
    })?;
    if claims.kind != TokenKind::Access {
        return Err(AppError::Unauthorized("Access token required".into()));
    }
    Ok(claims.sub)
}

/// Extracts and validates the access JWT, returning the user ID.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);
        let token = bearer(parts)
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;
        Ok(AuthUser(access_subject(&keys, token)?))
    }
}

/// Like `AuthUser`, but anonymous requests and unusable tokens yield `None`.
pub struct OptionalAuthUser(pub Option<Uuid>);

#[async_trait]
impl<S> FromRequestParts<S> for OptionalAuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer(parts) else {
            return Ok(OptionalAuthUser(None));
        };
        let keys = JwtKeys::from_ref(state);
        match access_subject(&keys, token) {
            Ok(id) => Ok(OptionalAuthUser(Some(id))),
            Err(_) => {
                debug!("ignoring unusable bearer token on optional-auth route");
                Ok(OptionalAuthUser(None))
            }
        }
    }
}

/// The authenticated, active user loaded from the database.
pub struct CurrentUser(pub User);

impl CurrentUser {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.0.role) {
            Ok(())
        } else {
            warn!(user_id = %self.0.id, role = ?self.0.role, "insufficient role");
            Err(AppError::Forbidden("Insufficient permissions".into()))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.0.role == Role::Admin
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user_id) = AuthUser::from_request_parts(parts, state).await?;
        let user = User::find_by_id(&state.db, user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("User not found".into()))?;
        if !user.is_active {
            warn!(user_id = %user.id, "deactivated account");
            return Err(AppError::Unauthorized("Account is deactivated".into()));
        }
        Ok(CurrentUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let state = AppState::fake();
        let mut parts = parts_with(None);
        let err = AuthUser::from_request_parts(&mut parts, &state)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let token = keys.sign_refresh(Uuid::new_v4()).unwrap();
        let mut parts = parts_with(Some(&format!("Bearer {token}")));
        let err = AuthUser::from_request_parts(&mut parts, &state)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Unauthorized(m) if m == "Access token required"));
    }

    #[tokio::test]
    async fn optional_auth_tolerates_garbage() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let id = Uuid::new_v4();

        let mut anon = parts_with(None);
        let OptionalAuthUser(none) = OptionalAuthUser::from_request_parts(&mut anon, &state)
            .await
            .unwrap();
        assert!(none.is_none());

        let mut junk = parts_with(Some("Bearer nope"));
        let OptionalAuthUser(none) = OptionalAuthUser::from_request_parts(&mut junk, &state)
            .await
            .unwrap();
        assert!(none.is_none());

        let token = keys.sign_access(id).unwrap();
        let mut good = parts_with(Some(&format!("Bearer {token}")));
        let OptionalAuthUser(some) = OptionalAuthUser::from_request_parts(&mut good, &state)
            .await
            .unwrap();
        assert_eq!(some, Some(id));
    }
}
