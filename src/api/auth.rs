//! Caller identity forwarded by the upstream auth layer

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::OrderError;
use crate::service::{Principal, Role};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = OrderError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);
        let user_id = header(USER_ID_HEADER)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(OrderError::Unauthenticated)?;
        // a missing role is a plain user; an unknown one is rejected
        let role = match header(USER_ROLE_HEADER) {
            None | Some("") => Role::User,
            Some(raw) => Role::parse(raw).ok_or(OrderError::NotAuthorized)?,
        };
        Ok(Principal { user_id, role })
    }
}
