use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use ulid::Ulid;

use crate::model::{Role, Session};

use super::ApiError;

/// Set by the upstream gateway after authenticating the caller.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Comma-separated roles held by the caller: `mentor`, `mentee`.
pub const USER_ROLES_HEADER: &str = "x-user-roles";

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: Ulid,
    pub roles: Vec<Role>,
}

impl CurrentUser {
    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn require(&self, role: Role) -> Result<(), ApiError> {
        if self.has(role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("{role} role required")))
        }
    }

    /// Only the session's mentor or mentee may see or change it.
    pub fn require_party(&self, session: &Session) -> Result<(), ApiError> {
        if session.involves(self.id) {
            Ok(())
        } else {
            Err(ApiError::forbidden("not a party to this session"))
        }
    }
}

fn parse_roles(raw: &str) -> Vec<Role> {
    let mut roles = Vec::new();
    for part in raw.split(',') {
        let role = match part.trim().to_ascii_lowercase().as_str() {
            "mentor" => Role::Mentor,
            "mentee" => Role::Mentee,
            _ => continue,
        };
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    roles
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing caller identity"))?;
        let id = Ulid::from_string(raw_id.trim())
            .map_err(|_| ApiError::unauthorized("malformed caller identity"))?;
        let roles = parts
            .headers
            .get(USER_ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(parse_roles)
            .unwrap_or_default();
        Ok(CurrentUser { id, roles })
    }
}
