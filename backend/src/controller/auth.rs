use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::{
    appstate::AppState,
    error::Error,
    plugins::users::{Role, User, UserID},
};

/// The caller of an operation, resolved from its bearer token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserID,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserID, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn require(&self, role: Role) -> Result<(), Error> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::NotAuthorized(format!(
                "this action requires a {role} account"
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Actor::new(user.id, user.role)
    }
}

impl FromRequestParts<AppState> for Actor {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(Error::Unauthenticated)?;
        match User::from_token(&state.pool, token).await? {
            Some(user) => Ok(Actor::from(&user)),
            None => {
                tracing::warn!(target: "auth.bearer", reason = "unknown_token", "rejected bearer token");
                Err(Error::Unauthenticated)
            }
        }
    }
}
