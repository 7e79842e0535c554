use crate::error::{AppError, AppResult};
use crate::ledger::Payer;
use crate::users::{Token, User, UserStore};
use axum::http::{HeaderMap, StatusCode, header};

/// An authenticated credential and the account that owns it.
#[derive(Clone, Debug)]
pub struct Caller {
    pub user: User,
    pub token: Token,
}

impl Caller {
    pub fn payer(&self) -> Payer {
        Payer {
            user_id: self.user.id.clone(),
            token_id: self.token.id.clone(),
            token_name: self.token.name.clone(),
            token_remain_quota: self.token.remain_quota,
            token_unlimited: self.token.unlimited_quota,
        }
    }

    pub fn group(&self) -> &str {
        &self.user.group
    }
}

#[derive(Clone, Default)]
pub struct AuthState;

impl AuthState {
    pub fn new() -> Self {
        Self
    }

    /// Resolves a bearer key to its caller. Unknown, disabled, expired and
    /// exhausted keys all come back as `None`.
    pub async fn authenticate_token(&self, token: &str, user_store: &UserStore) -> Option<Caller> {
        match user_store.validate_token(token).await {
            Ok(Some((token, user))) => Some(Caller { user, token }),
            Ok(None) => None,
            Err(err) => {
                tracing::error!("token lookup failed: {err}");
                None
            }
        }
    }

    pub async fn authenticate_headers(
        &self,
        headers: &HeaderMap,
        user_store: &UserStore,
    ) -> AppResult<Caller> {
        let auth_header = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| unauthorized("missing auth"))?;
        let token = auth_header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .ok_or_else(|| unauthorized("invalid auth"))?;
        self.authenticate_token(token, user_store)
            .await
            .ok_or_else(|| unauthorized("invalid token"))
    }
}

fn unauthorized(message: &str) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
        .with_type("invalid_request_error")
}
