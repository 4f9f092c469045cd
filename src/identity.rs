//! Session identity. The rest of the crate only sees a [`UserId`] (or nothing); which
//! validation strategy produced it is fixed once, at configuration time.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::UserId;
use crate::store::CaseStore;

/// Raw identity material lifted off a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub claimed_user_id: Option<String>,
    pub bearer_token: Option<String>,
}

impl SessionCredentials {
    /// Accepts either a bare token or an `Authorization` header value.
    pub fn with_authorization(mut self, value: &str) -> Self {
        let value = value.trim();
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();
        if !token.is_empty() {
            self.bearer_token = Some(token.to_string());
        }
        self
    }

    pub fn with_claimed_user(mut self, value: &str) -> Self {
        let value = value.trim();
        if !value.is_empty() {
            self.claimed_user_id = Some(value.to_string());
        }
        self
    }
}

pub trait SessionValidator: Send + Sync {
    /// `Ok(None)` means "no valid session"; errors are reserved for backend failures.
    fn validate(
        &self,
        credentials: &SessionCredentials,
    ) -> impl Future<Output = Result<Option<UserId>>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStrategyKind {
    /// Trust the caller-supplied user id. Development and trusted-proxy setups only.
    TrustedHeader,
    /// Verify a bearer token against stored sessions.
    SessionToken,
}

impl SessionStrategyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStrategyKind::TrustedHeader => "trusted-header",
            SessionStrategyKind::SessionToken => "session-token",
        }
    }
}

impl FromStr for SessionStrategyKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim() {
            "trusted-header" => Ok(SessionStrategyKind::TrustedHeader),
            "session-token" => Ok(SessionStrategyKind::SessionToken),
            other => Err(format!("unknown session strategy '{other}'")),
        }
    }
}

#[derive(Debug)]
pub enum SessionStrategy<S> {
    TrustedHeader,
    SessionToken(Arc<S>),
}

impl<S> Clone for SessionStrategy<S> {
    fn clone(&self) -> Self {
        match self {
            SessionStrategy::TrustedHeader => SessionStrategy::TrustedHeader,
            SessionStrategy::SessionToken(store) => SessionStrategy::SessionToken(Arc::clone(store)),
        }
    }
}

impl<S: CaseStore> SessionStrategy<S> {
    pub fn from_kind(kind: SessionStrategyKind, store: Arc<S>) -> Self {
        tracing::info!(strategy = kind.as_str(), "session validation strategy selected");
        match kind {
            SessionStrategyKind::TrustedHeader => SessionStrategy::TrustedHeader,
            SessionStrategyKind::SessionToken => SessionStrategy::SessionToken(store),
        }
    }
}

impl<S: CaseStore> SessionValidator for SessionStrategy<S> {
    async fn validate(&self, credentials: &SessionCredentials) -> Result<Option<UserId>> {
        match self {
            SessionStrategy::TrustedHeader => Ok(credentials
                .claimed_user_id
                .as_deref()
                .and_then(|raw| UserId::from_str(raw).ok())),
            SessionStrategy::SessionToken(store) => match credentials.bearer_token.as_deref() {
                Some(token) => store.find_session(token).await,
                None => Ok(None),
            },
        }
    }
}
