use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::HeaderValue;
use tokio::time::Instant;
use zeroize::Zeroizing;

use super::source::TokenResponse;
use crate::error::{AuthError, HttpError};
use crate::secret::SecretString;

/// Anything able to produce a fresh token response.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<TokenResponse, AuthError>;
}

/// A bearer token plus its refresh schedule.
pub struct AccessToken {
    value: SecretString,
    acquired_at: Instant,
    refresh_at: Option<Instant>,
    expires_at: Option<Instant>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("acquired_at", &self.acquired_at)
            .field("refresh_at", &self.refresh_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    /// Schedule a token acquired at `acquired_at`.
    ///
    /// A fixed `token_expiry` wins; otherwise the token is refreshed at half
    /// of `expires_in`. With neither, it is only replaced after a 401.
    #[must_use]
    pub fn new(
        value: SecretString,
        acquired_at: Instant,
        expires_in: Option<Duration>,
        token_expiry: Option<Duration>,
    ) -> Self {
        let refresh_after = token_expiry.or_else(|| expires_in.map(|lifetime| lifetime / 2));
        Self {
            value,
            acquired_at,
            refresh_at: refresh_after.map(|d| acquired_at + d),
            expires_at: expires_in.map(|d| acquired_at + d),
        }
    }

    #[must_use]
    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    #[must_use]
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    #[must_use]
    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.refresh_at.is_some_and(|at| now >= at) || self.is_expired(now)
    }

    /// `Bearer <token>`, marked sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidHeaderValue`] if the token holds characters
    /// not allowed in a header.
    pub fn bearer_header(&self) -> Result<HeaderValue, HttpError> {
        let raw = Zeroizing::new(format!("Bearer {}", self.value.expose()));
        let mut value = HeaderValue::from_str(&raw)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Holds the session's current access token and refreshes it single-flight.
///
/// Readers load the token lock-free. When a refresh is due, one caller takes
/// the refresh lock and fetches; callers arriving meanwhile keep using the
/// old token while it has not expired, or wait for the fresh one.
pub struct TokenManager {
    source: Arc<dyn TokenSource>,
    token_expiry: Option<Duration>,
    current: ArcSwapOption<AccessToken>,
    refresh: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_expiry", &self.token_expiry)
            .field("has_token", &self.current.load().is_some())
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>, token_expiry: Option<Duration>) -> Self {
        Self {
            source,
            token_expiry,
            current: ArcSwapOption::empty(),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// A usable token, fetching one if none is held or a refresh is due.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] of a failed token request. Stale tokens are
    /// never handed out in place of a failed refresh once they have expired.
    pub async fn token(&self) -> Result<Arc<AccessToken>, AuthError> {
        let current = self.current.load_full();
        if let Some(token) = &current
            && !token.needs_refresh(Instant::now())
        {
            return Ok(token.clone());
        }

        let _guard = if let Ok(guard) = self.refresh.try_lock() {
            guard
        } else {
            if let Some(token) = current.filter(|t| !t.is_expired(Instant::now())) {
                tracing::debug!("token refresh in flight, using current token");
                return Ok(token);
            }
            self.refresh.lock().await
        };

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.current.load_full()
            && !token.needs_refresh(Instant::now())
        {
            return Ok(token);
        }

        let fresh = Arc::new(self.acquire().await?);
        self.current.store(Some(fresh.clone()));
        Ok(fresh)
    }

    /// Drop `stale` so the next [`token`](Self::token) call fetches anew.
    ///
    /// A token that was already replaced is left alone.
    pub async fn invalidate(&self, stale: &Arc<AccessToken>) {
        let _guard = self.refresh.lock().await;
        let current = self.current.load();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, stale)) {
            tracing::debug!("invalidating rejected access token");
            self.current.store(None);
        }
    }

    async fn acquire(&self) -> Result<AccessToken, AuthError> {
        let acquired_at = Instant::now();
        let response = self.source.fetch_token().await?;

        if let Some(token_type) = &response.token_type
            && !token_type.eq_ignore_ascii_case("bearer")
        {
            return Err(AuthError::UnsupportedTokenType(token_type.clone()));
        }

        let token = AccessToken::new(
            response.access_token,
            acquired_at,
            response.expires_in.map(Duration::from_secs),
            self.token_expiry,
        );
        tracing::debug!(
            expires_in = ?response.expires_in,
            refresh_in_secs = ?token.refresh_at.map(|at| at.duration_since(acquired_at).as_secs()),
            "acquired access token"
        );
        Ok(token)
    }
}
