//! Access-token lifecycle with single-flight refresh.
//!
//! Concurrent callers that find the cached token stale all await the same
//! refresh future, so at most one token request is in flight and every waiter
//! sees the same token or the same error. A failed refresh leaves the
//! previously cached token in place.

use crate::http_client::SignedTransport;
use crate::observability;
use crate::wire::TokenResult;
use crate::ScaleError;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::Mutex;

const TOKEN_PATH: &str = "/v1.0/token";

#[derive(Clone, Debug)]
pub struct AccessToken {
    value: SecretString,
    refresh_token: Option<SecretString>,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: String, refresh_token: Option<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: SecretString::new(value.into()),
            refresh_token: refresh_token.map(|r| SecretString::new(r.into())),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True while `now + margin` is still before expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin < self.expires_at
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken, ScaleError>>>;

#[derive(Default)]
struct TokenState {
    cached: Option<AccessToken>,
    inflight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

pub struct TokenManager {
    transport: Arc<SignedTransport>,
    margin: chrono::Duration,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(transport: Arc<SignedTransport>, margin: chrono::Duration) -> Self {
        Self {
            transport,
            margin,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Return the cached token, refreshing first when it is missing or within
    /// the safety margin of expiry.
    pub async fn get_valid_token(&self) -> Result<AccessToken, ScaleError> {
        let (generation, refresh) = {
            let mut state = self.state.lock().await;
            let now = self.transport.clock().now();
            if let Some(token) = state.cached.as_ref().filter(|t| t.is_fresh(now, self.margin)) {
                return Ok(token.clone());
            }
            match &state.inflight {
                Some((generation, refresh)) => (*generation, refresh.clone()),
                None => {
                    state.generation += 1;
                    let refresh_token = state
                        .cached
                        .as_ref()
                        .and_then(|t| t.refresh_token.as_ref())
                        .map(|r| r.expose_secret().to_string());
                    let refresh = fetch_token(self.transport.clone(), refresh_token)
                        .boxed()
                        .shared();
                    state.inflight = Some((state.generation, refresh.clone()));
                    (state.generation, refresh)
                }
            }
        };

        let outcome = refresh.await;

        let mut state = self.state.lock().await;
        if matches!(&state.inflight, Some((g, _)) if *g == generation) {
            state.inflight = None;
            if let Ok(token) = &outcome {
                state.cached = Some(token.clone());
            }
        }
        outcome
    }

    /// Drop the cached token if it is still `stale`, forcing the next
    /// [`get_valid_token`](Self::get_valid_token) to refresh. A token that
    /// another caller already replaced is left alone.
    pub async fn invalidate(&self, stale: &AccessToken) {
        let mut state = self.state.lock().await;
        if state
            .cached
            .as_ref()
            .is_some_and(|t| t.secret() == stale.secret())
        {
            state.cached = None;
        }
    }
}

async fn fetch_token(
    transport: Arc<SignedTransport>,
    refresh_token: Option<String>,
) -> Result<AccessToken, ScaleError> {
    metrics::counter!(observability::TOKEN_REFRESHES_TOTAL).increment(1);

    if let Some(refresh_token) = refresh_token {
        let path = format!("{TOKEN_PATH}/{refresh_token}");
        match transport
            .send::<TokenResult>(Method::GET, &path, &[], None, None)
            .await
        {
            Ok(result) => return Ok(into_token(result, &transport)),
            Err(e @ (ScaleError::Transport(_) | ScaleError::RateLimited(_))) => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "refresh token rejected; requesting a new grant");
            }
        }
    }

    let query = [("grant_type", "1".to_string())];
    let result = transport
        .send::<TokenResult>(Method::GET, TOKEN_PATH, &query, None, None)
        .await
        .map_err(auth_error)?;
    tracing::debug!("obtained access token");
    Ok(into_token(result, &transport))
}

fn into_token(result: TokenResult, transport: &SignedTransport) -> AccessToken {
    let (value, refresh, expires_at) = result.into_parts(transport.clock().now());
    AccessToken::new(value, refresh, expires_at)
}

/// Vendor rejections of the token call are authentication failures; transport
/// trouble and throttling keep their retryable kinds.
fn auth_error(err: ScaleError) -> ScaleError {
    match err {
        ScaleError::Transport(_)
        | ScaleError::RateLimited(_)
        | ScaleError::InvalidCredentials(_)
        | ScaleError::Auth(_) => err,
        other => ScaleError::Auth(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn freshness_respects_margin() {
        let token = AccessToken::new("t".into(), None, at(1_000));
        let margin = Duration::seconds(60);
        assert!(token.is_fresh(at(939), margin));
        assert!(!token.is_fresh(at(940), margin));
        assert!(!token.is_fresh(at(2_000), margin));
    }

    #[test]
    fn token_call_rejections_become_auth_errors() {
        assert!(matches!(
            auth_error(ScaleError::Unknown { code: 1, msg: "x".into() }),
            ScaleError::Auth(_)
        ));
        assert!(matches!(
            auth_error(ScaleError::Transport("reset".into())),
            ScaleError::Transport(_)
        ));
        assert!(matches!(
            auth_error(ScaleError::InvalidCredentials("bad".into())),
            ScaleError::InvalidCredentials(_)
        ));
    }
}
