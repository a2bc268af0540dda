//! HTTP client implementation for the Tuya OpenAPI.
//!
//! [`SignedTransport`] turns one call into one signed HTTP exchange and decodes
//! the response envelope. [`ReqwestScaleClient`] layers access tokens and the
//! retry policy on top and implements [`ScaleApi`](crate::ScaleApi).

use crate::retry::{Clock, RetryPolicy, SystemClock};
use crate::signer::{CanonicalRequest, SIGN_METHOD, Signer};
use crate::token::TokenManager;
use crate::wire::{self, AnalysisBody, HistoryResult, VendorReport};
use crate::{AnalysisReport, AnalysisRequest, HistoryPage, PageCursor, ScaleApi, ScaleError};
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const ERROR_BODY_SNIPPET: usize = 256;

/// Signs, sends and decodes single requests. Holds no token state.
pub struct SignedTransport {
    base_url: String,
    signer: Signer,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl SignedTransport {
    pub fn new(
        base_url: &str,
        signer: Signer,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ScaleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScaleError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            client,
            clock,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Send one signed request and decode the envelope's `result` into `T`.
    ///
    /// `access_token` is `None` only for the token endpoints.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
        access_token: Option<&str>,
    ) -> Result<T, ScaleError> {
        let request = CanonicalRequest {
            method: method.as_str(),
            path,
            query,
            headers: &[],
            body: body.as_deref(),
        };
        let t = self.clock.now().timestamp_millis();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let sign = self.signer.sign(&request, t, &nonce, access_token)?;
        let url = format!("{}{}", self.base_url, request.url_path());

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header("client_id", self.signer.access_id())
            .header("sign", sign)
            .header("sign_method", SIGN_METHOD)
            .header("t", t.to_string())
            .header("nonce", nonce);
        if let Some(token) = access_token {
            builder = builder.header("access_token", token);
        }
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        tracing::debug!(%method, path, "sending signed request");
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(error_from_response(resp).await);
        }
        let text = resp.text().await?;
        wire::decode_envelope(&text)
    }
}

/// Extract error information from a non-2xx response.
async fn error_from_response(resp: reqwest::Response) -> ScaleError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let body_snippet: String = body.chars().take(ERROR_BODY_SNIPPET).collect();
    ScaleError::from_status(status, body_snippet)
}

/// Knobs for [`ReqwestScaleClient::with_options`].
#[derive(Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Tokens closer than this to expiry are refreshed before use.
    pub token_margin: chrono::Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            token_margin: chrono::Duration::seconds(60),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Client for the Tuya scale endpoints using reqwest.
#[derive(Clone)]
pub struct ReqwestScaleClient {
    transport: Arc<SignedTransport>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl ReqwestScaleClient {
    /// Create a client with default timeout, retry policy and token margin.
    ///
    /// # Arguments
    /// * `base_url` - Region host, e.g. "https://openapi.tuyaeu.com"
    /// * `access_id` - Cloud project access id (client id)
    /// * `access_key` - Cloud project access secret
    pub fn new(
        base_url: &str,
        access_id: impl Into<String>,
        access_key: SecretString,
    ) -> Result<Self, ScaleError> {
        Self::with_options(base_url, access_id, access_key, ClientOptions::default())
    }

    pub fn with_options(
        base_url: &str,
        access_id: impl Into<String>,
        access_key: SecretString,
        options: ClientOptions,
    ) -> Result<Self, ScaleError> {
        let signer = Signer::new(access_id, access_key);
        let transport = Arc::new(SignedTransport::new(
            base_url,
            signer,
            options.timeout,
            options.clock,
        )?);
        let tokens = Arc::new(TokenManager::new(transport.clone(), options.token_margin));
        Ok(Self {
            transport,
            tokens,
            retry: options.retry,
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Fetch a token to prove the credentials work.
    pub async fn validate_credentials(&self) -> Result<(), ScaleError> {
        let clock = self.transport.clock().clone();
        self.retry
            .retry_async(clock.as_ref(), || self.tokens.get_valid_token())
            .await
            .map(|_| ())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> Result<T, ScaleError> {
        let clock = self.transport.clock().clone();
        self.retry
            .retry_async(clock.as_ref(), || {
                self.attempt(method.clone(), path, query, body.clone())
            })
            .await
    }

    /// One attempt, including at most one forced token refresh.
    async fn attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> Result<T, ScaleError> {
        let token = self.tokens.get_valid_token().await?;
        let first = self
            .transport
            .send(method.clone(), path, query, body.clone(), Some(token.secret()))
            .await;
        match first {
            Err(ScaleError::TokenExpired(msg)) => {
                tracing::debug!(%msg, path, "token rejected as expired; refreshing once");
                self.tokens.invalidate(&token).await;
                let fresh = self.tokens.get_valid_token().await?;
                self.transport
                    .send(method, path, query, body, Some(fresh.secret()))
                    .await
            }
            other => other,
        }
    }
}

fn device_path(device_id: &str, suffix: &str) -> Result<String, ScaleError> {
    if device_id.is_empty() || device_id.contains(['/', '?', '&', ' ']) {
        return Err(ScaleError::Config(format!("invalid device id {device_id:?}")));
    }
    Ok(format!("/v1.0/scales/{device_id}/{suffix}"))
}

#[async_trait]
impl ScaleApi for ReqwestScaleClient {
    async fn fetch_history_page(
        &self,
        device_id: &str,
        cursor: &PageCursor,
        page_size: u32,
    ) -> Result<HistoryPage, ScaleError> {
        let path = device_path(device_id, "datas/history")?;
        // The window always starts at the cursor, so the page number stays 1.
        let mut query: Vec<(&str, String)> = vec![
            ("page_no", "1".to_string()),
            ("page_size", page_size.to_string()),
            ("start_time", cursor.start_time.to_string()),
        ];
        if let Some(last_id) = &cursor.last_id {
            query.push(("last_row_key", last_id.clone()));
        }
        let result: HistoryResult = self.call(Method::GET, &path, &query, None).await?;
        let page = result.into_page(device_id)?;
        tracing::debug!(
            device_id,
            start_time = cursor.start_time,
            records = page.records.len(),
            "fetched history page"
        );
        Ok(page)
    }

    async fn fetch_analysis_report(
        &self,
        device_id: &str,
        record_id: &str,
        request: &AnalysisRequest,
    ) -> Result<AnalysisReport, ScaleError> {
        let path = device_path(device_id, "analysis-reports")?;
        let body = serde_json::to_string(&AnalysisBody::from(request))
            .map_err(|e| ScaleError::Decode(format!("encoding analysis body: {e}")))?;
        let report: VendorReport = self.call(Method::POST, &path, &[], Some(body)).await?;
        let report = AnalysisReport::try_from(report)?;
        tracing::debug!(device_id, record_id, "fetched analysis report");
        Ok(report)
    }
}
