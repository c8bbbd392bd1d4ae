//! Retrying request client for the REST API.
//!
//! Every call builds a fresh request per attempt and decodes the uniform
//! `{code, message, result}` envelope. Only transport-level failures are retried;
//! application errors come back as envelopes with a non-200 code.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::auth::{current_token, TokenProvider};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::notice::{Notice, Notifier};
use crate::retry::RetryPolicy;

/// Header carrying the access token on REST calls and the socket handshake.
pub const ACCESS_TOKEN_HEADER: &str = "accesstoken";

/// Uniform response wrapper of every REST call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Application code; `200` is success.
    pub code: i64,
    /// Server message.
    #[serde(default)]
    pub message: String,
    /// Payload, absent on most errors.
    #[serde(default = "Option::default")]
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    /// Application success code.
    pub const SUCCESS: i64 = 200;

    /// Returns true if the server reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }

    fn from_status(status: StatusCode) -> Self {
        Self {
            code: i64::from(status.as_u16()),
            message: status.canonical_reason().unwrap_or_default().to_string(),
            result: None,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    retry: bool,
    cancel: Option<CancellationToken>,
    headers: HeaderMap,
}

impl CallOptions {
    /// Default options: retry on, no cancellation, no extra headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable retrying, for lookups where a stale answer is worse than none.
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Abort the call (including a pending retry delay) when `token` is cancelled.
    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Add an extra request header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retry: true,
            cancel: None,
            headers: HeaderMap::new(),
        }
    }
}

/// Client for the REST side of the backend.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    tokens: Arc<dyn TokenProvider>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client from the transport configuration.
    ///
    /// # Errors
    ///
    /// Returns `Http` if the underlying HTTP client cannot be built.
    pub fn new(
        config: &TransportConfig,
        tokens: Arc<dyn TokenProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(config),
            tokens,
            notifier,
        })
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Issue a request and decode its envelope, retrying transport failures.
    ///
    /// # Errors
    ///
    /// Returns the last transport error once retries are exhausted, `Decode` if a
    /// successful response is not a valid envelope, or `Cancelled`.
    pub async fn call<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        options: CallOptions,
    ) -> Result<Envelope<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let policy = if options.retry {
            self.retry
        } else {
            RetryPolicy::NONE
        };

        policy
            .run(options.cancel.as_ref(), |attempt| {
                tracing::debug!(%method, path, attempt, "Sending request");
                self.attempt(method.clone(), path, body, &options.headers)
            })
            .await
    }

    /// `GET` shorthand for [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn get<T: DeserializeOwned>(&self, path: &str, options: CallOptions) -> Result<Envelope<T>> {
        self.call::<T, ()>(Method::GET, path, None, options).await
    }

    /// `POST` shorthand for [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn post<T, B>(&self, path: &str, body: &B, options: CallOptions) -> Result<Envelope<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.call(Method::POST, path, Some(body), options).await
    }

    fn headers(&self, extra: &HeaderMap) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(ACCESS_TOKEN_HEADER),
            HeaderValue::from_str(&current_token(self.tokens.as_ref()))?,
        );
        headers.extend(extra.clone());
        Ok(headers)
    }

    async fn attempt<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        extra: &HeaderMap,
    ) -> Result<Envelope<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url).headers(self.headers(extra)?);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let auth_rejected = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN);
        if auth_rejected {
            tracing::warn!(path, status = status.as_u16(), "Access token rejected");
            self.tokens.invalidate();
            self.notifier.notify(Notice::AuthExpired);
        }

        let envelope = match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(TransportError::Decode {
                    status: status.as_u16(),
                    message: e.to_string(),
                });
            }
            Err(_) => Envelope::from_status(status),
        };

        if !envelope.is_success() {
            tracing::debug!(path, code = envelope.code, message = %envelope.message, "Application error");
            if envelope.code >= 400 && !auth_rejected {
                self.notifier.notify(Notice::ApplicationError {
                    code: envelope.code,
                    message: envelope.message.clone(),
                });
            }
        }

        Ok(envelope)
    }
}
