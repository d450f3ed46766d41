use crate::gameflip::auth::{self, AuthError, Credentials};
use crate::gameflip::config::{API_ROOT, CONTENT_TYPE_JSON, CONTENT_TYPE_PATCH};
use crate::gameflip::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use crate::metrics;
use reqwest::Method;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api secret: {0}")]
    InvalidSecretFormat(String),
    #[error("remote rejected the request signature")]
    InvalidSignature,
    #[error("rate limited by remote api")]
    RateLimited,
    #[error("{message}")]
    RemoteRejected { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: u32, last: Box<ApiError> },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::InvalidSignature | ApiError::RateLimited | ApiError::Transport(_)
        )
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::InvalidSecretFormat(detail) => ApiError::InvalidSecretFormat(detail),
        }
    }
}

/// How one HTTP exchange is judged before any retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Success(Value),
    InvalidSignature,
    RateLimited,
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    /// Sleep `rate_limit_backoff` and retry inside the executor.
    Backoff,
    /// Return `ApiError::RateLimited` at once so the caller can requeue.
    Surface,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub signature_backoff: Duration,
    pub transport_backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub exponential: bool,
    pub on_rate_limit: RateLimitAction,
    pub classify: fn(u16, Option<&Value>) -> Classification,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            signature_backoff: Duration::from_secs(1),
            transport_backoff: Duration::from_secs(1),
            rate_limit_backoff: Duration::from_secs(2),
            exponential: false,
            on_rate_limit: RateLimitAction::Backoff,
            classify: classify_response,
        }
    }
}

impl RetryPolicy {
    pub fn surface_rate_limits(mut self) -> Self {
        self.on_rate_limit = RateLimitAction::Surface;
        self
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, failure: &ApiError, attempt: u32) -> Duration {
        let base = match failure {
            ApiError::RateLimited => self.rate_limit_backoff,
            ApiError::InvalidSignature => self.signature_backoff,
            _ => self.transport_backoff,
        };
        if self.exponential {
            base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        } else {
            base
        }
    }
}

/// Default classifier for the marketplace's `{status, data, error}` envelope.
pub fn classify_response(status: u16, body: Option<&Value>) -> Classification {
    // Gateways answer 429 with HTML or plain text.
    if status == 429 {
        return Classification::RateLimited;
    }
    let Some(body) = body else {
        return Classification::Rejected {
            status,
            message: format!("HTTP {status}: malformed response body"),
        };
    };
    let failed = body.get("status").and_then(Value::as_str) == Some("FAILURE");
    if status == 200 && !failed {
        return Classification::Success(body.clone());
    }

    let message = body
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("invalid api otp") {
        Classification::InvalidSignature
    } else if lowered.contains("too many attempts") {
        Classification::RateLimited
    } else if message.is_empty() {
        Classification::Rejected {
            status,
            message: format!("HTTP {status}"),
        }
    } else {
        Classification::Rejected { status, message }
    }
}

/// Signs, sends and retries calls against the marketplace API.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Arc::new(ReqwestTransport::new()), API_ROOT.as_str())
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        credentials: &Credentials,
        body: Option<&Value>,
        params: &[(String, String)],
    ) -> Result<Value, ApiError> {
        self.execute_with(&self.policy, method, endpoint, credentials, body, params)
            .await
    }

    pub async fn execute_with(
        &self,
        policy: &RetryPolicy,
        method: Method,
        endpoint: &str,
        credentials: &Credentials,
        body: Option<&Value>,
        params: &[(String, String)],
    ) -> Result<Value, ApiError> {
        let content_type = if method == Method::PATCH {
            CONTENT_TYPE_PATCH
        } else {
            CONTENT_TYPE_JSON
        };
        let url = format!("{}{}", self.base_url, endpoint);
        let max_attempts = policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            // A retry may land in a new time step, so the header is never reused.
            let header = auth::headers(credentials, content_type)?;
            let mut request = HttpRequest::new(method.clone(), url.as_str())
                .header("Authorization", header.authorization)
                .header("Content-Type", header.content_type)
                .query(params);
            if let Some(body) = body {
                request = request.json(body.clone());
            }

            debug!(target = "mcflip.gameflip", %method, endpoint, attempt, "dispatch");
            let failure = match self.transport.send(request).await {
                Ok(response) => match (policy.classify)(response.status, response.json().as_ref()) {
                    Classification::Success(value) => {
                        metrics::inc_remote_attempts(method.as_str(), "success");
                        return Ok(value);
                    }
                    Classification::Rejected { status, message } => {
                        metrics::inc_remote_attempts(method.as_str(), "rejected");
                        warn!(target = "mcflip.gameflip", endpoint, status, %message, "request_rejected");
                        return Err(ApiError::RemoteRejected { status, message });
                    }
                    Classification::RateLimited => {
                        if policy.on_rate_limit == RateLimitAction::Surface {
                            return Err(ApiError::RateLimited);
                        }
                        ApiError::RateLimited
                    }
                    Classification::InvalidSignature => ApiError::InvalidSignature,
                },
                Err(err) => ApiError::Transport(err.0),
            };
            metrics::inc_remote_attempts(method.as_str(), failure_label(&failure));

            warn!(
                target = "mcflip.gameflip",
                endpoint,
                attempt,
                max_attempts,
                error = %failure,
                "transient_failure"
            );
            if attempt < max_attempts {
                sleep(policy.backoff(&failure, attempt)).await;
            }
            last = Some(failure);
        }

        Err(ApiError::MaxRetriesExceeded {
            attempts: max_attempts,
            last: Box::new(last.unwrap_or(ApiError::Transport("no attempt made".into()))),
        })
    }

    /// Single unsigned exchange, used for image download and upload targets.
    pub async fn send_unsigned(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.transport
            .send(request)
            .await
            .map_err(|err| ApiError::Transport(err.0))
    }
}

fn failure_label(failure: &ApiError) -> &'static str {
    match failure {
        ApiError::RateLimited => "rate_limited",
        ApiError::InvalidSignature => "invalid_signature",
        _ => "transport",
    }
}
