//! Handler invocation: how a claimed job actually does its work.

use super::history::ExecutionStatus;
use crate::config::HandlerConfig;
use anyhow::{bail, Result};
use futures::FutureExt;
use reqwest::Client;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;

// Bytes of a failing response body kept in the error message.
const MAX_BODY_EXCERPT: usize = 512;

/// Trait for anything that can run a job's target.
///
/// The dispatcher enforces `timeout` itself by dropping the future, so an
/// implementation does not have to honor it.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn invoke(&self, path: &str, timeout: Duration) -> Result<()>;
}

/// Why an invocation did not succeed.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("handler timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

impl InvocationError {
    /// Terminal execution status this error is recorded as.
    pub fn status(&self) -> ExecutionStatus {
        match self {
            InvocationError::Timeout(_) => ExecutionStatus::Timeout,
            InvocationError::Failed(_) => ExecutionStatus::Failed,
        }
    }
}

/// Run `handler` with a hard deadline. A panicking handler counts as a
/// failed attempt.
pub async fn invoke_with_deadline(
    handler: &dyn JobHandler,
    path: &str,
    timeout: Duration,
) -> std::result::Result<(), InvocationError> {
    let invocation = AssertUnwindSafe(handler.invoke(path, timeout)).catch_unwind();
    match tokio::time::timeout(timeout, invocation).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(InvocationError::Failed(format!("{e:#}"))),
        Ok(Err(panic)) => Err(InvocationError::Failed(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(InvocationError::Timeout(timeout)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Invokes jobs by POSTing to `{base_url}{path}` on the platform.
pub struct HttpHandler {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpHandler {
    pub fn new(config: &HandlerConfig) -> Result<Self> {
        let client = Client::builder().user_agent(&config.user_agent).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait::async_trait]
impl JobHandler for HttpHandler {
    async fn invoke(&self, path: &str, timeout: Duration) -> Result<()> {
        let mut request = self.client.post(self.url(path)).timeout(timeout);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(MAX_BODY_EXCERPT).collect();
        if excerpt.is_empty() {
            bail!("handler returned HTTP {}", status.as_u16());
        }
        bail!("handler returned HTTP {}: {}", status.as_u16(), excerpt.trim());
    }
}
