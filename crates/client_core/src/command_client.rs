//! Request/response commands against the generation backend.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use shared::{
    domain::RequestId,
    error::ApiError,
    protocol::{ApproveRequest, ReviewNoteRequest, StartRequest, StartResponse},
};
use tracing::{debug, warn};
use url::Url;

use crate::{config::ClientSettings, error::SessionError};

/// Single round-trip commands. Implementations never retry; a failed call has
/// no client-side effect.
#[async_trait]
pub trait CommandClient: Send + Sync {
    async fn start(&self, intent: &str) -> Result<RequestId, SessionError>;
    async fn approve(&self, request_id: RequestId, final_text: &str) -> Result<(), SessionError>;
    async fn decline(&self, request_id: RequestId, reason: &str) -> Result<(), SessionError>;
    async fn revise(&self, request_id: RequestId, reason: &str) -> Result<(), SessionError>;
}

pub struct HttpCommandClient {
    http: Client,
    base_url: Url,
    timeout: Option<Duration>,
}

impl HttpCommandClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self::with_http_client(Client::new(), parse_base_url(base_url)?))
    }

    pub fn from_settings(settings: &ClientSettings) -> anyhow::Result<Self> {
        let mut client = Self::with_http_client(
            settings.build_http_client()?,
            parse_base_url(&settings.api_base_url)?,
        );
        client.timeout = Some(settings.request_timeout());
        Ok(client)
    }

    pub fn with_http_client(http: Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            timeout: None,
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, SessionError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| SessionError::Transport(format!("invalid endpoint '{path}': {err}")))?;
        let mut request = self.http.post(url.clone()).json(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let res = request
            .send()
            .await
            .map_err(|err| SessionError::Transport(format!("POST {url} failed: {err}")))?;
        let status = res.status();
        if status.is_success() {
            debug!(%url, status = status.as_u16(), "command: request accepted");
            return Ok(res);
        }

        let raw = res.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiError>(&raw) {
            Ok(api_error) => api_error.message,
            Err(_) if raw.trim().is_empty() => status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
            Err(_) => raw,
        };
        warn!(
            %url,
            status = status.as_u16(),
            reason = %message,
            "command: backend rejected request"
        );
        Err(SessionError::Backend {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl CommandClient for HttpCommandClient {
    async fn start(&self, intent: &str) -> Result<RequestId, SessionError> {
        let res = self
            .post(
                "start",
                &StartRequest {
                    intent: intent.to_string(),
                },
            )
            .await?;
        let body: StartResponse = res
            .json()
            .await
            .map_err(|err| SessionError::Transport(format!("invalid start response: {err}")))?;
        Ok(body.request_id)
    }

    async fn approve(&self, request_id: RequestId, final_text: &str) -> Result<(), SessionError> {
        self.post(
            &format!("approve/{request_id}"),
            &ApproveRequest {
                final_text: final_text.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn decline(&self, request_id: RequestId, reason: &str) -> Result<(), SessionError> {
        self.post(
            &format!("decline/{request_id}"),
            &ReviewNoteRequest {
                reason: reason.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn revise(&self, request_id: RequestId, reason: &str) -> Result<(), SessionError> {
        self.post(
            &format!("rerun/{request_id}"),
            &ReviewNoteRequest {
                reason: reason.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

/// Parses `raw` as an http(s) base URL with a trailing slash so relative
/// endpoint joins keep any path prefix.
pub fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).with_context(|| format!("invalid api base url '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("api base url must start with http:// or https://, got '{raw}'");
    }
    Ok(url)
}

#[cfg(test)]
#[path = "tests/command_client_tests.rs"]
mod tests;
