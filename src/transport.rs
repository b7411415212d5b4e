//! one stateless `generateContent` exchange per call.
//!
//! every failure is folded into `ResponseResult`; `send` never errors.

use async_trait::async_trait;
use bevy::prelude::*;

use crate::config::GeminiConfig;
use crate::wire::{extract_reply, GenerateContentRequest, ShapeError};

/// outcome of a single exchange, consumed immediately into a history turn.
#[derive(Debug)]
pub enum ResponseResult {
    Success(String),
    /// non-200 status with the raw response body.
    Failure { status: u16, body: String },
    /// dns, connect, io or body read fault.
    TransportError(String),
    /// 200 whose body did not contain `candidates[0].content.parts[0].text`.
    ShapeError(ShapeError),
}

impl ResponseResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// human readable text for a failed exchange; `None` on success.
    pub fn error_description(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::Failure { status, body } => Some(format!("API Error {status}: {body}")),
            Self::TransportError(message) => Some(message.clone()),
            Self::ShapeError(err) => Some(format!("Malformed response: {err}")),
        }
    }
}

/// maps a completed http response onto a `ResponseResult`.
pub fn classify(status: u16, body: &str) -> ResponseResult {
    if status != 200 {
        return ResponseResult::Failure { status, body: body.to_string() };
    }
    match extract_reply(body) {
        Ok(text) => ResponseResult::Success(text),
        Err(err) => ResponseResult::ShapeError(err),
    }
}

/// anything that can turn user text into a reply.
///
/// implemented by `GeminiTransport`; tests and offline demos can plug in their own.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, user_text: &str) -> ResponseResult;
}

pub struct GeminiTransport {
    config: GeminiConfig,
    #[cfg(not(target_arch = "wasm32"))]
    client: reqwest::Client,
}

impl GeminiTransport {
    pub fn new(config: GeminiConfig) -> Self {
        info!(
            target: "bevy_gemini_chat",
            "GeminiTransport: endpoint='{}', model='{}', key_present={}",
            config.endpoint, config.model, !config.api_key.is_empty()
        );

        // no timeout: a request lives until it answers or its task is dropped
        #[cfg(not(target_arch = "wasm32"))]
        let client = reqwest::Client::builder().build().unwrap_or_default();

        Self {
            config,
            #[cfg(not(target_arch = "wasm32"))]
            client,
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
async fn post(client: &reqwest::Client, url: &str, body: String) -> Result<(u16, String), reqwest::Error> {
    let res = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;
    let status = res.status().as_u16();
    let text = res.text().await?;
    Ok((status, text))
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl Transport for GeminiTransport {
    /// dropping the returned future closes the connection.
    async fn send(&self, user_text: &str) -> ResponseResult {
        let body = match serde_json::to_string(&GenerateContentRequest::user_text(user_text)) {
            Ok(b) => b,
            Err(err) => return ResponseResult::TransportError(err.to_string()),
        };
        let url = self.config.request_url();
        debug!(target: "bevy_gemini_chat", "send: model='{}' text_len={}", self.config.model, user_text.len());

        match post(&self.client, &url, body).await {
            Ok((status, text)) => {
                debug!(target: "bevy_gemini_chat", "send: status={} body_len={}", status, text.len());
                classify(status, &text)
            }
            Err(err) => {
                warn!(target: "bevy_gemini_chat", "send: transport error: {err}");
                ResponseResult::TransportError(err.to_string())
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
impl Transport for GeminiTransport {
    async fn send(&self, user_text: &str) -> ResponseResult {
        use gloo_net::http::Request;

        let body = match serde_json::to_string(&GenerateContentRequest::user_text(user_text)) {
            Ok(b) => b,
            Err(err) => return ResponseResult::TransportError(err.to_string()),
        };
        let url = self.config.request_url();
        debug!(target: "bevy_gemini_chat", "send: model='{}' text_len={}", self.config.model, user_text.len());

        let req = match Request::post(&url)
            .header("Content-Type", "application/json")
            .body(body)
        {
            Ok(r) => r,
            Err(err) => return ResponseResult::TransportError(err.to_string()),
        };
        let resp = match req.send().await {
            Ok(r) => r,
            Err(err) => {
                warn!(target: "bevy_gemini_chat", "send: transport error: {err}");
                return ResponseResult::TransportError(err.to_string());
            }
        };
        let status = resp.status();
        match resp.text().await {
            Ok(text) => classify(status, &text),
            Err(err) => ResponseResult::TransportError(err.to_string()),
        }
    }
}
