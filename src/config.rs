//! explicit endpoint configuration for the gemini transport.
//!
//! sourced once at startup (`from_env`) and handed to `GeminiTransport::new`.
//! on wasm there is no process environment, so the same keys are read from the
//! page url query instead (`?key=...&model=...&endpoint=...`).

use bevy::prelude::*;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_ENDPOINT: &str = "GEMINI_ENDPOINT";
pub const ENV_MODEL: &str = "GEMINI_MODEL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no api key configured (set GEMINI_API_KEY)")]
    MissingApiKey,
    #[error("endpoint '{0}' is not an http(s) url")]
    InvalidEndpoint(String),
}

#[derive(Resource, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    /// scheme + host, e.g. `https://generativelanguage.googleapis.com`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

// keep the key out of logs
impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &if self.api_key.is_empty() { "<empty>" } else { "<redacted>" })
            .field("model", &self.model)
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), ..default() }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// builds the config from `GEMINI_API_KEY`, `GEMINI_ENDPOINT`, `GEMINI_MODEL`.
    ///
    /// a missing key is not rejected here: the request goes out with an empty
    /// `key=` and the remote rejection lands in the chat history.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// wasm: reads `key`, `endpoint` and `model` from the page url query.
    #[cfg(target_arch = "wasm32")]
    pub fn from_env() -> Self {
        let search = web_sys::window()
            .and_then(|w| w.location().search().ok())
            .unwrap_or_default();
        Self::from_query(&search)
    }

    /// percent-decoding is left to the browser's `URLSearchParams`.
    #[cfg(target_arch = "wasm32")]
    pub fn from_query(search: &str) -> Self {
        let params = web_sys::UrlSearchParams::new_with_str(search).ok();
        Self::from_lookup(|name| {
            let key = query_key(name)?;
            params.as_ref().and_then(|p| p.get(key))
        })
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v: &String| !v.trim().is_empty());
        let config = Self {
            endpoint: non_empty(ENV_ENDPOINT).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key: lookup(ENV_API_KEY).unwrap_or_default(),
            model: non_empty(ENV_MODEL).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        };
        if let Err(err) = config.validate() {
            warn!(target: "bevy_gemini_chat", "config: {err}");
        }
        config
    }

    /// advisory check; nothing refuses to send on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(())
    }

    /// `{endpoint}/v1beta/models/{model}:generateContent?key={api_key}`
    pub fn request_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint.trim_end_matches('/'),
            self.model,
            self.api_key,
        )
    }
}

/// page-query name for each environment variable.
#[cfg(target_arch = "wasm32")]
fn query_key(env_name: &str) -> Option<&'static str> {
    match env_name {
        ENV_API_KEY => Some("key"),
        ENV_ENDPOINT => Some("endpoint"),
        ENV_MODEL => Some("model"),
        _ => None,
    }
}
