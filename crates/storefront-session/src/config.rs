//! Startup configuration.
//!
//! Read from the environment (`.env` files are loaded by the binary before
//! this runs). Both base URLs are required; a missing or malformed one is a
//! fatal error at process start.

use std::time::Duration;

use crate::error::{SessionError, SessionResult};

pub const API_BASE_URL_VAR: &str = "STOREFRONT_API_BASE_URL";
pub const WS_BASE_URL_VAR: &str = "STOREFRONT_WS_BASE_URL";
pub const REQUEST_TIMEOUT_VAR: &str = "STOREFRONT_REQUEST_TIMEOUT_SECS";
pub const KEYRING_SERVICE_VAR: &str = "STOREFRONT_KEYRING_SERVICE";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Keychain service name the token record is filed under
const DEFAULT_KEYRING_SERVICE: &str = "storefront";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub request_timeout: Duration,
    pub keyring_service: String,
}

impl Config {
    pub fn from_env() -> SessionResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value source.
    pub fn from_lookup<F>(lookup: F) -> SessionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| SessionError::Config(format!("{name} is not set")))
        };

        let api_base_url = required(API_BASE_URL_VAR)?;
        check_scheme(API_BASE_URL_VAR, &api_base_url, &["http://", "https://"])?;
        let ws_base_url = required(WS_BASE_URL_VAR)?;
        check_scheme(WS_BASE_URL_VAR, &ws_base_url, &["ws://", "wss://"])?;

        let request_timeout = match lookup(REQUEST_TIMEOUT_VAR) {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                SessionError::Config(format!("{REQUEST_TIMEOUT_VAR} must be a whole number of seconds"))
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            ws_base_url: ws_base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(request_timeout),
            keyring_service: lookup(KEYRING_SERVICE_VAR)
                .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_string()),
        })
    }
}

fn check_scheme(name: &str, url: &str, schemes: &[&str]) -> SessionResult<()> {
    if schemes.iter().any(|s| url.starts_with(s)) {
        Ok(())
    } else {
        Err(SessionError::Config(format!(
            "{name} must start with one of {}",
            schemes.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_loads_required_urls_and_defaults() {
        let config = Config::from_lookup(lookup(&[
            (API_BASE_URL_VAR, "https://api.shop.example/"),
            (WS_BASE_URL_VAR, "wss://push.shop.example/hubs"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "https://api.shop.example");
        assert_eq!(config.ws_base_url, "wss://push.shop.example/hubs");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.keyring_service, "storefront");
    }

    #[test]
    fn test_missing_url_is_fatal() {
        let err = Config::from_lookup(lookup(&[(API_BASE_URL_VAR, "https://api.shop.example")]))
            .unwrap_err();
        assert_eq!(err, SessionError::Config(format!("{WS_BASE_URL_VAR} is not set")));

        let blank = Config::from_lookup(lookup(&[
            (API_BASE_URL_VAR, "  "),
            (WS_BASE_URL_VAR, "wss://push.shop.example"),
        ]));
        assert!(matches!(blank, Err(SessionError::Config(_))));
    }

    #[test]
    fn test_rejects_wrong_schemes_and_bad_timeout() {
        let swapped = Config::from_lookup(lookup(&[
            (API_BASE_URL_VAR, "wss://api.shop.example"),
            (WS_BASE_URL_VAR, "https://push.shop.example"),
        ]));
        assert!(matches!(swapped, Err(SessionError::Config(_))));

        let timeout = Config::from_lookup(lookup(&[
            (API_BASE_URL_VAR, "https://api.shop.example"),
            (WS_BASE_URL_VAR, "wss://push.shop.example"),
            (REQUEST_TIMEOUT_VAR, "soon"),
        ]));
        assert!(matches!(timeout, Err(SessionError::Config(_))));
    }
}
