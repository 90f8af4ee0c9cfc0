//! Client configuration, read from `BFEED_*` environment variables.
//!
//! Invalid values are logged and replaced by their defaults, so a misconfigured variable never stops the client from
//! starting. Tokens are held in [`Secret`]s and never printed.
use std::{env, time::Duration};

use balance_feed_engine::{Credentials, ReconnectPolicy};
use bf_common::{parse_boolean_flag, parse_millis, parse_positive, Secret};
use log::*;
use url::Url;

use crate::{
    errors::ConfigError,
    hub::{HubOptions, DEFAULT_INVOKE_TIMEOUT, DEFAULT_KEEP_ALIVE},
};

pub const DEFAULT_HUB_URL: &str = "http://127.0.0.1:5000/hubs/balance";
pub const DEFAULT_AUTH_URL: &str = "http://127.0.0.1:5000/api/auth/refresh";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(30_000);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The balance hub endpoint. `http(s)` URLs are mapped to `ws(s)` when the WebSocket is opened.
    pub hub_url: Url,
    /// The token refresh endpoint of the auth service.
    pub auth_url: Url,
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
    pub account_id: Option<String>,
    pub user_id: Option<String>,
    pub policy: ReconnectPolicy,
    pub skip_negotiation: bool,
    pub keep_alive: Duration,
    pub invoke_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_url: default_url(DEFAULT_HUB_URL),
            auth_url: default_url(DEFAULT_AUTH_URL),
            access_token: None,
            refresh_token: None,
            account_id: None,
            user_id: None,
            policy: ReconnectPolicy::default(),
            skip_negotiation: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds the configuration from any variable source. `lookup` returns `None` for unset variables.
    pub fn from_lookup<F>(lookup: F) -> Self
    where F: Fn(&'static str) -> Option<String> {
        let hub_url = url_or_default(&lookup, "BFEED_HUB_URL", DEFAULT_HUB_URL);
        let auth_url = url_or_default(&lookup, "BFEED_AUTH_URL", DEFAULT_AUTH_URL);
        let access_token = non_empty(&lookup, "BFEED_ACCESS_TOKEN").map(Secret::new);
        let refresh_token = non_empty(&lookup, "BFEED_REFRESH_TOKEN").map(Secret::new);
        if access_token.is_none() {
            warn!("🪛️ BFEED_ACCESS_TOKEN is not set. The balance feed cannot connect until you log in.");
        }
        let account_id = non_empty(&lookup, "BFEED_ACCOUNT_ID");
        let user_id = non_empty(&lookup, "BFEED_USER_ID");
        if account_id.is_none() && user_id.is_none() {
            warn!("🪛️ Neither BFEED_ACCOUNT_ID nor BFEED_USER_ID is set. No balance group will be joined.");
        }
        let max_attempts = value_or_default(&lookup, "BFEED_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS, parse_positive);
        let base_delay = value_or_default(&lookup, "BFEED_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE, parse_millis);
        let mut max_delay = value_or_default(&lookup, "BFEED_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX, parse_millis);
        if max_delay < base_delay {
            warn!(
                "🪛️ BFEED_BACKOFF_MAX_MS ({}ms) is less than BFEED_BACKOFF_BASE_MS ({}ms). Using the base delay as the \
                 cap.",
                max_delay.as_millis(),
                base_delay.as_millis()
            );
            max_delay = base_delay;
        }
        let policy = ReconnectPolicy { max_attempts, base_delay, max_delay };
        let skip_negotiation = parse_boolean_flag(lookup("BFEED_SKIP_NEGOTIATION"), false);
        let keep_alive = value_or_default(&lookup, "BFEED_KEEP_ALIVE_SECS", DEFAULT_KEEP_ALIVE, parse_secs);
        let invoke_timeout = value_or_default(&lookup, "BFEED_INVOKE_TIMEOUT_SECS", DEFAULT_INVOKE_TIMEOUT, parse_secs);
        Self {
            hub_url,
            auth_url,
            access_token,
            refresh_token,
            account_id,
            user_id,
            policy,
            skip_negotiation,
            keep_alive,
            invoke_timeout,
        }
    }

    /// The initial session, as configured.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            account_id: self.account_id.clone(),
            user_id: self.user_id.clone(),
        }
    }

    pub fn hub_options(&self) -> HubOptions {
        HubOptions::new(self.hub_url.clone())
            .with_skip_negotiation(self.skip_negotiation)
            .with_keep_alive(self.keep_alive)
            .with_invoke_timeout(self.invoke_timeout)
    }
}

/// Parses a hub or auth endpoint. Only `http`, `https`, `ws` and `wss` URLs are accepted.
pub fn parse_url(var: &'static str, value: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl { var, value: value.to_string(), reason };
    let url = Url::parse(value.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(invalid(format!("Unsupported scheme '{other}'"))),
    }
}

fn parse_secs(value: &str) -> Result<Duration, bf_common::ParseValueError> {
    parse_positive(value).map(|secs| Duration::from_secs(u64::from(secs)))
}

fn default_url(url: &str) -> Url {
    Url::parse(url).expect("Default URLs are valid")
}

fn url_or_default<F>(lookup: &F, var: &'static str, default: &str) -> Url
where F: Fn(&'static str) -> Option<String> {
    match non_empty(lookup, var) {
        Some(value) => parse_url(var, &value).unwrap_or_else(|e| {
            error!("🪛️ {e} Using the default, {default}, instead.");
            default_url(default)
        }),
        None => {
            info!("🪛️ {var} is not set. Using the default, {default}.");
            default_url(default)
        },
    }
}

fn value_or_default<F, T, P>(lookup: &F, var: &'static str, default: T, parse: P) -> T
where
    F: Fn(&'static str) -> Option<String>,
    P: Fn(&str) -> Result<T, bf_common::ParseValueError>,
    T: std::fmt::Debug,
{
    let Some(value) = non_empty(lookup, var) else {
        return default;
    };
    parse(&value).map_err(|source| ConfigError::InvalidValue { var, source }).unwrap_or_else(|e| {
        error!("🪛️ {e} Using the default, {default:?}, instead.");
        default
    })
}

fn non_empty<F>(lookup: &F, var: &'static str) -> Option<String>
where F: Fn(&'static str) -> Option<String> {
    lookup(var).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&'static str, &str)]) -> ClientConfig {
        let _ = env_logger::try_init();
        let vars = vars.iter().map(|(k, v)| (*k, v.to_string())).collect::<HashMap<_, _>>();
        ClientConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]);
        assert_eq!(config.hub_url.as_str(), DEFAULT_HUB_URL);
        assert_eq!(config.auth_url.as_str(), DEFAULT_AUTH_URL);
        assert_eq!(config.policy, ReconnectPolicy::default());
        assert!(!config.skip_negotiation);
        assert_eq!(config.keep_alive, Duration::from_secs(15));
        assert_eq!(config.invoke_timeout, Duration::from_secs(30));
        assert!(!config.credentials().is_logged_in());
    }

    #[test]
    fn values_from_environment() {
        let config = config_from(&[
            ("BFEED_HUB_URL", "https://api.example.com/hubs/balance"),
            ("BFEED_ACCESS_TOKEN", "access"),
            ("BFEED_REFRESH_TOKEN", "refresh"),
            ("BFEED_ACCOUNT_ID", " "),
            ("BFEED_USER_ID", "user-1"),
            ("BFEED_MAX_ATTEMPTS", "3"),
            ("BFEED_BACKOFF_BASE_MS", "250"),
            ("BFEED_BACKOFF_MAX_MS", "2000"),
            ("BFEED_SKIP_NEGOTIATION", "true"),
            ("BFEED_KEEP_ALIVE_SECS", "5"),
        ]);
        assert_eq!(config.hub_url.as_str(), "https://api.example.com/hubs/balance");
        let credentials = config.credentials();
        assert!(credentials.is_logged_in());
        assert_eq!(credentials.entity_id().as_deref(), Some("user-1"));
        assert_eq!(config.policy, ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        });
        let options = config.hub_options();
        assert!(options.skip_negotiation);
        assert_eq!(options.keep_alive, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("BFEED_HUB_URL", "ftp://example.com"),
            ("BFEED_AUTH_URL", "not a url"),
            ("BFEED_MAX_ATTEMPTS", "0"),
            ("BFEED_BACKOFF_BASE_MS", "soon"),
            ("BFEED_BACKOFF_MAX_MS", "10"),
        ]);
        assert_eq!(config.hub_url.as_str(), DEFAULT_HUB_URL);
        assert_eq!(config.auth_url.as_str(), DEFAULT_AUTH_URL);
        assert_eq!(config.policy.max_attempts, 5);
        assert_eq!(config.policy.base_delay, Duration::from_secs(1));
        // a cap below the base is raised to the base
        assert_eq!(config.policy.max_delay, Duration::from_secs(1));
    }

    #[test]
    fn url_validation() {
        assert!(parse_url("BFEED_HUB_URL", "wss://hub.example.com/balance").is_ok());
        let err = parse_url("BFEED_HUB_URL", "mailto:me@example.com").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { var: "BFEED_HUB_URL", .. }));
    }
}
