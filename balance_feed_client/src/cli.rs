use std::{env, env::VarError};

use balance_feed_engine::normalize;
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(version, about = "Keeps a merchant's balance in sync with the balance hub")]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the balance hub and print balance and connection changes until Ctrl-C.
    ///
    /// On unix, SIGUSR1 sends the feed to the background (disconnect) and SIGUSR2 brings it back (reconnect).
    #[clap(name = "watch")]
    Watch,
    /// Exchange the configured refresh token for a new token pair once.
    #[clap(name = "refresh")]
    Refresh,
    /// Show how a balance payload would be interpreted.
    #[clap(name = "normalize")]
    Normalize {
        /// The payload, as JSON. e.g. '{"balance": 12.5}'
        payload: String,
    },
    /// Print the current (non-secret) configuration variables.
    #[clap(name = "env")]
    Env,
}

/// Parses `payload` as JSON, falling back to treating it as a plain string, and returns the normalized balance.
pub fn normalize_payload(payload: &str) -> f64 {
    let value = serde_json::from_str::<Value>(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    normalize(&value)
}

pub fn display_envs() {
    // Be explicit about which envars to print, so as to avoid accidentally exposing tokens
    const DISPLAY_ENVS: [&str; 11] = [
        "RUST_LOG",
        "BFEED_HUB_URL",
        "BFEED_AUTH_URL",
        "BFEED_ACCOUNT_ID",
        "BFEED_USER_ID",
        "BFEED_MAX_ATTEMPTS",
        "BFEED_BACKOFF_BASE_MS",
        "BFEED_BACKOFF_MAX_MS",
        "BFEED_SKIP_NEGOTIATION",
        "BFEED_KEEP_ALIVE_SECS",
        "BFEED_INVOKE_TIMEOUT_SECS",
    ];

    println!("Current environment values (EXCLUDING variables that contain secrets):");
    DISPLAY_ENVS.iter().for_each(|&name| {
        let val = match env::var(name) {
            Ok(s) => s,
            Err(VarError::NotPresent) => "Not set".into(),
            Err(VarError::NotUnicode(s)) => format!("Invalid value: {}", s.to_string_lossy()),
        };
        println!("  {name:<35} {val:<15}");
    });
    for secret in ["BFEED_ACCESS_TOKEN", "BFEED_REFRESH_TOKEN"] {
        let state = if env::var(secret).is_ok_and(|s| !s.trim().is_empty()) { "Set" } else { "Not set" };
        println!("  {secret:<35} {state:<15}");
    }
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Arguments::command().debug_assert();
    }

    #[test]
    fn parse_normalize() {
        let args = Arguments::try_parse_from(["balance_feed", "normalize", "{\"amount\": 4}"]).unwrap();
        match args.command {
            Command::Normalize { payload } => assert_eq!(normalize_payload(&payload), 4.0),
            other => panic!("Unexpected command {other:?}"),
        }
        assert_eq!(normalize_payload("12.5"), 12.5);
        assert_eq!(normalize_payload("not json"), 0.0);
    }
}
