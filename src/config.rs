//! Fleetcast configuration
//!
//! Configuration comes from environment variables, with command-line
//! overrides applied by the binary. Only the two secrets are required.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

/// Default provider callback origins (Paystack's published webhook addresses)
pub const DEFAULT_WEBHOOK_ALLOWLIST: &str = "52.31.139.75,52.49.173.169,52.214.14.220";

/// Fleetcast configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP and WebSocket listen address
    pub bind: SocketAddr,
    /// HS256 secret for bearer tokens
    pub token_secret: String,
    /// Shared secret the payment provider signs callbacks with
    pub webhook_secret: String,
    /// Addresses allowed to deliver provider callbacks
    pub webhook_allowlist: Vec<IpAddr>,
    /// Platform share of every booking price, in `[0, 1]`
    pub platform_cut: Decimal,
    /// Drivers whose wallet is below this (non-positive) balance get no new bookings
    pub wallet_floor: Decimal,
    /// Period of the location broadcaster
    pub broadcast_interval: Duration,
    /// Upper bound on one booking's work inside a broadcast cycle
    pub broadcast_lookup_timeout: Duration,
    /// PostgreSQL connection string for cross-process fan-out
    pub database_url: Option<String>,
    /// Payment provider API base URL
    pub provider_url: String,
    /// Payment provider request timeout
    pub provider_timeout: Duration,
    /// Optional JSON file seeding the user directory and wallets
    pub directory_file: Option<PathBuf>,
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token_secret = required(&lookup, "FLEETCAST_TOKEN_SECRET")?;
        let webhook_secret = required(&lookup, "FLEETCAST_WEBHOOK_SECRET")?;

        let bind = parsed(&lookup, "FLEETCAST_BIND", "expected socket address")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let allowlist = lookup("FLEETCAST_WEBHOOK_ALLOWLIST")
            .unwrap_or_else(|| DEFAULT_WEBHOOK_ALLOWLIST.to_string());
        let webhook_allowlist = parse_allowlist(&allowlist).ok_or(ConfigError::InvalidEnv(
            "FLEETCAST_WEBHOOK_ALLOWLIST",
            "expected comma separated IP addresses",
        ))?;

        let platform_cut: Decimal = parsed(&lookup, "FLEETCAST_PLATFORM_CUT", "expected decimal")?
            .unwrap_or_else(|| Decimal::new(30, 2));
        if platform_cut < Decimal::ZERO || platform_cut > Decimal::ONE {
            return Err(ConfigError::InvalidEnv(
                "FLEETCAST_PLATFORM_CUT",
                "must be between 0 and 1",
            ));
        }

        let wallet_floor: Decimal = parsed(&lookup, "FLEETCAST_WALLET_FLOOR", "expected decimal")?
            .unwrap_or_else(|| Decimal::new(-5000, 0));
        if wallet_floor > Decimal::ZERO {
            return Err(ConfigError::InvalidEnv(
                "FLEETCAST_WALLET_FLOOR",
                "must not be positive",
            ));
        }

        let interval_secs: u64 = parsed(
            &lookup,
            "FLEETCAST_BROADCAST_INTERVAL_SECS",
            "expected seconds",
        )?
        .unwrap_or(5);
        if interval_secs == 0 {
            return Err(ConfigError::InvalidEnv(
                "FLEETCAST_BROADCAST_INTERVAL_SECS",
                "must be at least 1",
            ));
        }

        let lookup_timeout_ms: u64 = parsed(
            &lookup,
            "FLEETCAST_BROADCAST_LOOKUP_TIMEOUT_MS",
            "expected milliseconds",
        )?
        .unwrap_or(500);

        let provider_timeout_ms: u64 = parsed(
            &lookup,
            "FLEETCAST_PROVIDER_TIMEOUT_MS",
            "expected milliseconds",
        )?
        .unwrap_or(10_000);

        Ok(Self {
            bind,
            token_secret,
            webhook_secret,
            webhook_allowlist,
            platform_cut,
            wallet_floor,
            broadcast_interval: Duration::from_secs(interval_secs),
            broadcast_lookup_timeout: Duration::from_millis(lookup_timeout_ms),
            database_url: lookup("FLEETCAST_DATABASE_URL").filter(|url| !url.is_empty()),
            provider_url: lookup("FLEETCAST_PROVIDER_URL")
                .unwrap_or_else(|| "https://api.paystack.co".to_string()),
            provider_timeout: Duration::from_millis(provider_timeout_ms),
            directory_file: lookup("FLEETCAST_DIRECTORY_FILE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        })
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingEnv(key))
}

fn parsed<F, T>(lookup: &F, key: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(key, expected)),
        _ => Ok(None),
    }
}

fn parse_allowlist(raw: &str) -> Option<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.parse().ok())
        .collect()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
