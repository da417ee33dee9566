//! Facilitator server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4021
//! fee_percentage = 0.5
//! fee_address = "$FEE_ADDRESS"
//! session_ttl_secs = 900
//! session_retention_secs = 3600
//! token_mint = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
//!
//! [ledger]
//! url = "http://127.0.0.1:8899/v1/"
//! timeout_secs = 10
//! auth_token = "${LEDGER_TOKEN}"
//!
//! [ledger.retry]
//! max_attempts = 3
//! base_delay_ms = 250
//!
//! [webhook]
//! secret = "$WEBHOOK_SECRET"
//! max_attempts = 3
//! base_delay_ms = 2000
//! timeout_secs = 5
//! ```
//!
//! Without a `[ledger] url` the server runs against an in-memory development ledger.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stakefy::amount::FeeRate;
use stakefy::ledger::RetryPolicy;
use stakefy::session::{DEFAULT_SESSION_RETENTION_SECS, DEFAULT_SESSION_TTL_SECS, SessionConfig};
use url::Url;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level facilitator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4021`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fee charged on sessions and budgets, in percent (default: `0.5`).
    #[serde(default = "default_fee_percentage")]
    pub fee_percentage: Decimal,

    /// Address that receives session fees on settlement.
    #[serde(default)]
    pub fee_address: String,

    /// Seconds a payer has to fund a session (default: 15 minutes).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Seconds an unpaid session is kept past its deadline (default: 1 hour).
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,

    /// SPL token mint advertised in Solana Pay URLs.
    #[serde(default)]
    pub token_mint: Option<String>,

    /// Ledger service.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Webhook delivery.
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Connection to the remote ledger service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Base URL of the ledger service. Unset means the in-memory ledger.
    #[serde(default)]
    pub url: Option<Url>,

    /// Per-request timeout in seconds (default: `10`).
    #[serde(default = "default_ledger_timeout")]
    pub timeout_secs: u64,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Exponential backoff for ledger calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first (default: `3`).
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled after each attempt (default: `250`).
    #[serde(default = "default_ledger_delay")]
    pub base_delay_ms: u64,
}

/// Webhook delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// HMAC-SHA256 key for `X-Stakefy-Signature`. Unset means a plain body hash.
    #[serde(default)]
    pub secret: Option<String>,

    /// Attempts per event (default: `3`).
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled after each attempt (default: `2000`).
    #[serde(default = "default_webhook_delay")]
    pub base_delay_ms: u64,

    /// Per-request timeout in seconds (default: `5`).
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4021
}

fn default_fee_percentage() -> Decimal {
    FeeRate::DEFAULT.percentage()
}

const fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

const fn default_session_retention() -> u64 {
    DEFAULT_SESSION_RETENTION_SECS
}

const fn default_ledger_timeout() -> u64 {
    10
}

const fn default_attempts() -> u32 {
    3
}

const fn default_ledger_delay() -> u64 {
    250
}

const fn default_webhook_delay() -> u64 {
    2000
}

const fn default_webhook_timeout() -> u64 {
    5
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_ledger_timeout(),
            auth_token: None,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            base_delay_ms: default_ledger_delay(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_attempts: default_attempts(),
            base_delay_ms: default_webhook_delay(),
            timeout_secs: default_webhook_timeout(),
        }
    }
}

impl RetryConfig {
    /// Converts into the core retry policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

impl FacilitatorConfig {
    /// Loads configuration from a file path.
    ///
    /// A missing file is not an error: every field has a default. String values
    /// have `$VAR` / `${VAR}` references expanded from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse, or holds
    /// out-of-range values.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?
        } else {
            String::new()
        };
        Self::parse(&expand_vars(&content, |name| std::env::var(name).ok()))
    }

    /// Parses and validates an already expanded TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for syntax errors or out-of-range values.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        FeeRate::from_percentage(self.fee_percentage).map_err(|e| ConfigError::Invalid {
            field: "fee_percentage",
            reason: e.to_string(),
        })?;
        if self.session_ttl_secs == 0 {
            return Err(invalid("session_ttl_secs", "must be at least one second"));
        }
        if self.ledger.retry.max_attempts == 0 {
            return Err(invalid("ledger.retry.max_attempts", "must be at least 1"));
        }
        if self.webhook.max_attempts == 0 {
            return Err(invalid("webhook.max_attempts", "must be at least 1"));
        }
        if self.ledger.timeout_secs == 0 || self.webhook.timeout_secs == 0 {
            return Err(invalid("timeout_secs", "must be at least one second"));
        }
        Ok(())
    }

    /// Builds the settlement core configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the fee percentage is out of range.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let fee_rate =
            FeeRate::from_percentage(self.fee_percentage).map_err(|e| ConfigError::Invalid {
                field: "fee_percentage",
                reason: e.to_string(),
            })?;
        let mut config = SessionConfig::default()
            .with_fee_rate(fee_rate)
            .with_ttl_secs(self.session_ttl_secs)
            .with_retention_secs(self.session_retention_secs)
            .with_fee_address(self.fee_address.trim())
            .with_retry(self.ledger.retry.policy());
        if let Some(mint) = self.token_mint.as_deref().filter(|m| !m.is_empty()) {
            config = config.with_token_mint(mint);
        }
        Ok(config)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

/// Expands `$VAR` and `${VAR}` patterns using `lookup`.
///
/// Unresolved variables are left as-is.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match (name.is_empty(), lookup(&name)) {
            (false, Some(value)) => result.push_str(&value),
            _ => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if braced && !name.is_empty() {
                    result.push('}');
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "FEE_ADDRESS" => Some("FeeWallet".to_owned()),
            "TOKEN" => Some("s3cret".to_owned()),
            _ => None,
        }
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = FacilitatorConfig::parse("").unwrap();
        assert_eq!(config.port, 4021);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.fee_percentage, Decimal::new(5, 1));
        assert_eq!(config.session_ttl_secs, 900);
        assert_eq!(config.session_retention_secs, 3600);
        assert_eq!(config.ledger.url, None);
        assert_eq!(config.ledger.retry.max_attempts, 3);
        assert_eq!(config.webhook.base_delay_ms, 2000);
    }

    #[test]
    fn expands_plain_and_braced_variables() {
        let raw = "fee_address = \"$FEE_ADDRESS\"\n[ledger]\nauth_token = \"${TOKEN}\"\nurl = \"http://x/$MISSING\"\n";
        let expanded = expand_vars(raw, lookup);
        assert!(expanded.contains("\"FeeWallet\""));
        assert!(expanded.contains("\"s3cret\""));
        assert!(expanded.contains("$MISSING"));

        let config = FacilitatorConfig::parse(&expanded).unwrap();
        assert_eq!(config.fee_address, "FeeWallet");
        assert_eq!(config.ledger.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            FacilitatorConfig::parse("fee_percentage = 150"),
            Err(ConfigError::Invalid {
                field: "fee_percentage",
                ..
            })
        ));
        assert!(matches!(
            FacilitatorConfig::parse("[webhook]\nmax_attempts = 0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            FacilitatorConfig::parse("port = \"eighty\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn builds_session_config() {
        let config = FacilitatorConfig::parse(
            "fee_percentage = \"1.5\"\nfee_address = \"Fees\"\ntoken_mint = \"Mint\"\nsession_retention_secs = 60",
        )
        .unwrap();
        let session = config.session_config().unwrap();
        assert_eq!(session.fee_rate.percentage(), Decimal::new(15, 1));
        assert_eq!(session.fee_address, "Fees");
        assert_eq!(session.token_mint.as_deref(), Some("Mint"));
        assert_eq!(session.retention_secs, 60);
    }
}
