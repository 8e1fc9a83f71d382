//! Utility functions

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

use crate::deploy::process::{tool_available, TokioProcessRunner};
use crate::storage::settings::RuntimeSettings;

/// Version information for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Availability of the external tools the agent shells out to
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub version: VersionInfo,
    pub docker: bool,
    pub git: bool,
    pub nixpacks: bool,
}

/// Check external tooling and print the result as JSON
pub async fn run_diagnostic(runtime: &RuntimeSettings) -> Diagnostic {
    let runner = TokioProcessRunner;
    let diagnostic = Diagnostic {
        version: version_info(),
        docker: tool_available(&runner, &runtime.docker_bin, "--version").await,
        git: tool_available(&runner, &runtime.git_bin, "--version").await,
        nixpacks: tool_available(&runner, "nixpacks", "--version").await,
    };
    match serde_json::to_string_pretty(&diagnostic) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to render diagnostic: {}", e),
    }
    diagnostic
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// First eight characters of an identifier, for image tags and log lines
pub fn short_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase()
}

/// A cloneable credential that never prints its value
#[derive(Clone)]
pub struct SecretToken(Arc<SecretString>);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(value.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for SecretToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretToken::new)
    }
}
