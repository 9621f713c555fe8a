use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Delay before `pull_request` handlers run, so GitHub has time to generate a
/// fresh archive of the branch.
pub const DEFAULT_PULL_REQUEST_DELAY_MS: u64 = 15_000;

pub const DEFAULT_START_COMMAND: &str = "npm install && npm start";

#[derive(Clone)]
pub struct Config {
    pub github_token: String,
    pub github_webhook_secret: String,
    /// Domain used when building preview links.
    pub link_domain: String,
    /// Host handed to started sites as `HOST`.
    pub internal_ip_override: Option<String>,
    pub webhook_port: u16,
    pub min_port: u16,
    pub max_port: u16,
    /// Ports per instance block. `None` means a single port.
    pub max_consecutive: Option<usize>,
    /// Instances idle longer than this are reaped. Zero disables the reaper.
    pub instance_open_hours: u64,
    /// Root under which each instance's artifacts live.
    pub site_root: PathBuf,
    pub start_command: String,
    pub pull_request_delay: Duration,
    /// Optional bearer token for the /status endpoint.
    /// If not set, /status is disabled (returns 403 Forbidden).
    pub status_auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| parse_optional_value(lookup(key));
        let required = |key: &str| {
            optional(key).with_context(|| format!("{} environment variable is required", key))
        };

        let github_token = required("GITHUB_TOKEN")?;
        let github_webhook_secret = required("GITHUB_WEBHOOK_SECRET")?;
        let link_domain = required("LINK_DOMAIN")?;

        let min_port: u16 = parse_number("MIN_PORT", &required("MIN_PORT")?)?;
        let max_port: u16 = parse_number("MAX_PORT", &required("MAX_PORT")?)?;
        if min_port > max_port {
            bail!(
                "MIN_PORT ({}) must not be greater than MAX_PORT ({})",
                min_port,
                max_port
            );
        }

        let max_consecutive = optional("MAX_CONSECUTIVE")
            .map(|raw| parse_number::<usize>("MAX_CONSECUTIVE", &raw))
            .transpose()?;
        if max_consecutive == Some(0) {
            bail!("MAX_CONSECUTIVE must be at least 1");
        }

        let webhook_port = optional("WEBHOOK_PORT")
            .map(|raw| parse_number("WEBHOOK_PORT", &raw))
            .transpose()?
            .unwrap_or(3000);

        let instance_open_hours = optional("INSTANCE_OPEN_HOURS")
            .map(|raw| parse_number("INSTANCE_OPEN_HOURS", &raw))
            .transpose()?
            .unwrap_or(0);

        let pull_request_delay_ms = optional("PULL_REQUEST_DELAY_MS")
            .map(|raw| parse_number("PULL_REQUEST_DELAY_MS", &raw))
            .transpose()?
            .unwrap_or(DEFAULT_PULL_REQUEST_DELAY_MS);

        let site_root = optional("SITE_INSTANCES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./site_instances"));

        let start_command =
            optional("SITE_START_COMMAND").unwrap_or_else(|| DEFAULT_START_COMMAND.to_string());

        Ok(Config {
            github_token,
            github_webhook_secret,
            link_domain,
            internal_ip_override: optional("INTERNAL_IP_OVERRIDE"),
            webhook_port,
            min_port,
            max_port,
            max_consecutive,
            instance_open_hours,
            site_root,
            start_command,
            pull_request_delay: Duration::from_millis(pull_request_delay_ms),
            status_auth_token: optional("STATUS_AUTH_TOKEN"),
        })
    }

    /// Number of ports reserved for each instance.
    pub fn block_size(&self) -> usize {
        self.max_consecutive.unwrap_or(1)
    }

    pub fn idle_threshold(&self) -> Option<chrono::Duration> {
        if self.instance_open_hours == 0 {
            return None;
        }
        i64::try_from(self.instance_open_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
    }
}

/// Parse an optional variable value.
///
/// Returns None if the value is missing, empty, or contains only whitespace.
/// This prevents an empty token from being accepted as a real credential.
pub fn parse_optional_value(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{} must be a valid number", key))
}
