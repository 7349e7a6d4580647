//! Runtime configuration.
//!
//! Every value defaults to the reference policy, so an empty or missing
//! config file yields a working setup. Resolution order: explicit path,
//! `CHATLINK_CONFIG`, `./chatlink.toml`, defaults; env overrides apply last.

use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ChatlinkError, Result};

const CONFIG_ENV: &str = "CHATLINK_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "chatlink.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatlinkConfig {
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub identity: IdentityConfig,
    pub context: ContextConfig,
}

/// Requests allowed per window for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RatePolicy {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub message: RatePolicy,
    pub auth: RatePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message: RatePolicy::new(30, 60),
            auth: RatePolicy::new(5, 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted.
    pub idle_ttl_secs: u64,
    /// Cadence of the background sweep.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::seconds(self.idle_ttl_secs as i64)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub code_ttl_secs: u64,
    pub code_length: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 10 * 60,
            code_length: 6,
        }
    }
}

impl IdentityConfig {
    pub fn code_ttl(&self) -> Duration {
        Duration::seconds(self.code_ttl_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Summarize once live turns exceed this many characters...
    pub length_threshold: usize,
    /// ...or this many turns,
    pub count_threshold: usize,
    /// provided there are more than this many turns.
    pub min_turns: usize,
    /// Most recent turns kept verbatim after summarizing.
    pub retained_turns: usize,
    pub max_summary_chars: usize,
    pub summary_display_chars: usize,
    pub recent_display_chars: usize,
    pub fragment_max_chars: usize,
    /// IANA timezone that defines the conversation day.
    pub timezone: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            length_threshold: 1500,
            count_threshold: 6,
            min_turns: 2,
            retained_turns: 2,
            max_summary_chars: 1000,
            summary_display_chars: 800,
            recent_display_chars: 1000,
            fragment_max_chars: 2000,
            timezone: "UTC".to_string(),
        }
    }
}

impl ContextConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ChatlinkError::Config(format!("unknown timezone '{}'", self.timezone)))
    }
}

impl ChatlinkConfig {
    /// Load configuration, optionally from an explicit file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ChatlinkError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ChatlinkError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(timezone) = env::var("CHATLINK_TIMEZONE") {
            self.context.timezone = timezone;
        }
        if let Some(limit) = env_u32("CHATLINK_MESSAGE_LIMIT") {
            self.rate_limit.message.max_requests = limit;
        }
        if let Some(limit) = env_u32("CHATLINK_AUTH_LIMIT") {
            self.rate_limit.auth.max_requests = limit;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, policy) in [
            ("message", &self.rate_limit.message),
            ("auth", &self.rate_limit.auth),
        ] {
            if policy.max_requests == 0 || policy.window_secs == 0 {
                return Err(ChatlinkError::Config(format!(
                    "rate_limit.{name} needs a non-zero max_requests and window_secs"
                )));
            }
        }
        if self.session.idle_ttl_secs == 0 || self.session.sweep_interval_secs == 0 {
            return Err(ChatlinkError::Config(
                "session.idle_ttl_secs and session.sweep_interval_secs must be non-zero".into(),
            ));
        }
        if self.identity.code_length == 0 || self.identity.code_ttl_secs == 0 {
            return Err(ChatlinkError::Config(
                "identity.code_length and identity.code_ttl_secs must be non-zero".into(),
            ));
        }
        let context = &self.context;
        if context.retained_turns == 0 || context.retained_turns > context.min_turns {
            return Err(ChatlinkError::Config(format!(
                "context.retained_turns must be between 1 and min_turns ({})",
                context.min_turns
            )));
        }
        context.tz()?;
        Ok(())
    }
}

fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let local = Path::new(DEFAULT_CONFIG_FILE);
    local.exists().then(|| local.to_path_buf())
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|value| value.parse::<u32>().ok())
}
