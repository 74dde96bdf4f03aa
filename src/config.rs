//! Gateway configuration module
//!
//! Handles loading configuration from environment variables.

use crate::error::GatewayError;
use crate::protocol::DEFAULT_GATEWAY_URL;
use crate::shard::{ShardConfig, ShardingMode, DEFAULT_GROUP_DELAY};
use std::env;
use std::time::Duration;
use twilight_model::gateway::Intents;

/// Accepted `LARGE_THRESHOLD` values
const LARGE_THRESHOLD_RANGE: std::ops::RangeInclusive<u32> = 50..=250;

/// Gateway configuration
#[derive(Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    pub intents: Intents,

    pub sharding: ShardingMode,

    /// Start shards even when the session start budget is exhausted
    pub ignore_session_limit: bool,

    /// Member count above which guilds are sent without offline members
    pub large_threshold: Option<u32>,

    /// Gateway base URL used when no resume URL is known
    pub gateway_url: String,

    /// Pause between shard startup groups
    pub group_delay: Duration,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("discord_token", &"<redacted>")
            .field("intents", &self.intents)
            .field("sharding", &self.sharding)
            .field("ignore_session_limit", &self.ignore_session_limit)
            .field("large_threshold", &self.large_threshold)
            .field("gateway_url", &self.gateway_url)
            .field("group_delay", &self.group_delay)
            .field("http_port", &self.http_port)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables (and `.env`)
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let discord_token = lookup("DISCORD_TOKEN")
            .or_else(|| lookup("DISCORD_BOT_TOKEN"))
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let intents = match lookup("INTENTS") {
            Some(raw) => parse_intents(&raw)?,
            None => Self::default_intents(),
        };

        let sharding = parse_sharding(
            lookup("SHARDING").as_deref(),
            lookup("SHARD_COUNT").as_deref(),
            lookup("SHARD_IDS").as_deref(),
        )?;

        let ignore_session_limit = match lookup("IGNORE_SESSION_LIMIT") {
            Some(raw) => parse_bool("IGNORE_SESSION_LIMIT", &raw)?,
            None => false,
        };

        let large_threshold = lookup("LARGE_THRESHOLD")
            .map(|raw| {
                let value: u32 = raw.trim().parse().map_err(|e| {
                    GatewayError::Config(format!("LARGE_THRESHOLD must be a valid number: {e}"))
                })?;
                if LARGE_THRESHOLD_RANGE.contains(&value) {
                    Ok(value)
                } else {
                    Err(GatewayError::Config(format!(
                        "LARGE_THRESHOLD must be between 50 and 250, got {value}"
                    )))
                }
            })
            .transpose()?;

        let gateway_url = lookup("GATEWAY_URL").unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());

        let group_delay = match lookup("STARTUP_GROUP_DELAY_MS") {
            Some(raw) => Duration::from_millis(raw.trim().parse().map_err(|e| {
                GatewayError::Config(format!("STARTUP_GROUP_DELAY_MS must be a valid number: {e}"))
            })?),
            None => DEFAULT_GROUP_DELAY,
        };

        let http_port = lookup("HTTP_PORT")
            .or_else(|| lookup("METRICS_PORT")) // Backwards compat
            .unwrap_or_else(|| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            discord_token,
            intents,
            sharding,
            ignore_session_limit,
            large_threshold,
            gateway_url,
            group_delay,
            http_port,
            log_level,
        })
    }

    /// Intents used when `INTENTS` is not set
    pub fn default_intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MESSAGES
    }

    /// Per-shard connection settings
    pub fn shard_config(&self) -> ShardConfig {
        let config = ShardConfig::new(self.discord_token.clone(), self.intents)
            .with_gateway_url(self.gateway_url.clone());
        match self.large_threshold {
            Some(threshold) => config.with_large_threshold(threshold),
            None => config,
        }
    }
}

/// Parse an intents bitmask or a `|`-separated list of intent names
fn parse_intents(raw: &str) -> Result<Intents, GatewayError> {
    let raw = raw.trim();
    if let Ok(bits) = raw.parse::<u64>() {
        return Intents::from_bits(bits)
            .ok_or_else(|| GatewayError::Config(format!("INTENTS contains unknown bits: {bits}")));
    }

    raw.split('|')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .try_fold(Intents::empty(), |intents, name| {
            Intents::from_name(&name.to_ascii_uppercase())
                .map(|intent| intents | intent)
                .ok_or_else(|| GatewayError::Config(format!("unknown intent: {name}")))
        })
}

fn parse_sharding(
    mode: Option<&str>,
    count: Option<&str>,
    ids: Option<&str>,
) -> Result<ShardingMode, GatewayError> {
    match mode.map(str::trim).unwrap_or("auto") {
        "auto" => Ok(ShardingMode::Auto),
        "disabled" | "none" => Ok(ShardingMode::Disabled),
        "manual" => {
            let count: u32 = count
                .ok_or_else(|| GatewayError::Config("SHARD_COUNT must be set for manual sharding".to_string()))?
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("SHARD_COUNT must be a valid number: {e}")))?;
            if count == 0 {
                return Err(GatewayError::Config("SHARD_COUNT must be at least 1".to_string()));
            }

            let ids = match ids {
                Some(raw) => raw
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(|id| {
                        let id: u32 = id.parse().map_err(|e| {
                            GatewayError::Config(format!("SHARD_IDS must be numbers: {e}"))
                        })?;
                        if id >= count {
                            return Err(GatewayError::Config(format!(
                                "shard id {id} is out of range for SHARD_COUNT {count}"
                            )));
                        }
                        Ok(id)
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                None => Vec::new(),
            };

            Ok(ShardingMode::Manual { ids, count })
        }
        other => Err(GatewayError::Config(format!(
            "SHARDING must be auto, disabled or manual, got {other}"
        ))),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, GatewayError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(GatewayError::Config(format!("{key} must be a boolean, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<GatewayConfig, GatewayError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DISCORD_TOKEN", "token")]).unwrap();
        assert_eq!(config.intents, Intents::GUILDS | Intents::GUILD_MESSAGES);
        assert_eq!(config.sharding, ShardingMode::Auto);
        assert!(!config.ignore_session_limit);
        assert_eq!(config.large_threshold, None);
        assert_eq!(config.gateway_url, DEFAULT_GATEWAY_URL);
        assert_eq!(config.group_delay, Duration::from_secs(5));
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_token_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("DISCORD_TOKEN"));

        let config = load(&[("DISCORD_BOT_TOKEN", "fallback")]).unwrap();
        assert_eq!(config.discord_token, "fallback");
    }

    #[test]
    fn test_intents_by_name_and_bits() {
        let config = load(&[
            ("DISCORD_TOKEN", "token"),
            ("INTENTS", "guilds | guild_members|MESSAGE_CONTENT"),
        ])
        .unwrap();
        assert_eq!(
            config.intents,
            Intents::GUILDS | Intents::GUILD_MEMBERS | Intents::MESSAGE_CONTENT
        );

        let config = load(&[("DISCORD_TOKEN", "token"), ("INTENTS", "513")]).unwrap();
        assert_eq!(config.intents, Intents::GUILDS | Intents::GUILD_MESSAGES);

        assert!(load(&[("DISCORD_TOKEN", "token"), ("INTENTS", "GUILDZ")]).is_err());
    }

    #[test]
    fn test_manual_sharding() {
        let config = load(&[
            ("DISCORD_TOKEN", "token"),
            ("SHARDING", "manual"),
            ("SHARD_COUNT", "4"),
            ("SHARD_IDS", "1, 3"),
        ])
        .unwrap();
        assert_eq!(
            config.sharding,
            ShardingMode::Manual {
                ids: vec![1, 3],
                count: 4
            }
        );

        assert!(load(&[("DISCORD_TOKEN", "token"), ("SHARDING", "manual")]).is_err());
        assert!(load(&[
            ("DISCORD_TOKEN", "token"),
            ("SHARDING", "manual"),
            ("SHARD_COUNT", "2"),
            ("SHARD_IDS", "2"),
        ])
        .is_err());
    }

    #[test]
    fn test_disabled_sharding_and_flags() {
        let config = load(&[
            ("DISCORD_TOKEN", "token"),
            ("SHARDING", "disabled"),
            ("IGNORE_SESSION_LIMIT", "true"),
            ("LARGE_THRESHOLD", "100"),
            ("STARTUP_GROUP_DELAY_MS", "6000"),
        ])
        .unwrap();
        assert_eq!(config.sharding, ShardingMode::Disabled);
        assert!(config.ignore_session_limit);
        assert_eq!(config.large_threshold, Some(100));
        assert_eq!(config.group_delay, Duration::from_secs(6));
    }

    #[test]
    fn test_large_threshold_bounds() {
        assert!(load(&[("DISCORD_TOKEN", "token"), ("LARGE_THRESHOLD", "49")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "token"), ("LARGE_THRESHOLD", "251")]).is_err());
    }

    #[test]
    fn test_debug_hides_token() {
        let config = load(&[("DISCORD_TOKEN", "very-secret")]).unwrap();
        assert!(!format!("{config:?}").contains("very-secret"));
    }
}
