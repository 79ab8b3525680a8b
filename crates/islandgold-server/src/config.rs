use std::time::Duration;

use serde::Deserialize;

use islandgold_core::config::{ConfigError, MatchConfig};
use islandgold_core::net::protocol::{MAX_MESSAGE_SIZE, worst_case_snapshot_len};

use crate::match_registry::is_valid_match_id;

/// Config file read from the working directory, if present.
pub const CONFIG_FILE: &str = "islandgold.toml";

/// Top-level server configuration, loaded from `islandgold.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub web_root: String,
    /// Bearer token for the admin endpoints. None = admin endpoints open.
    pub admin_token: Option<String>,
    pub log_format: LogFormat,
    pub limits: LimitsConfig,
    pub matches: MatchesConfig,
    /// Rules applied to every match this server hosts.
    pub game: MatchConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            web_root: "public".to_string(),
            admin_token: None,
            log_format: LogFormat::default(),
            limits: LimitsConfig::default(),
            matches: MatchesConfig::default(),
            game: MatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Inbound frames per second per connection; also the burst size.
    pub ws_rate_limit_per_sec: f64,
    /// Outbound frames queued per connection before it is disconnected.
    pub player_message_buffer: usize,
    pub max_matches: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 200,
            ws_rate_limit_per_sec: 60.0,
            player_message_buffer: 256,
            max_matches: 64,
        }
    }
}

/// Match lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchesConfig {
    /// Match joined by clients connecting to `/ws`.
    pub default_match: String,
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    /// Length of one clock tick. Tests shorten it.
    pub tick_interval_ms: u64,
}

impl Default for MatchesConfig {
    fn default() -> Self {
        Self {
            default_match: "island".to_string(),
            idle_timeout_secs: 600,
            idle_check_interval_secs: 60,
            tick_interval_ms: 1000,
        }
    }
}

impl MatchesConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }
}

impl ServerConfig {
    /// Check every section. The binary refuses to start on error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                field: "listen_addr",
                reason: format!("{:?} is not a socket address", self.listen_addr),
            });
        }
        if self.limits.max_ws_connections == 0 {
            return Err(ConfigError::NotPositive("limits.max_ws_connections"));
        }
        if !(self.limits.ws_rate_limit_per_sec.is_finite() && self.limits.ws_rate_limit_per_sec > 0.0)
        {
            return Err(ConfigError::NotPositive("limits.ws_rate_limit_per_sec"));
        }
        if self.limits.player_message_buffer == 0 {
            return Err(ConfigError::NotPositive("limits.player_message_buffer"));
        }
        if self.limits.max_matches == 0 {
            return Err(ConfigError::NotPositive("limits.max_matches"));
        }
        if !is_valid_match_id(&self.matches.default_match) {
            return Err(ConfigError::Invalid {
                field: "matches.default_match",
                reason: "must be 1-32 characters of [A-Za-z0-9_-]".to_string(),
            });
        }
        if self.matches.idle_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("matches.idle_timeout_secs"));
        }
        if self.matches.idle_check_interval_secs == 0 {
            return Err(ConfigError::NotPositive("matches.idle_check_interval_secs"));
        }
        if self.matches.tick_interval_ms == 0 {
            return Err(ConfigError::NotPositive("matches.tick_interval_ms"));
        }
        if self.admin_token.as_deref() == Some("") {
            return Err(ConfigError::Invalid {
                field: "admin_token",
                reason: "must not be empty".to_string(),
            });
        }
        self.game.validate()?;
        // Every connection may end up in one match, and a joiner's snapshot
        // has to fit in a single frame.
        let snapshot_len = worst_case_snapshot_len(
            self.limits.max_ws_connections,
            self.game.treasure_count,
        )
        .map_err(|e| ConfigError::Invalid {
            field: "limits.max_ws_connections",
            reason: e.to_string(),
        })?;
        if snapshot_len > MAX_MESSAGE_SIZE {
            return Err(ConfigError::Invalid {
                field: "limits.max_ws_connections",
                reason: format!(
                    "a snapshot for {} players and {} treasures can reach {snapshot_len} bytes, over the {MAX_MESSAGE_SIZE}-byte frame limit",
                    self.limits.max_ws_connections, self.game.treasure_count
                ),
            });
        }
        Ok(())
    }

    /// Load config from `islandgold.toml` if it exists, then apply env var
    /// overrides. A missing file means defaults; a malformed one is an error.
    /// Runs before logging is set up, so nothing here logs.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(CONFIG_FILE) {
            Ok(content) => Self::from_toml(&content)?,
            Err(_) => ServerConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Invalid {
            field: CONFIG_FILE,
            reason: e.to_string(),
        })
    }

    /// Apply `ISLANDGOLD_*` overrides. Unparseable numbers are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("ISLANDGOLD_LISTEN_ADDR")
            && !addr.is_empty()
        {
            self.listen_addr = addr;
        }
        if let Some(root) = var("ISLANDGOLD_WEB_ROOT")
            && !root.is_empty()
        {
            self.web_root = root;
        }
        if let Some(token) = var("ISLANDGOLD_ADMIN_TOKEN")
            && !token.is_empty()
        {
            self.admin_token = Some(token);
        }
        if let Some(val) = var("ISLANDGOLD_LOG_FORMAT") {
            match val.as_str() {
                "json" => self.log_format = LogFormat::Json,
                "pretty" => self.log_format = LogFormat::Pretty,
                _ => {},
            }
        }
        if let Some(val) = var("ISLANDGOLD_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.max_ws_connections = n;
        }
        if let Some(val) = var("ISLANDGOLD_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            self.limits.ws_rate_limit_per_sec = n;
        }
        if let Some(val) = var("ISLANDGOLD_MATCH_DURATION")
            && let Ok(n) = val.parse::<u32>()
        {
            self.game.duration_secs = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use islandgold_core::config::StartPolicy;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
        assert_eq!(cfg.web_root, "public");
        assert!(cfg.admin_token.is_none());
        assert_eq!(cfg.matches.default_match, "island");
        assert_eq!(cfg.game.duration_secs, 300);
    }

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_minimal_toml() {
        let toml_str = r#"
listen_addr = "127.0.0.1:9090"
admin_token = "secret123"

[game]
duration_secs = 120
start_policy = "first_ready"
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9090");
        assert_eq!(cfg.admin_token.as_deref(), Some("secret123"));
        assert_eq!(cfg.game.duration_secs, 120);
        assert_eq!(cfg.game.start_policy, StartPolicy::FirstReady);
        assert_eq!(cfg.game.treasure_count, 50);
        assert_eq!(cfg.limits.max_ws_connections, 200);
    }

    #[test]
    fn parse_limits_and_matches_toml() {
        let toml_str = r#"
log_format = "json"

[limits]
max_ws_connections = 300
ws_rate_limit_per_sec = 100.0
player_message_buffer = 512
max_matches = 8

[matches]
default_match = "lagoon"
idle_timeout_secs = 7200
idle_check_interval_secs = 120
tick_interval_ms = 250
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.limits.max_ws_connections, 300);
        assert!((cfg.limits.ws_rate_limit_per_sec - 100.0).abs() < f64::EPSILON);
        assert_eq!(cfg.limits.player_message_buffer, 512);
        assert_eq!(cfg.limits.max_matches, 8);
        assert_eq!(cfg.matches.default_match, "lagoon");
        assert_eq!(cfg.matches.idle_timeout_secs, 7200);
        assert_eq!(cfg.matches.tick_interval(), Duration::from_millis(250));
        cfg.validate().unwrap();
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let err = ServerConfig::from_toml("listen_addr = [").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: CONFIG_FILE, .. }));
        assert!(ServerConfig::from_toml("").is_ok());
    }

    #[test]
    fn validate_rejects_invalid_addr() {
        let cfg = ServerConfig {
            listen_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "listen_addr",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut cfg = ServerConfig::default();
        cfg.limits.player_message_buffer = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive("limits.player_message_buffer"))
        );

        let mut cfg = ServerConfig::default();
        cfg.matches.tick_interval_ms = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NotPositive("matches.tick_interval_ms"))
        );
    }

    #[test]
    fn validate_rejects_bad_default_match() {
        let mut cfg = ServerConfig::default();
        cfg.matches.default_match = "no spaces".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_caps_whose_snapshot_cannot_fit() {
        let mut cfg = ServerConfig::default();
        cfg.game.treasure_count = 500;
        cfg.limits.max_ws_connections = 400;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "limits.max_ws_connections",
                ..
            })
        ));

        cfg.limits.max_ws_connections = 100;
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_checks_game_rules() {
        let mut cfg = ServerConfig::default();
        cfg.game.duration_secs = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::NotPositive("duration_secs")));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(env(&[
            ("ISLANDGOLD_LISTEN_ADDR", "127.0.0.1:4000"),
            ("ISLANDGOLD_ADMIN_TOKEN", "tok"),
            ("ISLANDGOLD_MAX_WS_CONNECTIONS", "12"),
            ("ISLANDGOLD_WS_RATE_LIMIT", "5.5"),
            ("ISLANDGOLD_MATCH_DURATION", "90"),
            ("ISLANDGOLD_LOG_FORMAT", "json"),
        ]));
        assert_eq!(cfg.listen_addr, "127.0.0.1:4000");
        assert_eq!(cfg.admin_token.as_deref(), Some("tok"));
        assert_eq!(cfg.limits.max_ws_connections, 12);
        assert!((cfg.limits.ws_rate_limit_per_sec - 5.5).abs() < f64::EPSILON);
        assert_eq!(cfg.game.duration_secs, 90);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(env(&[
            ("ISLANDGOLD_MAX_WS_CONNECTIONS", "lots"),
            ("ISLANDGOLD_LISTEN_ADDR", ""),
        ]));
        assert_eq!(cfg.limits.max_ws_connections, 200);
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    }
}
