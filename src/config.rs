//! Environment-driven configuration.

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RELAY_TURN_SECONDS: i64 = 60;
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_RECENT_MESSAGES: usize = 50;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Runtime knobs, read once at startup.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub database_url: Option<String>,
    /// SQLx pool size when `database_url` is set.
    pub db_max_connections: u32,
    /// Relay turn budget in seconds for newly created rooms.
    pub relay_turn_seconds: i64,
    /// Per-connection outbound queue depth; overflow drops messages.
    pub queue_capacity: usize,
    /// Chat history length in `room_state` snapshots.
    pub recent_messages: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            relay_turn_seconds: DEFAULT_RELAY_TURN_SECONDS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            recent_messages: DEFAULT_RECENT_MESSAGES,
        }
    }
}

impl HubConfig {
    /// Build from environment variables, falling back to defaults on
    /// missing or unparseable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parsed("PORT").unwrap_or(defaults.port),
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: env_parsed("DB_MAX_CONNECTIONS")
                .filter(|c| *c > 0)
                .unwrap_or(defaults.db_max_connections),
            relay_turn_seconds: env_parsed("RELAY_TURN_SECONDS")
                .filter(|s| *s > 0)
                .unwrap_or(defaults.relay_turn_seconds),
            queue_capacity: env_parsed("WS_QUEUE_CAPACITY")
                .filter(|c| *c > 0)
                .unwrap_or(defaults.queue_capacity),
            recent_messages: defaults.recent_messages,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
