use crate::error::{BrokerError, BrokerResult};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable holding the runner shared secret. Re-read at every
/// runner upgrade rather than captured at boot, so the secret can be rotated
/// without restarting the broker.
pub const RUNNER_SHARED_SECRET_VAR: &str = "RUNNER_SHARED_SECRET";

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub runner_shared_secret: String,
    #[serde(default)]
    pub use_ws_proxy: bool,

    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_batch_max_entries")]
    pub batch_max_entries: usize,

    #[serde(default = "default_runner_ping_interval")]
    pub runner_ping_interval_secs: u64,
    #[serde(default = "default_runner_sweep_interval")]
    pub runner_sweep_interval_secs: u64,
    #[serde(default = "default_runner_stale_timeout")]
    pub runner_stale_timeout_secs: u64,

    #[serde(default = "default_client_heartbeat_interval")]
    pub client_heartbeat_interval_secs: u64,
    #[serde(default = "default_client_stale_timeout")]
    pub client_stale_timeout_secs: u64,

    #[serde(default = "default_queue_sweep_interval")]
    pub queue_sweep_interval_secs: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_command_ttl_ms")]
    pub command_ttl_ms: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    #[serde(default = "default_hmr_connect_timeout")]
    pub hmr_connect_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_batch_delay_ms() -> u64 {
    200
}
fn default_batch_max_entries() -> usize {
    10
}
fn default_runner_ping_interval() -> u64 {
    30
}
fn default_runner_sweep_interval() -> u64 {
    60
}
fn default_runner_stale_timeout() -> u64 {
    90
}
fn default_client_heartbeat_interval() -> u64 {
    30
}
fn default_client_stale_timeout() -> u64 {
    60
}
fn default_queue_sweep_interval() -> u64 {
    30
}
fn default_max_queue_size() -> usize {
    100
}
fn default_command_ttl_ms() -> u64 {
    300_000
} // 5 minutes
fn default_max_delivery_attempts() -> u32 {
    3
}
fn default_proxy_timeout() -> u64 {
    30
}
fn default_hmr_connect_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    pub fn from_env() -> BrokerResult<Self> {
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()
            .map_err(|e| BrokerError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BrokerResult<()> {
        if self.runner_shared_secret.is_empty() {
            return Err(BrokerError::Config(
                "RUNNER_SHARED_SECRET must be set to a non-empty value".to_string(),
            ));
        }

        if self.max_queue_size == 0 {
            return Err(BrokerError::Config(
                "MAX_QUEUE_SIZE must be > 0".to_string(),
            ));
        }

        if self.max_delivery_attempts == 0 {
            return Err(BrokerError::Config(
                "MAX_DELIVERY_ATTEMPTS must be > 0".to_string(),
            ));
        }

        if self.command_ttl_ms == 0 {
            return Err(BrokerError::Config("COMMAND_TTL_MS must be > 0".to_string()));
        }

        if self.runner_stale_timeout_secs <= self.runner_ping_interval_secs {
            return Err(BrokerError::Config(
                "RUNNER_STALE_TIMEOUT_SECS must be greater than RUNNER_PING_INTERVAL_SECS"
                    .to_string(),
            ));
        }

        if self.client_stale_timeout_secs <= self.client_heartbeat_interval_secs {
            return Err(BrokerError::Config(
                "CLIENT_STALE_TIMEOUT_SECS must be greater than CLIENT_HEARTBEAT_INTERVAL_SECS"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// The shared secret as currently present in the environment. Falls back
    /// to the boot-time value so tests can construct a Config directly.
    pub fn current_runner_secret(&self) -> String {
        std::env::var(RUNNER_SHARED_SECRET_VAR)
            .unwrap_or_else(|_| self.runner_shared_secret.clone())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn runner_ping_interval(&self) -> Duration {
        Duration::from_secs(self.runner_ping_interval_secs)
    }

    pub fn runner_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.runner_sweep_interval_secs)
    }

    pub fn runner_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_stale_timeout_secs)
    }

    pub fn client_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.client_heartbeat_interval_secs)
    }

    pub fn client_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.client_stale_timeout_secs)
    }

    pub fn queue_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.queue_sweep_interval_secs)
    }

    pub fn command_ttl(&self) -> Duration {
        Duration::from_millis(self.command_ttl_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn hmr_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.hmr_connect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runner_shared_secret: String::new(),
            use_ws_proxy: false,
            server_host: default_host(),
            server_port: default_port(),
            cors_origins: default_cors_origins(),
            batch_delay_ms: default_batch_delay_ms(),
            batch_max_entries: default_batch_max_entries(),
            runner_ping_interval_secs: default_runner_ping_interval(),
            runner_sweep_interval_secs: default_runner_sweep_interval(),
            runner_stale_timeout_secs: default_runner_stale_timeout(),
            client_heartbeat_interval_secs: default_client_heartbeat_interval(),
            client_stale_timeout_secs: default_client_stale_timeout(),
            queue_sweep_interval_secs: default_queue_sweep_interval(),
            max_queue_size: default_max_queue_size(),
            command_ttl_ms: default_command_ttl_ms(),
            max_delivery_attempts: default_max_delivery_attempts(),
            proxy_timeout_secs: default_proxy_timeout(),
            hmr_connect_timeout_secs: default_hmr_connect_timeout(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}
