use std::path::PathBuf;
use std::time::Duration;

use crate::{
    ledger::LedgerSettings,
    worker::{SupervisorSettings, MIN_RESTART_GRACE},
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway binds to
    pub bind: String,
    /// Port the gateway listens on
    pub port: u16,
    /// URL workers use to reach the internal webhook
    pub public_url: String,
    /// Ttl for call ids that never set one
    pub call_ttl: Duration,
    /// How often the ledger sweep runs
    pub sweep_interval: Duration,
    /// Pause between terminating a worker and forking its replacement
    pub restart_grace: Duration,
    /// Timeout for commands forwarded to workers
    pub forward_timeout: Duration,
    /// Separator between worker id and the rest of a call id
    pub owner_delimiter: String,
    /// TOML secret store consulted by setEnv; none when unset
    pub secrets_file: Option<PathBuf>,
    /// TOML manifest of workers forked at boot; none when unset
    pub workers_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let restart_grace = Duration::from_millis(env_parse(
            "RESTART_GRACE_MS",
            MIN_RESTART_GRACE.as_millis() as u64,
        )?);
        if restart_grace < MIN_RESTART_GRACE {
            tracing::warn!(
                requested_ms = restart_grace.as_millis() as u64,
                "RESTART_GRACE_MS below minimum, clamping to {}ms",
                MIN_RESTART_GRACE.as_millis()
            );
        }

        let port = env_parse("GATEWAY_PORT", 4005)?;
        Ok(Self {
            bind: env_str("GATEWAY_BIND", "0.0.0.0"),
            port,
            public_url: env_str("GATEWAY_PUBLIC_URL", &format!("http://127.0.0.1:{port}")),
            call_ttl: Duration::from_millis(env_parse("CALL_TTL_MS", 5 * 60 * 1000)?),
            sweep_interval: Duration::from_millis(env_parse("SWEEP_INTERVAL_MS", 30 * 1000)?),
            restart_grace: restart_grace.max(MIN_RESTART_GRACE),
            forward_timeout: Duration::from_secs(env_parse("FORWARD_TIMEOUT_SECS", 120)?),
            owner_delimiter: env_str("CALL_OWNER_DELIMITER", ":"),
            secrets_file: env_path("SECRETS_FILE"),
            workers_file: env_path("WORKERS_FILE"),
        })
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            default_ttl: self.call_ttl,
            sweep_interval: self.sweep_interval,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            forward_timeout: self.forward_timeout,
            gateway_url: Some(self.public_url.clone()),
            ..SupervisorSettings::default()
        }
        .with_restart_grace(self.restart_grace)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_to_default() {
        let port: u16 = env_parse("GATEWAY_TEST_UNSET_PORT", 4005).unwrap();
        assert_eq!(port, 4005);
    }

    #[test]
    fn test_supervisor_settings_clamp_grace() {
        let config = Config {
            bind: "127.0.0.1".to_string(),
            port: 0,
            public_url: "http://127.0.0.1:4005".to_string(),
            call_ttl: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
            restart_grace: Duration::from_millis(10),
            forward_timeout: Duration::from_secs(5),
            owner_delimiter: ":".to_string(),
            secrets_file: None,
            workers_file: None,
        };
        let settings = config.supervisor_settings();
        assert_eq!(settings.restart_grace, MIN_RESTART_GRACE);
        assert_eq!(settings.forward_timeout, Duration::from_secs(5));
        assert_eq!(settings.gateway_url.as_deref(), Some("http://127.0.0.1:4005"));
        assert_eq!(config.ledger_settings().default_ttl, Duration::from_secs(1));
    }
}
