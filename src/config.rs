// src/config.rs
use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

const DEFAULT_JWT_SECRET: &str = "default-secret-key";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Absent means the process runs on the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub jwt_secret: String,
    pub trust_forwarded_for: bool,
    pub live: LiveConfig,
    pub cors_origin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub idle_timeout: Duration,
    pub buffer: usize,
    pub keep_alive: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(500),
            buffer: 16,
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let jwt_secret = var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, bearer tokens are checked against the default secret");
            DEFAULT_JWT_SECRET.to_string()
        });

        Self {
            port: try_load("PORT", "3030"),
            database_url: var("DATABASE_URL").ok(),
            db_max_connections: try_load("DB_MAX_CONNECTIONS", "5"),
            jwt_secret,
            trust_forwarded_for: try_load("TRUST_FORWARDED_FOR", "false"),
            live: LiveConfig {
                idle_timeout: Duration::from_secs(try_load("LIVE_IDLE_TIMEOUT_SECS", "500")),
                buffer: try_load::<usize>("LIVE_BUFFER", "16").max(1),
                keep_alive: Duration::from_secs(try_load("LIVE_KEEP_ALIVE_SECS", "15")),
            },
            cors_origin: var("CORS_ORIGIN").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            database_url: None,
            db_max_connections: 5,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            trust_forwarded_for: false,
            live: LiveConfig::default(),
            cors_origin: None,
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("Environment variable {key} not found");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}
