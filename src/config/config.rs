//! Process-wide configuration, loaded once at startup from the environment.

use std::env;

use anyhow::{Context, Result};

/// Top-level configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub debug: bool,
    pub api: ApiConfiguration,
    pub store: StoreConfiguration,
    pub runtime: RuntimeConfiguration,
    pub governor: GovernorConfiguration,
    pub limits: LimitsConfiguration,
    pub auth: AuthConfiguration,
    pub reaper: ReaperConfiguration,
    pub log: LogConfiguration,
}

impl Configuration {
    /// Load configuration from environment variables, applying defaults
    /// for everything not explicitly set.
    pub fn load() -> Result<Self> {
        let config = Self {
            debug: env_bool("DEBUG", false),
            api: ApiConfiguration {
                host: env_string("API_HOST", "0.0.0.0"),
                port: env_parse("PORT", 8080)?,
            },
            store: StoreConfiguration {
                database_path: env_string("DATABASE_PATH", "./tee-core.sqlite3"),
            },
            runtime: RuntimeConfiguration {
                docker_socket: env::var("DOCKER_SOCKET").ok(),
                image_deno: env_string("RUNTIME_IMAGE_DENO", "tee-core/deno-runtime:latest"),
                image_node: env_string("RUNTIME_IMAGE_NODE", "tee-core/node-runtime:latest"),
                relaxed_isolation: env_bool("DISABLE_GVISOR", false),
            },
            governor: GovernorConfiguration {
                setup_concurrency: env_parse("SETUP_CONCURRENCY", 10)?,
                execution_concurrency: env_parse("EXECUTION_CONCURRENCY", 50)?,
            },
            limits: LimitsConfiguration {
                default_timeout_ms: env_parse("DEFAULT_TIMEOUT_MS", 5_000)?,
                default_memory_mb: env_parse("DEFAULT_MEMORY_MB", 128)?,
                max_timeout_ms: env_parse("MAX_TIMEOUT_MS", 60_000)?,
                max_memory_mb: env_parse("MAX_MEMORY_MB", 512)?,
            },
            auth: AuthConfiguration {
                bearer_token: env::var("BEARER_TOKEN").unwrap_or_default(),
                disabled: env_bool("DISABLE_BEARER_TOKEN", false),
            },
            reaper: ReaperConfiguration {
                interval_secs: env_parse("REAP_INTERVAL_SECS", 300)?,
            },
            log: LogConfiguration {
                level: env_string("LOG_LEVEL", "info"),
                json: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
            },
        };

        if !config.auth.disabled && config.auth.bearer_token.is_empty() {
            anyhow::bail!(
                "BEARER_TOKEN must be set unless DISABLE_BEARER_TOKEN=true"
            );
        }

        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfiguration {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StoreConfiguration {
    pub database_path: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfiguration {
    pub docker_socket: Option<String>,
    pub image_deno: String,
    pub image_node: String,
    pub relaxed_isolation: bool,
}

#[derive(Debug, Clone)]
pub struct GovernorConfiguration {
    pub setup_concurrency: usize,
    pub execution_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct LimitsConfiguration {
    pub default_timeout_ms: u64,
    pub default_memory_mb: u64,
    pub max_timeout_ms: u64,
    pub max_memory_mb: u64,
}

#[derive(Debug, Clone)]
pub struct AuthConfiguration {
    pub bearer_token: String,
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct ReaperConfiguration {
    pub interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfiguration {
    pub level: String,
    pub json: bool,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}", name)),
        Err(_) => Ok(default),
    }
}
