//! Crawler configuration.
//!
//! Every knob is an environment variable with a default, read once at
//! startup into a typed config. Interval values are seconds.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{ensure, Context, Result};

/// Upstream API parameters.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Scheme + host, no trailing slash (e.g. `https://feed.example.com`).
    pub host: String,
    pub version: String,
    /// Page size requested from the feed.
    pub limit: u32,
    pub mode: String,
    pub opt_fields: Vec<String>,
    /// Optional bearer token forwarded as `Authorization`.
    pub token: Option<String>,
    pub user_agent: String,
    /// Default resource path segment (e.g. `tenders`).
    pub resource: String,
}

impl ApiConfig {
    /// `{host}/api/{version}`
    pub fn base_url(&self) -> String {
        format!("{}/api/{}", self.host, self.version)
    }

    /// `{host}/api/{version}/{resource}`
    pub fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url(), resource)
    }
}

/// Fixed retry/back-off intervals. All waits are flat, never exponential.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause between successful feed pages and after 412/unexpected errors.
    pub feed_step: Duration,
    /// Back-off after HTTP 429.
    pub too_many_requests: Duration,
    /// Back-off after transport or JSON decode errors.
    pub connection_error: Duration,
    /// Extra pause when a page came back shorter than `limit` (feed at tail).
    pub no_items: Duration,
    /// Back-off between position-store retries.
    pub db_error: Duration,
    /// Bounded retries for single-resource GETs before surrendering.
    pub get_error_retries: u32,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub url: String,
    pub database: String,
    pub state_collection: String,
    pub state_id: String,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub password: String,
    pub state_table: String,
    pub state_id: String,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub enabled: bool,
    pub collection: String,
    /// Lock record key. One live crawler per process name.
    pub process_name: String,
    pub expire_time: Duration,
    pub update_time: Duration,
    pub acquire_interval: Duration,
}

/// Operator-supplied bootstrap offsets. When both are present the
/// supervisor starts from them instead of probing the feed head.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOffsets {
    pub forward: Option<String>,
    pub backward: Option<String>,
}

impl BootstrapOffsets {
    pub fn both(&self) -> Option<(String, String)> {
        match (&self.forward, &self.backward) {
            (Some(f), Some(b)) => Some((f.clone(), b.clone())),
            _ => None,
        }
    }
}

/// Date-modified latch behavior (backward stop barrier).
#[derive(Debug, Clone)]
pub struct DateModifiedLockConfig {
    pub enabled: bool,
    /// Statuses whose `dateModified` is unreliable for position tracking.
    pub skip_statuses: HashSet<String>,
    pub margin_seconds: i64,
}

/// Forward-loop cooldown on offset age. Zero disables it.
#[derive(Debug, Clone)]
pub struct ForwardCooldown {
    pub cooldown: Duration,
    pub sleep: Duration,
}

impl ForwardCooldown {
    pub fn enabled(&self) -> bool {
        !self.cooldown.is_zero()
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub api: ApiConfig,
    pub retry: RetryPolicy,
    pub mongo: Option<MongoConfig>,
    pub postgres: Option<PostgresConfig>,
    pub lock: LockConfig,
    pub bootstrap: BootstrapOffsets,
    pub date_modified_lock: DateModifiedLockConfig,
    pub forward_cooldown: ForwardCooldown,
}

const DEFAULT_USER_AGENT: &str = "Feed Crawler 1.0";
const DEFAULT_MONGO_STATE_ID: &str = "FEED_CRAWLER_STATE";
const DEFAULT_PG_STATE_ID: &str = "crawler_state";
const DEFAULT_LOCK_PROCESS_NAME: &str = "crawler_lock";

impl CrawlerConfig {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let host = env_string("API_HOST", "https://public-api-sandbox.example.org");
        validate_host(&host)?;

        let mongo_url = env_string("MONGODB_URL", "");
        let postgres_host = env_string("POSTGRES_HOST", "");

        let user_agent = env_string("CRAWLER_USER_AGENT", DEFAULT_USER_AGENT);
        if user_agent == DEFAULT_USER_AGENT {
            tracing::warn!(
                "Using default '{}' as crawler user agent. \
                 Set CRAWLER_USER_AGENT to identify this crawler.",
                user_agent
            );
        }

        let api = ApiConfig {
            host,
            version: env_string("API_VERSION", "2.5"),
            limit: env_u64("API_LIMIT", 100)? as u32,
            mode: env_string("API_MODE", "_all_"),
            opt_fields: split_csv(&env_string("API_OPT_FIELDS", "")),
            token: non_empty(env_string("API_TOKEN", "")),
            user_agent,
            resource: env_string("API_RESOURCE", "tenders"),
        };

        let retry = RetryPolicy {
            feed_step: Duration::from_secs(env_u64("FEED_STEP_INTERVAL", 0)?),
            too_many_requests: Duration::from_secs(env_u64("TOO_MANY_REQUESTS_INTERVAL", 10)?),
            connection_error: Duration::from_secs(env_u64("CONNECTION_ERROR_INTERVAL", 5)?),
            no_items: Duration::from_secs(env_u64("NO_ITEMS_INTERVAL", 15)?),
            db_error: Duration::from_secs(env_u64("DB_ERROR_INTERVAL", 5)?),
            get_error_retries: env_u64("GET_ERROR_RETRIES", 5)? as u32,
        };

        let mongo = non_empty(mongo_url).map(|url| {
            let state_id = env_string("MONGODB_STATE_ID", DEFAULT_MONGO_STATE_ID);
            warn_default_conflict("MONGODB_STATE_ID", &state_id, DEFAULT_MONGO_STATE_ID);
            MongoConfig {
                url,
                database: env_string("MONGODB_DATABASE", "feed-crawler"),
                state_collection: env_string("MONGODB_STATE_COLLECTION", "feed-crawler-state"),
                state_id,
            }
        });

        let postgres = non_empty(postgres_host)
            .map(|host| {
                let state_id = env_string("POSTGRES_STATE_ID", DEFAULT_PG_STATE_ID);
                warn_default_conflict("POSTGRES_STATE_ID", &state_id, DEFAULT_PG_STATE_ID);
                Ok::<_, anyhow::Error>(PostgresConfig {
                    host,
                    port: env_u64("POSTGRES_PORT", 5432)? as u16,
                    db: env_string("POSTGRES_DB", "feed-crawler"),
                    user: env_string("POSTGRES_USER", "agent"),
                    password: env_string("POSTGRES_PASSWORD", ""),
                    state_table: env_string("POSTGRES_STATE_TABLE", "crawler_state"),
                    state_id,
                })
            })
            .transpose()?;

        let lock_enabled = env_bool("LOCK_ENABLED");
        let process_name = env_string("LOCK_PROCESS_NAME", DEFAULT_LOCK_PROCESS_NAME);
        if lock_enabled {
            warn_default_conflict("LOCK_PROCESS_NAME", &process_name, DEFAULT_LOCK_PROCESS_NAME);
        }
        let lock = LockConfig {
            enabled: lock_enabled,
            collection: env_string("LOCK_COLLECTION_NAME", "process_lock"),
            process_name,
            expire_time: Duration::from_secs(env_u64("LOCK_EXPIRE_TIME", 60)?),
            update_time: Duration::from_secs(env_u64("LOCK_UPDATE_TIME", 30)?),
            acquire_interval: Duration::from_secs(env_u64("LOCK_ACQUIRE_INTERVAL", 10)?),
        };

        let bootstrap = BootstrapOffsets {
            forward: non_empty(env_string("FORWARD_OFFSET", "")),
            backward: non_empty(env_string("BACKWARD_OFFSET", "")),
        };

        let date_modified_lock = DateModifiedLockConfig {
            enabled: env_bool("DATE_MODIFIED_LOCK_ENABLED"),
            skip_statuses: split_csv(&env_string("DATE_MODIFIED_SKIP_STATUSES", ""))
                .into_iter()
                .collect(),
            margin_seconds: env_u64("DATE_MODIFIED_MARGIN_SECONDS", 0)? as i64,
        };

        let cooldown = Duration::from_secs(env_u64("FORWARD_CHANGES_COOLDOWN_SECONDS", 0)?);
        let forward_cooldown = ForwardCooldown {
            sleep: Duration::from_secs(env_u64(
                "SLEEP_FORWARD_CHANGES_SECONDS",
                cooldown.as_secs(),
            )?),
            cooldown,
        };

        Ok(Self {
            api,
            retry,
            mongo,
            postgres,
            lock,
            bootstrap,
            date_modified_lock,
            forward_cooldown,
        })
    }

    /// Apply caller overrides (only when present).
    pub fn with_overrides(mut self, resource: Option<&str>, opt_fields: Option<&[String]>) -> Self {
        if let Some(r) = resource {
            self.api.resource = r.to_string();
        }
        if let Some(fields) = opt_fields {
            self.api.opt_fields = fields.to_vec();
        }
        self
    }
}

#[cfg(test)]
impl CrawlerConfig {
    /// Baseline config for tests: zeroed intervals, no backends, no lock.
    pub(crate) fn test_default() -> Self {
        Self {
            api: ApiConfig {
                host: "http://127.0.0.1:1".to_string(),
                version: "2.5".to_string(),
                limit: 100,
                mode: "_all_".to_string(),
                opt_fields: vec![],
                token: None,
                user_agent: "test-crawler".to_string(),
                resource: "tenders".to_string(),
            },
            retry: RetryPolicy {
                feed_step: Duration::ZERO,
                too_many_requests: Duration::ZERO,
                connection_error: Duration::ZERO,
                no_items: Duration::ZERO,
                db_error: Duration::ZERO,
                get_error_retries: 5,
            },
            mongo: None,
            postgres: None,
            lock: LockConfig {
                enabled: false,
                collection: "process_lock".to_string(),
                process_name: "crawler_lock".to_string(),
                expire_time: Duration::from_secs(60),
                update_time: Duration::from_secs(30),
                acquire_interval: Duration::from_secs(10),
            },
            bootstrap: BootstrapOffsets::default(),
            date_modified_lock: DateModifiedLockConfig {
                enabled: false,
                skip_statuses: HashSet::new(),
                margin_seconds: 0,
            },
            forward_cooldown: ForwardCooldown {
                cooldown: Duration::ZERO,
                sleep: Duration::ZERO,
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be an integer, got {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(raw) => parse_bool(&raw),
        Err(_) => false,
    }
}

pub(crate) fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub(crate) fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

pub(crate) fn validate_host(host: &str) -> Result<()> {
    ensure!(host.starts_with("http"), "API_HOST must start with http");
    ensure!(!host.ends_with('/'), "API_HOST must not end with '/'");
    Ok(())
}

fn warn_default_conflict(key: &str, value: &str, default: &str) {
    if value == default {
        tracing::warn!(
            "Environment variable {} kept its default '{}'. \
             Rename it per process if several crawlers share one database.",
            key,
            default
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_bool_accepts_common_truthy_values() {
        for raw in ["1", "true", "True", "YES", "on"] {
            assert!(parse_bool(raw), "{:?} should be true", raw);
        }
        for raw in ["", "0", "false", "off", "no"] {
            assert!(!parse_bool(raw), "{:?} should be false", raw);
        }
    }

    #[test]
    fn test_split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv("a, b ,,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(split_csv(""), Vec::<String>::new());
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("https://api.example.org").is_ok());
        assert!(validate_host("ftp://api.example.org").is_err());
        assert!(validate_host("https://api.example.org/").is_err());
    }

    #[test]
    fn test_resource_url_layout() {
        let api = ApiConfig {
            host: "https://api.example.org".to_string(),
            version: "2.5".to_string(),
            limit: 100,
            mode: "_all_".to_string(),
            opt_fields: vec![],
            token: None,
            user_agent: "test".to_string(),
            resource: "tenders".to_string(),
        };
        assert_eq!(api.base_url(), "https://api.example.org/api/2.5");
        assert_eq!(
            api.resource_url("tenders"),
            "https://api.example.org/api/2.5/tenders"
        );
    }

    #[test]
    fn test_bootstrap_requires_both_offsets() {
        let none = BootstrapOffsets::default();
        assert_eq!(none.both(), None);

        let only_backward = BootstrapOffsets {
            forward: None,
            backward: Some("b".to_string()),
        };
        assert_eq!(only_backward.both(), None);

        let both = BootstrapOffsets {
            forward: Some("f".to_string()),
            backward: Some("b".to_string()),
        };
        assert_eq!(both.both(), Some(("f".to_string(), "b".to_string())));
    }
}
