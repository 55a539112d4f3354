use std::time::Duration;

use annexb2_common::{normalize_prefix, Credentials};

use crate::host::Host;

pub const DEFAULT_RETRIES: u32 = 1;

/// Environment lookup used during resolution. Empty values count as unset.
pub type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Read a variable from the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("You must set accountid to the backblaze account id")]
    MissingAccountId,
    #[error("You must set appkey to the backblaze application key")]
    MissingAppKey,
    #[error("You must set bucket to the bucket name")]
    MissingBucket,
    #[error("invalid {setting} {value:?}: {reason}")]
    Invalid {
        setting: &'static str,
        value: String,
        reason: String,
    },
    #[error("couldn't read configuration from git-annex: {0}")]
    Host(#[from] anyhow::Error),
}

/// Full-snapshot cache policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    /// Snapshot lifetime. `None` means a snapshot never expires.
    pub ttl: Option<Duration>,
}

/// Validated settings for one remote.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub credentials: Credentials,
    pub bucket: String,
    /// Empty or ending with `/`.
    pub prefix: String,
    pub retries: u32,
    pub cache: CachePolicy,
}

impl RemoteSettings {
    /// Resolve and validate every setting. No network access happens here, so
    /// a misconfigured remote fails before talking to B2.
    pub async fn resolve(host: &dyn Host, env: &EnvLookup) -> Result<Self, ConfigError> {
        let credentials = resolve_credentials(host, env).await?;
        let (bucket, prefix) = resolve_bucket(host).await?;

        let retries = match env_or_config(host, env, "B2_RETRY_COUNT", "retry-count").await? {
            Some(s) => parse_retries(&s)?,
            None => DEFAULT_RETRIES,
        };

        let enabled = match env_or_config(host, env, "B2_CACHE_FILENAMES", "cache-filenames").await? {
            Some(s) => parse_bool(&s).ok_or_else(|| ConfigError::Invalid {
                setting: "cache-filenames",
                value: s.clone(),
                reason: "expected a boolean".to_string(),
            })?,
            None => false,
        };

        let ttl = match env_or_config(
            host,
            env,
            "B2_CACHE_FILENAMES_DURATION",
            "cache-filenames-duration",
        )
        .await?
        {
            Some(s) => parse_cache_ttl(&s).map_err(|reason| ConfigError::Invalid {
                setting: "cache-filenames-duration",
                value: s.clone(),
                reason,
            })?,
            None => None,
        };

        Ok(Self {
            credentials,
            bucket,
            prefix,
            retries,
            cache: CachePolicy { enabled, ttl },
        })
    }
}

/// Credentials come from git-annex first and fall back to `B2_*` variables.
async fn resolve_credentials(host: &dyn Host, env: &EnvLookup) -> Result<Credentials, ConfigError> {
    let (mut key_id, mut app_key) = host.get_creds("appkey").await?;

    if app_key.is_empty() {
        app_key = host.get_config("appkey").await?;
    }
    if app_key.is_empty() {
        app_key = env("B2_APP_KEY").unwrap_or_default();
    }
    if app_key.is_empty() {
        return Err(ConfigError::MissingAppKey);
    }

    if key_id.is_empty() {
        key_id = host.get_config("appkeyid").await?;
    }
    if key_id.is_empty() {
        key_id = env("B2_KEY_ID").unwrap_or_default();
    }

    let mut account_id = host.get_config("accountid").await?;
    if account_id.is_empty() {
        account_id = env("B2_ACCOUNT_ID").unwrap_or_default();
    }
    // An application key id authenticates on its own; the account id is
    // learned from authorization.
    if account_id.is_empty() && key_id.is_empty() {
        return Err(ConfigError::MissingAccountId);
    }

    Ok(Credentials { account_id, key_id, app_key })
}

async fn resolve_bucket(host: &dyn Host) -> Result<(String, String), ConfigError> {
    let bucket = host.get_config("bucket").await?;
    if bucket.is_empty() {
        return Err(ConfigError::MissingBucket);
    }
    let prefix = normalize_prefix(&host.get_config("prefix").await?);
    Ok((bucket, prefix))
}

/// Tuning settings prefer the environment so a single invocation can be
/// adjusted without touching the stored remote configuration.
async fn env_or_config(
    host: &dyn Host,
    env: &EnvLookup,
    var: &str,
    setting: &str,
) -> Result<Option<String>, ConfigError> {
    if let Some(v) = env(var) {
        return Ok(Some(v));
    }
    let v = host.get_config(setting).await?;
    Ok(if v.is_empty() { None } else { Some(v) })
}

fn parse_retries(s: &str) -> Result<u32, ConfigError> {
    s.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
        setting: "retry-count",
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// Accepts the same spellings as git-annex's Go-based remotes.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a snapshot TTL: a bare number of seconds, or a duration string such
/// as `90s`, `1h30m` or `1.5h`. Zero means no expiry.
pub fn parse_cache_ttl(s: &str) -> Result<Option<Duration>, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        if secs < 0 {
            return Err("cache duration must be non-negative".to_string());
        }
        return Ok(nonzero(Duration::from_secs(secs as u64)));
    }

    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_end);
        let value: f64 = match num {
            "" | "." => return Err(format!("missing number in {:?}", s)),
            n => n.parse().map_err(|_| format!("bad number {:?}", n))?,
        };

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in {:?}", s)),
            other => return Err(format!("unknown unit {:?}", other)),
        };
        total_nanos += value * scale;
        rest = tail;
    }

    if negative && total_nanos > 0.0 {
        return Err("cache duration must be non-negative".to_string());
    }
    Ok(nonzero(Duration::from_nanos(total_nanos as u64)))
}

fn nonzero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}
