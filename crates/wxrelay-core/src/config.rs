use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    dispatcher::RetryPolicy,
    errors::Error,
    lifecycle::{CooldownPolicy, LifecycleTimings},
    policy::DEFAULT_MENTION_ALL_MARKERS,
    settings::BLOCKED_GROUPS_ENV,
    Result,
};

/// `.env` locations tried in order; the first readable file wins.
const DOTENV_PATHS: &[&str] = &[".env", "../.env", "/app/.env"];

/// Mail identities and relay credentials.
#[derive(Clone, Debug)]
pub struct MailConfig {
    pub from_name: String,
    pub from_address: String,
    pub to_name: String,
    pub to_address: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
}

/// Typed configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub mail: MailConfig,

    // Status surface
    pub http_port: u16,
    pub static_index: PathBuf,
    pub page_password: Option<String>,
    pub blocked_groups: Vec<String>,

    // Session bridge
    pub session_bridge_url: String,
    pub qr_url_prefix: String,

    // Forwarding
    pub mention_all_markers: Vec<String>,

    // Timing
    pub lifecycle: LifecycleTimings,
    pub group_settle: Duration,
    pub notify_retry: RetryPolicy,
}

impl Config {
    /// Load `.env` (without overriding the environment) and read the config.
    pub fn load() -> Result<Self> {
        for path in DOTENV_PATHS {
            if load_dotenv_if_present(Path::new(path)) {
                tracing::info!("loaded environment file {path}");
                break;
            }
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                Error::Config(format!("{key} environment variable is required"))
            })
        };

        let from_address = required("FROM_ADDRESS")?;
        let mail = MailConfig {
            from_name: get("FROM_NAME").unwrap_or_else(|| "wxrelay".to_string()),
            username: get("SMTP_USERNAME").unwrap_or_else(|| from_address.clone()),
            from_address,
            to_name: get("TO_NAME").unwrap_or_else(|| "operator".to_string()),
            to_address: required("TO_ADDRESS")?,
            smtp_server: required("SMTP_SERVER")?,
            smtp_port: parse_or(&get, "SMTP_PORT", 465)?,
            password: required("PASSWORD")?,
        };

        let blocked_groups = match get(BLOCKED_GROUPS_ENV) {
            Some(raw) => serde_json::from_str::<Vec<String>>(&raw).map_err(|e| {
                Error::Config(format!("{BLOCKED_GROUPS_ENV} must be a JSON array of strings: {e}"))
            })?,
            None => Vec::new(),
        };

        let mention_all_markers = get("MENTION_ALL_MARKERS")
            .map(|v| parse_csv(&v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_MENTION_ALL_MARKERS
                    .iter()
                    .map(|m| m.to_string())
                    .collect()
            });

        let lifecycle = LifecycleTimings {
            heartbeat_interval: Duration::from_secs(
                parse_or(&get, "HEARTBEAT_INTERVAL_SECS", 30u64)?.max(1),
            ),
            refresh_interval: Duration::from_secs(
                parse_or(&get, "GROUP_REFRESH_INTERVAL_SECS", 300u64)?.max(1),
            ),
            cooldown: CooldownPolicy {
                base: Duration::from_secs(parse_or(&get, "COOLDOWN_BASE_SECS", 60)?),
                cap: Duration::from_secs(parse_or(&get, "COOLDOWN_CAP_SECS", 300)?),
                ..CooldownPolicy::default()
            },
        };

        let notify_retry = RetryPolicy {
            max_attempts: parse_or(&get, "NOTIFY_MAX_ATTEMPTS", 3u32)?.max(1),
            delay: Duration::from_millis(parse_or(&get, "NOTIFY_RETRY_DELAY_MS", 2_000)?),
        };

        Ok(Self {
            mail,
            http_port: parse_or(&get, "PORT", 8080)?,
            static_index: PathBuf::from(
                get("STATIC_INDEX").unwrap_or_else(|| "static/index.html".to_string()),
            ),
            page_password: get("PAGE_PASSWORD"),
            blocked_groups,
            session_bridge_url: get("SESSION_BRIDGE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8081".to_string()),
            qr_url_prefix: get("QR_URL_PREFIX")
                .unwrap_or_else(|| "https://login.weixin.qq.com/qrcode/".to_string()),
            mention_all_markers,
            lifecycle,
            group_settle: Duration::from_millis(parse_or(&get, "GROUP_SETTLE_MS", 2_000)?),
            notify_retry,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{key}: invalid value {raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// Returns `true` if the file existed and was read.
fn load_dotenv_if_present(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
    true
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
