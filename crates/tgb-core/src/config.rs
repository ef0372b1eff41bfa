use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::SessionToken, errors::Error, Result};

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram application credentials
    pub api_id: i32,
    pub api_hash: String,
    pub session: Option<SessionToken>,

    // Protocol gateway
    pub gateway_url: String,
    pub request_timeout: Duration,

    // Persistence
    pub session_file: PathBuf,
    pub delivery_log_path: PathBuf,
    pub delivery_log_json: bool,

    // Bulk send defaults
    pub send_delay: Duration,
    pub default_message: Option<String>,
    pub default_image: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (tests pass a map instead of the env).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_id_raw = get("TELEGRAM_API_ID").unwrap_or_default();
        if api_id_raw.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_API_ID environment variable is required".to_string(),
            ));
        }
        let api_id = api_id_raw.trim().parse::<i32>().map_err(|_| {
            Error::Config(format!("TELEGRAM_API_ID must be numeric, got {api_id_raw:?}"))
        })?;

        let api_hash = get("TELEGRAM_API_HASH").unwrap_or_default();
        if api_hash.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_API_HASH environment variable is required".to_string(),
            ));
        }

        let session = get("TELEGRAM_SESSION")
            .and_then(non_empty)
            .map(SessionToken);

        let gateway_url = get("TGB_GATEWAY_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "http://127.0.0.1:8088".to_string())
            .trim_end_matches('/')
            .to_string();
        let request_timeout =
            Duration::from_millis(parse_u64(&get, "TGB_REQUEST_TIMEOUT_MS")?.unwrap_or(30_000));

        let session_file = PathBuf::from(
            get("TGB_SESSION_FILE").unwrap_or("/tmp/tgb-session.json".to_string()),
        );
        let delivery_log_path = PathBuf::from(
            get("TGB_DELIVERY_LOG").unwrap_or("/tmp/tgb-delivery.log".to_string()),
        );
        let delivery_log_json = get("TGB_DELIVERY_LOG_JSON")
            .map(|s| parse_bool(&s))
            .unwrap_or(true);

        let send_delay = Duration::from_millis(parse_u64(&get, "TGB_SEND_DELAY_MS")?.unwrap_or(3000));
        let default_message = get("TGB_DEFAULT_MESSAGE").and_then(non_empty);
        let default_image = get("TGB_DEFAULT_IMAGE")
            .and_then(non_empty)
            .map(PathBuf::from);

        Ok(Self {
            api_id,
            api_hash: api_hash.trim().to_string(),
            session,
            gateway_url,
            request_timeout,
            session_file,
            delivery_log_path,
            delivery_log_json,
            send_delay,
            default_message,
            default_image,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
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

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = get(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
