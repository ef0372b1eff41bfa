/// Core error type for the broadcaster.
///
/// Adapter crates map their transport errors into this type so the dispatch loop
/// can tell a skip from a retryable throttle from a plain delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Contact input could not be parsed at all.
    #[error("contact source format error: {0}")]
    SourceFormat(String),

    #[error("no such user")]
    NoSuchUser,

    #[error("empty message")]
    EmptyMessage,

    #[error("FLOOD_WAIT: retry after {seconds}s")]
    RateLimited { seconds: u64 },

    /// Raw provider failure. `wait_seconds` is set when the provider attached a retry hint.
    #[error("{message}")]
    Provider {
        message: String,
        wait_seconds: Option<u64>,
    },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("auth challenge failed: {0}")]
    AuthChallenge(String),

    #[error("client is not authorized; run login first")]
    NotAuthorized,

    #[error("a bulk send is already running on this client")]
    AlreadyRunning,

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How the dispatch loop treats a failed delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Provider throttle; pause for `seconds` (+1) before moving on.
    RateLimit { seconds: u64 },
    /// Contact cannot receive this message; reported as skipped.
    Skip(String),
    /// Anything else; reported as an error outcome.
    Delivery(String),
}

impl Error {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            wait_seconds: None,
        }
    }

    pub fn classify(&self) -> FailureKind {
        match self {
            Error::RateLimited { seconds } => FailureKind::RateLimit { seconds: *seconds },
            Error::Provider {
                message,
                wait_seconds,
            } if message.contains("FLOOD_WAIT") => {
                match wait_seconds.or_else(|| flood_wait_seconds(message)) {
                    Some(seconds) => FailureKind::RateLimit { seconds },
                    None => FailureKind::Delivery(message.clone()),
                }
            }
            Error::NoSuchUser => FailureKind::Skip("no such user".to_string()),
            Error::EmptyMessage => FailureKind::Skip("empty message".to_string()),
            other => FailureKind::Delivery(other.to_string()),
        }
    }
}

/// Extract `N` from provider messages shaped like `FLOOD_WAIT_N` or `FLOOD_WAIT (N)`.
pub fn flood_wait_seconds(message: &str) -> Option<u64> {
    let re = regex::Regex::new(r"FLOOD_WAIT\D{0,3}(\d+)").ok()?;
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_structured_flood_wait() {
        let e = Error::Provider {
            message: "A wait of 5 seconds is required (FLOOD_WAIT)".to_string(),
            wait_seconds: Some(5),
        };
        assert_eq!(e.classify(), FailureKind::RateLimit { seconds: 5 });
    }

    #[test]
    fn parses_wait_from_message_when_field_missing() {
        let e = Error::provider("420: FLOOD_WAIT_17");
        assert_eq!(e.classify(), FailureKind::RateLimit { seconds: 17 });
    }

    #[test]
    fn flood_marker_without_seconds_is_plain_failure() {
        let e = Error::provider("FLOOD_WAIT");
        assert_eq!(e.classify(), FailureKind::Delivery("FLOOD_WAIT".to_string()));
    }

    #[test]
    fn wait_hint_without_marker_is_plain_failure() {
        let e = Error::Provider {
            message: "PEER_ID_INVALID".to_string(),
            wait_seconds: Some(3),
        };
        assert!(matches!(e.classify(), FailureKind::Delivery(_)));
    }

    #[test]
    fn skips_are_not_errors() {
        assert_eq!(
            Error::NoSuchUser.classify(),
            FailureKind::Skip("no such user".to_string())
        );
    }
}
