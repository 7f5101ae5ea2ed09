use std::fmt;
use std::str::FromStr;

use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};

/// Classified failure kinds stored on fetch attempts and discovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum ErrorKind {
    #[sqlx(rename = "TIMEOUT")]
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[sqlx(rename = "BLOCKED")]
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[sqlx(rename = "NOT_FOUND")]
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[sqlx(rename = "HTTP_4XX")]
    #[serde(rename = "HTTP_4XX")]
    Http4xx,
    #[sqlx(rename = "HTTP_5XX")]
    #[serde(rename = "HTTP_5XX")]
    Http5xx,
    #[sqlx(rename = "NETWORK")]
    #[serde(rename = "NETWORK")]
    Network,
    #[sqlx(rename = "PARSE_EMPTY")]
    #[serde(rename = "PARSE_EMPTY")]
    ParseEmpty,
    #[sqlx(rename = "CIRCUIT_OPEN")]
    #[serde(rename = "CIRCUIT_OPEN")]
    CircuitOpen,
    #[sqlx(rename = "AUTH_EXPIRED")]
    #[serde(rename = "AUTH_EXPIRED")]
    AuthExpired,
    #[sqlx(rename = "SEARCH_EMPTY")]
    #[serde(rename = "SEARCH_EMPTY")]
    SearchEmpty,
    #[sqlx(rename = "FETCH_BLOCKED")]
    #[serde(rename = "FETCH_BLOCKED")]
    FetchBlocked,
    #[sqlx(rename = "UNKNOWN")]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Blocked => "BLOCKED",
            Self::NotFound => "NOT_FOUND",
            Self::Http4xx => "HTTP_4XX",
            Self::Http5xx => "HTTP_5XX",
            Self::Network => "NETWORK",
            Self::ParseEmpty => "PARSE_EMPTY",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::SearchEmpty => "SEARCH_EMPTY",
            Self::FetchBlocked => "FETCH_BLOCKED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Kinds worth one bounded retry inside the gateway.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Http5xx)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TIMEOUT" => Ok(Self::Timeout),
            "BLOCKED" => Ok(Self::Blocked),
            "NOT_FOUND" => Ok(Self::NotFound),
            "HTTP_4XX" => Ok(Self::Http4xx),
            "HTTP_5XX" => Ok(Self::Http5xx),
            "NETWORK" => Ok(Self::Network),
            "PARSE_EMPTY" => Ok(Self::ParseEmpty),
            "CIRCUIT_OPEN" => Ok(Self::CircuitOpen),
            "AUTH_EXPIRED" => Ok(Self::AuthExpired),
            "SEARCH_EMPTY" => Ok(Self::SearchEmpty),
            "FETCH_BLOCKED" => Ok(Self::FetchBlocked),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(eyre!("Invalid error kind: {}", s)),
        }
    }
}

/// Outcome of one attempt against a candidate source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum FetchStatus {
    #[sqlx(rename = "SUCCESS")]
    #[serde(rename = "SUCCESS")]
    Success,
    #[sqlx(rename = "FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
    #[sqlx(rename = "SKIPPED")]
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// Circuit state for a (subscription, provider, url) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum HealthState {
    #[sqlx(rename = "CLOSED")]
    #[serde(rename = "CLOSED")]
    Closed,
    #[sqlx(rename = "OPEN")]
    #[serde(rename = "OPEN")]
    Open,
    #[sqlx(rename = "HALF_OPEN")]
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Source binding status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum SourceStatus {
    #[sqlx(rename = "PENDING")]
    #[serde(rename = "PENDING")]
    Pending,
    #[sqlx(rename = "ACTIVE")]
    #[serde(rename = "ACTIVE")]
    Active,
    #[sqlx(rename = "MATCH_FAILED")]
    #[serde(rename = "MATCH_FAILED")]
    MatchFailed,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::MatchFailed => "MATCH_FAILED",
        };
        write!(f, "{s}")
    }
}

/// Discovery outcome of a subscription within one run, and its sticky
/// per-subscription counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum DiscoveryStatus {
    #[sqlx(rename = "PENDING")]
    #[serde(rename = "PENDING")]
    Pending,
    #[sqlx(rename = "SUCCESS")]
    #[serde(rename = "SUCCESS")]
    Success,
    #[sqlx(rename = "DELAYED")]
    #[serde(rename = "DELAYED")]
    Delayed,
    #[sqlx(rename = "FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Delayed => "DELAYED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DiscoveryStatus {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "DELAYED" => Ok(Self::Delayed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(eyre!("Invalid discovery status: {}", s)),
        }
    }
}

/// Per-subscription outcome within a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum SyncItemStatus {
    #[sqlx(rename = "SUCCESS")]
    #[serde(rename = "SUCCESS")]
    Success,
    #[sqlx(rename = "FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
}

impl fmt::Display for SyncItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Whether a subscription's source binding is managed automatically or by the
/// operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum SourceMode {
    #[sqlx(rename = "auto")]
    #[serde(rename = "auto")]
    Auto,
    #[sqlx(rename = "manual")]
    #[serde(rename = "manual")]
    Manual,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Ordering applied to the day-scoped reader view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Source,
    Time,
    Recommend,
}

impl FromStr for ViewMode {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" => Ok(Self::Source),
            "time" => Ok(Self::Time),
            "recommend" => Ok(Self::Recommend),
            _ => Err(eyre!("Invalid view mode: {}", s)),
        }
    }
}

/// Typed failure crossing a provider boundary. Carries enough for the
/// gateway to classify and record without re-raising.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub http_code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_code: None,
            message: message.into(),
        }
    }

    pub fn with_code(kind: ErrorKind, http_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_code: Some(http_code),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Classify a transport error from the shared HTTP stack.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::new(ErrorKind::Timeout, err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_http_status(status.as_u16(), err.to_string());
        }
        if err.is_connect() || err.is_request() || err.is_redirect() {
            return Self::new(ErrorKind::Network, err.to_string());
        }
        Self::new(ErrorKind::Unknown, err.to_string())
    }

    pub fn from_http_status(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            401 | 403 => ErrorKind::Blocked,
            404 => ErrorKind::NotFound,
            400..=499 => ErrorKind::Http4xx,
            500..=599 => ErrorKind::Http5xx,
            _ => ErrorKind::Unknown,
        };
        Self::with_code(kind, code, message)
    }

    /// Heuristic classification for failures that only surface as text.
    pub fn from_message(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::new(ErrorKind::Unknown, "unknown error");
        }
        let lowered = trimmed.to_lowercase();
        if lowered.contains("timeout") || lowered.contains("timed out") {
            return Self::new(ErrorKind::Timeout, trimmed);
        }
        if lowered.contains("403") || lowered.contains("forbidden") {
            return Self::with_code(ErrorKind::Blocked, 403, trimmed);
        }
        if lowered.contains("404") || lowered.contains("not found") {
            return Self::with_code(ErrorKind::NotFound, 404, trimmed);
        }
        if lowered.contains("http") && lowered.contains('5') {
            return Self::new(ErrorKind::Http5xx, trimmed);
        }
        if lowered.contains("parse") || trimmed.contains("未解析到文章") {
            return Self::new(ErrorKind::ParseEmpty, trimmed);
        }
        Self::new(ErrorKind::Unknown, trimmed)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_round_trip() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::Blocked,
            ErrorKind::NotFound,
            ErrorKind::Http4xx,
            ErrorKind::Http5xx,
            ErrorKind::Network,
            ErrorKind::ParseEmpty,
            ErrorKind::CircuitOpen,
            ErrorKind::AuthExpired,
            ErrorKind::SearchEmpty,
            ErrorKind::FetchBlocked,
            ErrorKind::Unknown,
        ] {
            let parsed: ErrorKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_message_classification_heuristics() {
        assert_eq!(ProviderError::from_message("").kind, ErrorKind::Unknown);
        assert_eq!(
            ProviderError::from_message("connection timed out after 15s").kind,
            ErrorKind::Timeout
        );
        let blocked = ProviderError::from_message("server said 403 Forbidden");
        assert_eq!(blocked.kind, ErrorKind::Blocked);
        assert_eq!(blocked.http_code, Some(403));
        assert_eq!(
            ProviderError::from_message("feed not found").kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            ProviderError::from_message("HTTP 503 from upstream").kind,
            ErrorKind::Http5xx
        );
        assert_eq!(
            ProviderError::from_message("源可访问但未解析到文章").kind,
            ErrorKind::ParseEmpty
        );
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(ProviderError::from_http_status(401, "x").kind, ErrorKind::Blocked);
        assert_eq!(ProviderError::from_http_status(404, "x").kind, ErrorKind::NotFound);
        assert_eq!(ProviderError::from_http_status(418, "x").kind, ErrorKind::Http4xx);
        assert_eq!(ProviderError::from_http_status(502, "x").kind, ErrorKind::Http5xx);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Http5xx.is_retryable());
        assert!(!ErrorKind::Blocked.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }
}
