//! Error classification.
//!
//! Errors cross several boundaries (provider, queue, tool transport) before
//! they reach the orchestrator, so classification works on the rendered
//! error text rather than on concrete types.

use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Shown when the circuit breaker short-circuits a request.
pub const UNAVAILABLE_MESSAGE: &str =
    "The assistant is temporarily unavailable. Please try again in a minute.";

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Api,
    Tool,
    Validation,
    Storage,
    Unknown,
}

impl ErrorKind {
    /// Whether another attempt might succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Api)
    }

    /// Canned text safe to show the end user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Network => "Could not reach the service. Check your connection and try again.",
            Self::Api => "The service is busy right now. Please try again shortly.",
            Self::Tool => "A tool failed while handling your request.",
            Self::Validation => "That request could not be processed. Please check it and try again.",
            Self::Storage => "Local storage is unavailable or full.",
            Self::Unknown => "Something went wrong. Please try again.",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Api => "api",
            Self::Tool => "tool",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub user_message: &'static str,
    /// The original error text, for logs
    pub detail: String,
}

static RULES: LazyLock<Vec<(Regex, ErrorKind)>> = LazyLock::new(|| {
    [
        (
            r"(?i)network|timeout|timed out|connection refused|econnrefused",
            ErrorKind::Network,
        ),
        (r"(?i)rate.?limit|\b429\b|\b5\d\d\b", ErrorKind::Api),
        (r"(?i)tool|function", ErrorKind::Tool),
        (r"(?i)validation|invalid", ErrorKind::Validation),
        (r"(?i)storage|quota", ErrorKind::Storage),
    ]
    .into_iter()
    .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
    .collect()
});

/// Classify an error by its text. The first matching rule wins.
pub fn classify(error: &(impl fmt::Display + ?Sized)) -> ClassifiedError {
    let detail = error.to_string();
    let kind = RULES
        .iter()
        .find(|(re, _)| re.is_match(&detail))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown);

    ClassifiedError {
        kind,
        retryable: kind.is_retryable(),
        user_message: kind.user_message(),
        detail,
    }
}
