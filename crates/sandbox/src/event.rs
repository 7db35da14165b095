use std::fmt;
use std::time::Duration;

const MAX_DIAGNOSTIC_CHARS: usize = 200;

/// One item of the per-request output stream.
///
/// `Line` events arrive in the order the sandbox produced them. At most one of
/// the other variants follows, and it is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Line(String),
    Timeout(Duration),
    ExitCode(i32),
    InternalError(String),
}

impl OutputEvent {
    /// Builds an `InternalError` carrying only the first line of `message`,
    /// capped so nothing resembling a backtrace reaches the caller.
    pub fn internal(message: impl AsRef<str>) -> Self {
        let first = message.as_ref().lines().next().unwrap_or("").trim();
        let short: String = first.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
        Self::InternalError(short)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Line(_))
    }
}

impl fmt::Display for OutputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(text) => f.write_str(text),
            Self::Timeout(limit) => write!(f, "timeout: execution exceeded {limit:?}"),
            Self::ExitCode(code) => write!(f, "exit-code:{code}"),
            Self::InternalError(message) => write!(f, "internal-error: {message}"),
        }
    }
}
