use thiserror::Error;

/// Longest diagnostic text ever shown to a user.
pub const MAX_DIAGNOSTIC_CHARS: usize = 250;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// Failure classes reported by the extraction backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("rate limited by the source platform")]
    RateLimited,

    #[error("the source platform asked for bot verification")]
    VerificationRequired,

    #[error("the source platform answered 403 Forbidden")]
    Forbidden,

    #[error("requested format is not available")]
    FormatUnavailable,

    #[error("output filename too long")]
    FilenameTooLong,

    #[error("unsupported url: {0}")]
    Unsupported(String),

    #[error("extraction timed out")]
    Timeout,

    #[error("extraction failed: {0}")]
    Failed(String),
}

impl ExtractError {
    /// Maps yt-dlp stderr output onto a failure class.
    pub fn classify(stderr: &str) -> Self {
        let low = stderr.to_lowercase();
        if low.contains("not a bot") {
            return Self::VerificationRequired;
        }
        if low.contains("http error 403") || low.contains("403 forbidden") {
            return Self::Forbidden;
        }
        if low.contains("http error 429") || low.contains("too many requests") {
            return Self::RateLimited;
        }
        if low.contains("requested format is not available") || low.contains("use --list-formats") {
            return Self::FormatUnavailable;
        }
        if low.contains("unsupported url") {
            return Self::Unsupported(truncate_diagnostic(stderr.trim()));
        }
        if low.contains("filename too long") {
            return Self::FilenameTooLong;
        }
        if low.contains("timed out") || low.contains("timeout") {
            return Self::Timeout;
        }
        Self::Failed(truncate_diagnostic(stderr.trim()))
    }

    /// Transient failures are worth a manual retry after a short wait.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout)
    }

    /// Retrying without new credentials or a different network identity will not help.
    pub fn needs_verification(&self) -> bool {
        matches!(self, Self::VerificationRequired | Self::Forbidden)
    }
}

/// Failures of the external transcode/bundle subprocesses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("{0} not found on PATH")]
    Missing(&'static str),

    #[error("{tool} failed: {stderr}")]
    Failed { tool: &'static str, stderr: String },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("no usable output: {0}")]
    NoOutput(String),
}

/// Failures reported by the messaging channel when delivering media.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport timed out")]
    Timeout,

    #[error("send failed: {0}")]
    Other(String),
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<teloxide::RequestError> for SendError {
    fn from(err: teloxide::RequestError) -> Self {
        match err {
            teloxide::RequestError::Network(net) if net.is_timeout() => Self::Timeout,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Terminal failures of one delivery request.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("selection expired")]
    ExpiredSelection,

    #[error("file too large: {size_mb}MB (limit {max_mb}MB)")]
    TooLarge { size_mb: u64, max_mb: u64 },

    #[error("file exceeds upload limit: {size_mb:.1}MB (limit {max_mb}MB)")]
    UploadLimit { size_mb: f64, max_mb: u64 },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cuts long diagnostics down to [`MAX_DIAGNOSTIC_CHARS`] characters.
pub fn truncate_diagnostic(text: &str) -> String {
    if text.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_DIAGNOSTIC_CHARS - 3).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_backend_failures() {
        assert_eq!(
            ExtractError::classify("ERROR: Sign in to confirm you’re not a bot"),
            ExtractError::VerificationRequired
        );
        assert_eq!(
            ExtractError::classify("ERROR: unable to download: HTTP Error 403: Forbidden"),
            ExtractError::Forbidden
        );
        assert_eq!(
            ExtractError::classify("HTTP Error 429: Too Many Requests"),
            ExtractError::RateLimited
        );
        assert_eq!(
            ExtractError::classify("Requested format is not available. Use --list-formats"),
            ExtractError::FormatUnavailable
        );
        assert_eq!(ExtractError::classify("read timed out"), ExtractError::Timeout);
        assert!(matches!(ExtractError::classify("boom"), ExtractError::Failed(_)));
    }

    #[test]
    fn transient_and_verification_classes_are_distinct() {
        assert!(ExtractError::RateLimited.is_transient());
        assert!(!ExtractError::RateLimited.needs_verification());
        assert!(ExtractError::Forbidden.needs_verification());
        assert!(!ExtractError::VerificationRequired.is_transient());
    }

    #[test]
    fn truncates_long_diagnostics() {
        let long = "x".repeat(400);
        let cut = truncate_diagnostic(&long);
        assert_eq!(cut.chars().count(), MAX_DIAGNOSTIC_CHARS);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_diagnostic("short"), "short");
    }
}
