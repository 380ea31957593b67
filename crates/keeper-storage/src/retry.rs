use std::fmt;
use std::time::Duration;

use crate::RetryConfig;

/// Failure of one HTTP attempt, classified for the retry loop.
#[derive(Debug)]
pub enum HttpAttemptError {
    /// Request-level error from `ureq` (transport, status code).
    Http(Box<ureq::Error>),
    /// I/O error while streaming a request or response body.
    Io(std::io::Error),
    /// Never retried.
    Permanent(String),
}

impl HttpAttemptError {
    pub fn http(e: ureq::Error) -> Self {
        HttpAttemptError::Http(Box::new(e))
    }

    /// HTTP status code, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpAttemptError::Http(e) => match e.as_ref() {
                ureq::Error::Status(code, _) => Some(*code),
                ureq::Error::Transport(_) => None,
            },
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            HttpAttemptError::Http(e) => is_retryable_http(e),
            HttpAttemptError::Io(e) => is_retryable_io(e),
            HttpAttemptError::Permanent(_) => false,
        }
    }
}

impl fmt::Display for HttpAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpAttemptError::Http(e) => write!(f, "{e}"),
            HttpAttemptError::Io(e) => write!(f, "body I/O error: {e}"),
            HttpAttemptError::Permanent(msg) => f.write_str(msg),
        }
    }
}

impl From<std::io::Error> for HttpAttemptError {
    fn from(e: std::io::Error) -> Self {
        HttpAttemptError::Io(e)
    }
}

/// Run `f` until it succeeds, fails permanently, or retries run out.
///
/// Backoff doubles after every attempt, capped at `retry_max_delay_ms`, with
/// up to one extra delay of random jitter. Blocks the calling thread.
pub fn with_retry<T>(
    config: &RetryConfig,
    op_name: &str,
    provider: &str,
    f: impl Fn() -> std::result::Result<T, HttpAttemptError>,
) -> std::result::Result<T, HttpAttemptError> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0usize;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    provider,
                    op = op_name,
                    attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "transient error, retrying"
                );
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms.saturating_mul(2)).min(config.retry_max_delay_ms);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Transport failures, throttling and server errors are worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
