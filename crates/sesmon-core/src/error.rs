use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the monitoring engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("device lookup failed: {0}")]
    DeviceLookupFailed(String),

    #[error("no devices configured")]
    NoDevices,

    #[error("{path}: not executable")]
    NotExecutable { path: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Generic(String),

    /// One failed command invocation together with the output it produced.
    #[error("execution failure: {source}: stdout=[{stdout}] stderr=[{stderr}]")]
    Execution {
        stdout: String,
        stderr: String,
        #[source]
        source: Box<Error>,
    },

    /// A retried operation that exhausted its attempts.
    #[error("[{attempt}/{attempts}] {source}")]
    Transient {
        attempt: u32,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn transient(attempt: u32, attempts: u32, source: Error) -> Self {
        Self::Transient {
            attempt,
            attempts,
            source: Box::new(source),
        }
    }

    /// Whether this error, or any error it wraps, is the invalid-JSON kind.
    pub fn is_invalid_json(&self) -> bool {
        match self {
            Self::InvalidJson(_) => true,
            Self::Execution { source, .. } | Self::Transient { source, .. } => {
                source.is_invalid_json()
            }
            _ => false,
        }
    }

    /// Whether this error, or any error it wraps, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Execution { source, .. } | Self::Transient { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_display_embeds_attempt_counter() {
        let err = Error::transient(2, 3, Error::io("spawn failed"));
        assert_eq!(err.to_string(), "[2/3] io error: spawn failed");
    }

    #[test]
    fn execution_display_embeds_captured_output() {
        let err = Error::Execution {
            stdout: "partial".into(),
            stderr: "boom".into(),
            source: Box::new(Error::InvalidJson("command stdout is not valid JSON".into())),
        };
        assert_eq!(
            err.to_string(),
            "execution failure: invalid JSON: command stdout is not valid JSON: \
             stdout=[partial] stderr=[boom]"
        );
    }

    #[test]
    fn invalid_json_detected_through_wrapping() {
        let inner = Error::Execution {
            stdout: String::new(),
            stderr: String::new(),
            source: Box::new(Error::InvalidJson("nope".into())),
        };
        let err = Error::transient(3, 3, inner);
        assert!(err.is_invalid_json());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancellation_detected_through_wrapping() {
        let err = Error::transient(1, 3, Error::Cancelled);
        assert!(err.is_cancelled());
        assert!(!err.is_invalid_json());
    }
}
