//! Error taxonomy for the supervision core.
//!
//! Monitor threads never let an error cross the thread boundary: cycle and
//! query failures are logged, counted, and absorbed at the point they occur.
//! `Controller::start` is the only operation that returns a hard failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("invalid profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("a session is already active")]
    AlreadyRunning,

    #[error("target window not found")]
    WindowNotFound,

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("vision failed: {0}")]
    Vision(String),

    #[error("input dispatch failed: {0}")]
    Input(String),

    #[error("safety query failed: {0}")]
    SafetyQuery(String),

    #[error("window query failed: {0}")]
    WindowQuery(String),

    #[error("{thread} thread did not exit within {timeout_ms}ms")]
    JoinTimeout {
        thread: &'static str,
        timeout_ms: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("profile parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = CoreError::ProfileNotFound("raid".to_string());
        assert_eq!(e.to_string(), "profile not found: raid");

        let e = CoreError::JoinTimeout {
            thread: "safety-supervisor",
            timeout_ms: 1500,
        };
        assert!(e.to_string().contains("safety-supervisor"));
        assert!(e.to_string().contains("1500"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: CoreError = io.into();
        assert!(matches!(e, CoreError::Io(_)));
    }
}
