//! Shared primitives used across PixelDust crates.

/// Result alias used across the workspace.
pub type BrowserResult<T> = Result<T, BrowserError>;

/// Coded error for configuration, registration, and channel failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BrowserError {
    pub code: &'static str,
    pub message: String,
}

impl BrowserError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The two threads the custom-scheme subsystem cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    /// Runs application handler code.
    Control,
    /// Runs network loads.
    Io,
}

impl ThreadRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Io => "io",
        }
    }

    pub fn thread_name(self) -> String {
        format!("pd-{}", self.as_str())
    }
}
