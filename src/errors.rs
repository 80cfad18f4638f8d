//! Error taxonomy for the control plane.
//!
//! Library code returns these; command handlers print
//! `Error [<Kind>]: <message>` to stderr and exit 1.

use thiserror::Error;

/// Top-level error for every command path.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file missing, unparseable, or invariant-violating.
    #[error("{0}")]
    Config(String),

    /// A validation gate rejected the request before any side effect.
    #[error("{0}")]
    Validation(String),

    /// Subprocess or agent identity problem (tmux, claude, pid walks).
    #[error("{0}")]
    Agent(String),

    /// Mail broker failure.
    #[error("{0}")]
    Mail(String),

    /// Merge engine failure.
    #[error("{0}")]
    Merge(String),

    /// Git worktree failure.
    #[error("{0}")]
    Worktree(String),

    /// External issue tracker (`bd`) failure.
    #[error("{0}")]
    Beads(String),

    /// Embedded SQL store failure.
    #[error("{0}")]
    Store(String),
}

impl Error {
    /// Stable code printed in brackets on stderr.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "Config",
            Error::Validation(_) => "Validation",
            Error::Agent(_) => "Agent",
            Error::Mail(_) => "Mail",
            Error::Merge(_) => "Merge",
            Error::Worktree(_) => "Worktree",
            Error::Beads(_) => "Beads",
            Error::Store(_) => "Store",
        }
    }

    /// Build a validation error carrying the failing field name.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Error::Validation(format!("{}: {}", field, message.into()))
    }

    /// Format the one-line stderr report.
    pub fn report(&self) -> String {
        format!("Error [{}]: {}", self.kind(), self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Agent(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_format() {
        let err = Error::Validation("agent name 'alice' is already active".to_string());
        assert_eq!(
            err.report(),
            "Error [Validation]: agent name 'alice' is already active"
        );
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(Error::Config(String::new()).kind(), "Config");
        assert_eq!(Error::Merge(String::new()).kind(), "Merge");
        assert_eq!(Error::Beads(String::new()).kind(), "Beads");
    }

    #[test]
    fn test_validation_helper_includes_field() {
        let err = Error::validation("depth", "exceeds maxDepth");
        assert!(err.to_string().contains("depth"));
        assert!(err.to_string().contains("exceeds maxDepth"));
    }
}
