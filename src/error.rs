//! Error handling for cookbridge
//!
//! Every failure in the crate is a [`CookError`]. The variants line up with
//! the failure classes the pipeline reacts to: recoverable remote failures,
//! session loss, configuration problems and user aborts. Use
//! [`CookError::outcome`] to get the class back.

use crate::engine::status::{Outcome, Step};
use crate::engine::ResultCode;
use crate::node::NodeKey;
use thiserror::Error;

/// Main error type for cookbridge operations
#[derive(Error, Debug)]
pub enum CookError {
    /// A remote call failed but the session is still usable
    #[error("{step} failed: {code}")]
    Remote { step: Step, code: ResultCode },

    /// The remote engine reported the session as invalid
    #[error("Session lost during {step}")]
    SessionLost { step: Step },

    /// The remote engine reported a user-interrupted operation
    #[error("{step} interrupted by user")]
    UserAbort { step: Step },

    /// No usable engine installation or invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The upstream-input graph contains a cycle
    #[error("Dependency cycle through {0}")]
    DependencyCycle(String),

    /// An upstream node failed and has not been re-triggered
    #[error("Upstream node '{0}' failed its last cook")]
    UpstreamFailed(String),

    /// Remote operations are in flight and edits are not allowed
    #[error("Engine busy: {0}")]
    Busy(String),

    /// No node with this key is registered
    #[error("Node {0} not found")]
    NodeNotFound(NodeKey),

    /// No asset library with this id is registered
    #[error("Asset library {0} not found")]
    AssetNotFound(u32),

    /// The asset library exposes no operators
    #[error("Asset library '{0}' has no operators")]
    NoOperators(String),

    /// The selected operator is not offered by the node's asset library
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),

    /// The node has no parameter with this name
    #[error("{node} has no parameter '{name}'")]
    ParameterNotFound { node: String, name: String },

    /// A worker task died before reporting its result
    #[error("Worker task failed: {0}")]
    Worker(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CookError>,
    },
}

impl CookError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CookError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify this error the same way a remote result code is classified.
    ///
    /// Context wrappers are looked through, so a session loss stays a
    /// session loss however many layers of context it collected.
    pub fn outcome(&self) -> Outcome {
        match self {
            CookError::SessionLost { .. } => Outcome::SessionLost,
            CookError::WithContext { source, .. } => source.outcome(),
            _ => Outcome::RecoverableFailure,
        }
    }

    /// Shorthand for `outcome() == Outcome::SessionLost`
    pub fn is_session_lost(&self) -> bool {
        self.outcome() == Outcome::SessionLost
    }

    /// The pipeline step this error was raised in, if any
    pub fn step(&self) -> Option<Step> {
        match self {
            CookError::Remote { step, .. }
            | CookError::SessionLost { step }
            | CookError::UserAbort { step } => Some(*step),
            CookError::WithContext { source, .. } => source.step(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CookError {
    fn from(err: serde_json::Error) -> Self {
        CookError::Serialization(err.to_string())
    }
}

/// Result type alias for cookbridge operations
pub type Result<T> = std::result::Result<T, CookError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CookError::Remote {
            step: Step::Cook,
            code: ResultCode::Failure,
        };
        assert_eq!(err.to_string(), "cook failed: failure");
    }

    #[test]
    fn test_error_with_context() {
        let err = CookError::Configuration("no engine".to_string());
        let with_ctx = err.with_context("Failed to start session");
        assert!(with_ctx.to_string().contains("Failed to start session"));
        assert!(with_ctx.to_string().contains("no engine"));
    }

    #[test]
    fn test_session_lost_survives_context() {
        let err = CookError::SessionLost {
            step: Step::Instantiate,
        }
        .with_context("sphere1")
        .with_context("pipeline");
        assert!(err.is_session_lost());
        assert_eq!(err.step(), Some(Step::Instantiate));
    }

    #[test]
    fn test_user_abort_is_recoverable() {
        let err = CookError::UserAbort { step: Step::Cook };
        assert_eq!(err.outcome(), Outcome::RecoverableFailure);
    }
}
