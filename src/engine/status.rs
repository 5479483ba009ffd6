//! Status/result classification
//!
//! Exactly one result code means the session is gone. Everything else that is
//! not a success aborts the current operation only. Getting this wrong turns
//! one dead session into a stream of failures on every following call, so all
//! remote results pass through [`classify`] before anything acts on them.

use super::{RemoteResult, ResultCode};
use crate::error::{CookError, Result};
use std::fmt;

/// Classified outcome of a remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Continue
    Success,
    /// Log, abort this operation, keep the session
    RecoverableFailure,
    /// Invalidate the session; no further calls may be issued on it
    SessionLost,
}

/// Classify a remote result code
pub fn classify(code: ResultCode) -> Outcome {
    match code {
        ResultCode::Success => Outcome::Success,
        ResultCode::InvalidSession => Outcome::SessionLost,
        _ => Outcome::RecoverableFailure,
    }
}

/// Named step of the session or pipeline, used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    StartServer,
    Connect,
    Initialize,
    ServerEnv,
    CloseSession,
    Probe,
    LoadLibrary,
    ListOperators,
    Instantiate,
    DeleteNode,
    AssetInfo,
    Display,
    Transform,
    SubPipelines,
    ResolveStrings,
    UpdateParameters,
    UploadParameters,
    UploadInputs,
    Delta,
    Cook,
    ReadOutputs,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Step::StartServer => "start server",
            Step::Connect => "connect",
            Step::Initialize => "initialize",
            Step::ServerEnv => "server environment",
            Step::CloseSession => "close session",
            Step::Probe => "session probe",
            Step::LoadLibrary => "load library",
            Step::ListOperators => "list operators",
            Step::Instantiate => "instantiate",
            Step::DeleteNode => "delete node",
            Step::AssetInfo => "asset info",
            Step::Display => "display",
            Step::Transform => "transform",
            Step::SubPipelines => "sub-pipelines",
            Step::ResolveStrings => "resolve strings",
            Step::UpdateParameters => "update parameters",
            Step::UploadParameters => "upload parameters",
            Step::UploadInputs => "upload inputs",
            Step::Delta => "delta",
            Step::Cook => "cook",
            Step::ReadOutputs => "read outputs",
        };
        write!(f, "{}", text)
    }
}

/// Convert a failing result code into the matching [`CookError`]
pub fn to_error(code: ResultCode, step: Step) -> CookError {
    match classify(code) {
        Outcome::SessionLost => CookError::SessionLost { step },
        _ if code == ResultCode::UserInterrupted => CookError::UserAbort { step },
        _ => CookError::Remote { step, code },
    }
}

/// Tags raw remote results with the step they belong to
pub trait RemoteResultExt<T> {
    fn step(self, step: Step) -> Result<T>;
}

impl<T> RemoteResultExt<T> for RemoteResult<T> {
    fn step(self, step: Step) -> Result<T> {
        self.map_err(|code| to_error(code, step))
    }
}
