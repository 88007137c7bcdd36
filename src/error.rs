use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Everything the sealing workflows can fail with.
///
/// Input errors are raised before any resource exists. Provisioning and
/// wait errors propagate through the workflow and trigger the cleanup
/// sweep. Encryptor failure codes map onto their own variants so callers
/// can tell an unsupported guest apart from a permissions problem.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("cloud api error: {0}")]
    Api(String),

    #[error("timed out waiting for {what} to reach the {target} state")]
    WaitTimeout { what: String, target: String },

    #[error("{what} is in the {state} state, cannot proceed")]
    UnexpectedState { what: String, state: String },

    #[error("snapshots in error state: {0:?}, cannot continue")]
    SnapshotFailed(Vec<String>),

    #[error("the guest image uses an unsupported operating system")]
    UnsupportedGuest,

    #[error("the attached IAM profile has insufficient permissions")]
    AwsPermissions,

    #[error("invalid NTP servers provided")]
    InvalidNtpServers,

    #[error("encryption failed")]
    EncryptionFailed { console_log: Option<PathBuf> },

    #[error("encryption service unavailable")]
    ServiceUnavailable,

    #[error("no encryption progress for longer than {0:?}")]
    ProgressTimeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
